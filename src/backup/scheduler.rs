//! The tick loop that turns config entries into backups.
//!
//! Every pass reconciles persisted state with the configured games, then
//! runs one backup unit per due game on its own thread, capped by
//! `max_parallel_backups`. A pass failure flips the service status to
//! `Error: ...` and the loop keeps ticking; per-game failures only mark
//! that game and leave its slot due so the next pass retries it.

use crate::backup::archive::verify_paths;
use crate::backup::game::{GameEntry, GameRegistry};
use crate::backup::result_error::result::Result;
use crate::backup::retention::cleanup_old_backups;
use crate::backup::settings::{ArchiveSettings, SettingsProvider};
use crate::backup::shutdown::Shutdown;
use crate::backup::slots::SlotPool;
use crate::backup::special::process_special_backup;
use crate::backup::state::{GameStatus, StateStore};
use crate::backup::zip::create_archive;

use chrono::{Duration, Utc};
use rayon::ThreadPool;
use tracing::{debug, error, info, warn};

use std::sync::Arc;
use std::thread::JoinHandle;

/// Everything a pass needs, cheap to clone into worker threads.
#[derive(Clone)]
struct SchedulerCore {
    registry: Arc<dyn GameRegistry>,
    settings: Arc<dyn SettingsProvider>,
    state: Arc<StateStore>,
    entry_pool: Arc<ThreadPool>,
    shutdown: Shutdown,
}

impl SchedulerCore {
    fn run_loop(&self) {
        info!("Backup scheduler started");
        while !self.shutdown.is_requested() {
            let settings = self.settings.current();
            if let Err(e) = self.run_pass(&settings) {
                error!("Backup pass failed: {e}");
                self.state.set_service_status(format!("Error: {e}"));
            }
            let pause =
                std::time::Duration::from_secs(u64::from(*settings.scan_interval_minutes()) * 60);
            if !self.shutdown.sleep(pause) {
                break;
            }
        }
        info!("Backup scheduler stopped");
    }

    fn run_pass(&self, settings: &ArchiveSettings) -> Result<()> {
        let games = self.registry.load_games()?;
        if games.is_empty() {
            warn!("No games configured, nothing to back up");
            return Ok(());
        }

        let snapshot = self.state.update(|state| {
            state.service_status = "Running".to_string();
            state.retain_games(games.iter().map(|game| game.name().as_str()));
            for game in &games {
                let entry = state.ensure_game(game.name());
                entry.status = if *game.enabled() {
                    GameStatus::Waiting
                } else {
                    GameStatus::Disabled
                };
            }
            state.clone()
        });

        let now = Utc::now();
        let slots = SlotPool::new(*settings.max_parallel_backups() as usize);
        let mut workers: Vec<(String, JoinHandle<()>)> = Vec::new();

        for game in games.into_iter().filter(|game| *game.enabled()) {
            let due = snapshot
                .game(game.name())
                .and_then(|entry| entry.next_backup_scheduled)
                .is_none_or(|next| next <= now);
            if !due {
                debug!("Game {:?} is not due yet", game.name());
                continue;
            }

            if !self.registry.is_game_running(&game) {
                debug!("Game {:?} is not running, skipping", game.name());
                self.state.update(|state| {
                    state.ensure_game(game.name()).status = GameStatus::GameNotRunning;
                });
                continue;
            }

            let Some(slot) = slots.acquire(&self.shutdown) else {
                info!("Shutdown requested, leaving remaining games to the next run");
                break;
            };

            let core = self.clone();
            let settings = settings.clone();
            let name = game.name().clone();
            let worker_name = name.clone();
            workers.push((
                worker_name,
                std::thread::spawn(move || {
                    let _slot = slot;
                    core.run_backup(&name, &settings);
                }),
            ));
        }

        for (name, handle) in workers {
            if handle.join().is_err() {
                error!("Backup worker for game {name:?} panicked");
                self.state.update(|state| {
                    let entry = state.ensure_game(&name);
                    entry.status = GameStatus::Error;
                    entry.last_error = "backup worker panicked".to_string();
                });
            }
        }

        // Stamp the pass even when no game state changed.
        self.state.update(|_| {});
        Ok(())
    }

    /// One backup unit. Resolves the game fresh so a config edit made while
    /// the pass was queued still applies.
    fn run_backup(&self, name: &str, settings: &ArchiveSettings) {
        let Some(game) = self.registry.find_game(name) else {
            warn!("Game {name:?} vanished from the config, skipping");
            return;
        };

        info!("Backing up game {:?}", game.name());
        self.state.update(|state| {
            state.ensure_game(game.name()).status = GameStatus::Processing;
        });

        if !verify_paths(&game) {
            warn!("No usable source path for game {:?}", game.name());
            self.state.update(|state| {
                let entry = state.ensure_game(game.name());
                entry.status = GameStatus::PathError;
                entry.last_error = format!(
                    "no configured source path exists for game {:?}",
                    game.name()
                );
            });
            return;
        }

        match self.backup_once(&game, settings) {
            Ok(_) => {
                let now = Utc::now();
                let next = now + Duration::minutes(i64::from(*game.backup_interval_minutes()));
                self.state.update(|state| {
                    let entry = state.ensure_game(game.name());
                    entry.status = GameStatus::Success;
                    entry.last_backup_time = Some(now);
                    entry.next_backup_scheduled = Some(next);
                    entry.last_error.clear();
                });
            }
            Err(e) => {
                error!("Backup of game {:?} failed: {e}", game.name());
                // next_backup_scheduled is left alone, so the game stays due
                // and the next pass retries it.
                self.state.update(|state| {
                    let entry = state.ensure_game(game.name());
                    entry.status = GameStatus::Error;
                    entry.last_error = e.to_string();
                });
            }
        }
    }

    fn backup_once(&self, game: &GameEntry, settings: &ArchiveSettings) -> Result<()> {
        let moved = process_special_backup(game, settings)?;
        if moved > 0 {
            info!(
                "Consolidated {moved} dated folder(s) for game {:?}",
                game.name()
            );
        }

        let (file_path, non_fatal_error) =
            create_archive(game, settings, false, self.entry_pool.clone())?;
        match &file_path {
            Some(path) => info!("Created backup file: {:?}", path),
            None => info!("Nothing to archive for game {:?}", game.name()),
        }
        if let Some(non_fatal_error) = non_fatal_error {
            warn!("Received non fatal error: {non_fatal_error}");
        }

        let deleted = cleanup_old_backups(game, settings);
        if deleted > 0 {
            info!(
                "Removed {deleted} out of retention archive(s) for game {:?}",
                game.name()
            );
        }

        Ok(())
    }
}

/// Owns the scheduler worker thread.
///
/// `start` spawns the tick loop; `stop` (also run on drop) requests
/// shutdown, which interrupts both the inter-pass sleep and any wait for a
/// backup slot, then joins the worker.
pub struct BackupScheduler {
    core: SchedulerCore,
    worker: Option<JoinHandle<()>>,
}

impl BackupScheduler {
    pub fn new(
        registry: Arc<dyn GameRegistry>,
        settings: Arc<dyn SettingsProvider>,
        state: Arc<StateStore>,
        entry_pool: Arc<ThreadPool>,
    ) -> BackupScheduler {
        Self {
            core: SchedulerCore {
                registry,
                settings,
                state,
                entry_pool,
                shutdown: Shutdown::new(),
            },
            worker: None,
        }
    }

    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        self.core.state.set_service_status("Starting");
        if let Err(e) = self.core.settings.reload() {
            error!("Config reload at startup failed, using last good copy: {e}");
        }
        let core = self.core.clone();
        self.worker = Some(std::thread::spawn(move || core.run_loop()));
    }

    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        info!("Stopping backup scheduler");
        // Persisted before the drain so a watcher of the state file sees
        // the shutdown while in-flight backups finish.
        self.core.state.set_service_status("Stopping");
        self.core.shutdown.request();
        if worker.join().is_err() {
            error!("Scheduler worker panicked during shutdown");
        }
        // Written again after the join: a pass that was between its
        // shutdown check and its reconcile re-stamps Running.
        self.core.state.set_service_status("Stopping");
    }

    /// Handle for signal handlers and tests to trip the loop externally.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.core.shutdown.clone()
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::{archive_files, game_backup_dir};
    use crate::backup::game::GameEntry;
    use crate::backup::state::state_key;
    use rayon::ThreadPoolBuilder;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeRegistry {
        games: Mutex<Vec<GameEntry>>,
        not_running: Mutex<HashSet<String>>,
        hidden: Mutex<HashSet<String>>,
        find_delay: Mutex<std::time::Duration>,
    }

    impl FakeRegistry {
        fn with_games(games: Vec<GameEntry>) -> FakeRegistry {
            FakeRegistry {
                games: Mutex::new(games),
                ..Default::default()
            }
        }

        fn set_games(&self, games: Vec<GameEntry>) {
            *self.games.lock().unwrap() = games;
        }

        fn mark_not_running(&self, name: &str) {
            self.not_running.lock().unwrap().insert(state_key(name));
        }

        fn hide(&self, name: &str) {
            self.hidden.lock().unwrap().insert(state_key(name));
        }

        /// Makes every lookup take this long, keeping a worker in flight.
        fn stall_lookups(&self, delay: std::time::Duration) {
            *self.find_delay.lock().unwrap() = delay;
        }
    }

    impl GameRegistry for FakeRegistry {
        fn load_games(&self) -> Result<Vec<GameEntry>> {
            Ok(self.games.lock().unwrap().clone())
        }

        fn find_game(&self, name: &str) -> Option<GameEntry> {
            let delay = *self.find_delay.lock().unwrap();
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            let key = state_key(name);
            if self.hidden.lock().unwrap().contains(&key) {
                return None;
            }
            self.games
                .lock()
                .unwrap()
                .iter()
                .find(|game| state_key(game.name()) == key)
                .cloned()
        }

        fn is_game_running(&self, game: &GameEntry) -> bool {
            !self
                .not_running
                .lock()
                .unwrap()
                .contains(&state_key(game.name()))
        }
    }

    struct FakeSettings(ArchiveSettings);

    impl SettingsProvider for FakeSettings {
        fn current(&self) -> ArchiveSettings {
            self.0.clone()
        }

        fn reload(&self) -> Result<()> {
            Ok(())
        }
    }

    fn game_with_saves(name: &str, saves: &Path) -> GameEntry {
        std::fs::create_dir_all(saves).unwrap();
        std::fs::write(saves.join("slot1.sav"), b"save data").unwrap();
        GameEntry::builder()
            .name(name)
            .source_path(saves)
            .backup_interval_minutes(30)
            .build()
    }

    fn scheduler_for(
        games: Vec<GameEntry>,
        root: &Path,
    ) -> (Arc<FakeRegistry>, Arc<StateStore>, BackupScheduler) {
        let registry = Arc::new(FakeRegistry::with_games(games));
        let settings = ArchiveSettings::builder()
            .root_folder(root)
            .scan_interval_minutes(1)
            .build();
        let state = Arc::new(StateStore::load(root.join("state.json")));
        let entry_pool = Arc::new(ThreadPoolBuilder::new().num_threads(2).build().unwrap());
        let scheduler = BackupScheduler::new(
            registry.clone(),
            Arc::new(FakeSettings(settings)),
            state.clone(),
            entry_pool,
        );
        (registry, state, scheduler)
    }

    fn run_one_pass(scheduler: &BackupScheduler) -> Result<()> {
        let settings = scheduler.core.settings.current();
        scheduler.core.run_pass(&settings)
    }

    #[test]
    fn test_pass_reconciles_state_with_registry() {
        let root = TempDir::new().unwrap();
        let saves = TempDir::new().unwrap();

        let active = game_with_saves("Factorio", &saves.path().join("factorio"));
        let parked = GameEntry::builder()
            .name("Skyrim")
            .source_path(saves.path().join("skyrim"))
            .enabled(false)
            .build();
        let (_registry, state, scheduler) = scheduler_for(vec![active, parked], root.path());

        // A game that used to exist but is no longer configured.
        state.update(|s| {
            s.ensure_game("Old Game");
        });

        run_one_pass(&scheduler).unwrap();

        let snapshot = state.snapshot();
        assert_eq!(snapshot.service_status, "Running");
        assert!(snapshot.game("Old Game").is_none());
        assert_eq!(snapshot.game("Skyrim").unwrap().status, GameStatus::Disabled);
        assert_eq!(snapshot.game("Factorio").unwrap().status, GameStatus::Success);
    }

    #[test]
    fn test_removed_game_comes_back_with_fresh_state() {
        let root = TempDir::new().unwrap();
        let saves = TempDir::new().unwrap();
        let factorio = game_with_saves("Factorio", &saves.path().join("factorio"));
        let parked = GameEntry::builder()
            .name("Skyrim")
            .source_path(saves.path().join("skyrim"))
            .enabled(false)
            .build();
        let (registry, state, scheduler) =
            scheduler_for(vec![factorio.clone(), parked.clone()], root.path());

        run_one_pass(&scheduler).unwrap();
        {
            let snapshot = state.snapshot();
            let old = snapshot.game("Factorio").unwrap();
            assert_eq!(old.status, GameStatus::Success);
            assert!(old.last_backup_time.is_some());
            assert!(old.next_backup_scheduled.is_some());
        }

        // Deleted from the config: the next pass prunes its record.
        registry.set_games(vec![parked.clone()]);
        run_one_pass(&scheduler).unwrap();
        assert!(state.snapshot().game("Factorio").is_none());

        // Re-added: the game starts over instead of resurrecting the old
        // record. Hidden from lookup so the worker aborts right after
        // reconciliation and the fresh entry stays observable.
        registry.set_games(vec![factorio, parked]);
        registry.hide("Factorio");
        run_one_pass(&scheduler).unwrap();

        let snapshot = state.snapshot();
        let entry = snapshot.game("Factorio").unwrap();
        assert_eq!(entry.status, GameStatus::Waiting);
        assert!(entry.last_backup_time.is_none());
        assert!(entry.next_backup_scheduled.is_none());
        assert!(entry.last_error.is_empty());
    }

    #[test]
    fn test_pass_backs_up_due_game() {
        let root = TempDir::new().unwrap();
        let saves = TempDir::new().unwrap();
        let game = game_with_saves("Factorio", saves.path());
        let (_registry, state, scheduler) = scheduler_for(vec![game], root.path());

        let before = Utc::now();
        run_one_pass(&scheduler).unwrap();

        let archives = archive_files(&game_backup_dir(root.path(), "Factorio"));
        assert_eq!(archives.len(), 1);

        let snapshot = state.snapshot();
        let entry = snapshot.game("Factorio").unwrap();
        assert_eq!(entry.status, GameStatus::Success);
        assert!(entry.last_error.is_empty());
        assert!(entry.last_backup_time.unwrap() >= before);

        let next = entry.next_backup_scheduled.unwrap();
        let expected = entry.last_backup_time.unwrap() + Duration::minutes(30);
        assert_eq!(next, expected);
    }

    #[test]
    fn test_pass_skips_game_not_yet_due() {
        let root = TempDir::new().unwrap();
        let saves = TempDir::new().unwrap();
        let game = game_with_saves("Factorio", saves.path());
        let (_registry, state, scheduler) = scheduler_for(vec![game], root.path());

        state.update(|s| {
            s.ensure_game("Factorio").next_backup_scheduled = Some(Utc::now() + Duration::hours(1));
        });

        run_one_pass(&scheduler).unwrap();

        assert!(archive_files(&game_backup_dir(root.path(), "Factorio")).is_empty());
        let snapshot = state.snapshot();
        let entry = snapshot.game("Factorio").unwrap();
        assert_eq!(entry.status, GameStatus::Waiting);
        assert!(entry.last_backup_time.is_none());
    }

    #[test]
    fn test_pass_skips_game_whose_process_is_stopped() {
        let root = TempDir::new().unwrap();
        let saves = TempDir::new().unwrap();
        let game = game_with_saves("Factorio", saves.path());
        let (registry, state, scheduler) = scheduler_for(vec![game], root.path());
        registry.mark_not_running("Factorio");

        run_one_pass(&scheduler).unwrap();

        assert!(archive_files(&game_backup_dir(root.path(), "Factorio")).is_empty());
        assert_eq!(
            state.snapshot().game("Factorio").unwrap().status,
            GameStatus::GameNotRunning
        );
    }

    #[test]
    fn test_pass_tolerates_game_vanishing_mid_pass() {
        let root = TempDir::new().unwrap();
        let saves = TempDir::new().unwrap();
        let game = game_with_saves("Factorio", saves.path());
        let (registry, state, scheduler) = scheduler_for(vec![game], root.path());
        registry.hide("Factorio");

        run_one_pass(&scheduler).unwrap();

        assert!(archive_files(&game_backup_dir(root.path(), "Factorio")).is_empty());
        assert_eq!(
            state.snapshot().game("Factorio").unwrap().status,
            GameStatus::Waiting
        );
    }

    #[test]
    fn test_missing_source_marks_path_error() {
        let root = TempDir::new().unwrap();
        let game = GameEntry::builder()
            .name("Factorio")
            .source_path(root.path().join("no-such-saves"))
            .build();
        let (_registry, state, scheduler) = scheduler_for(vec![game], root.path());

        run_one_pass(&scheduler).unwrap();

        let snapshot = state.snapshot();
        let entry = snapshot.game("Factorio").unwrap();
        assert_eq!(entry.status, GameStatus::PathError);
        assert!(!entry.last_error.is_empty());
        assert!(entry.last_backup_time.is_none());
        assert!(entry.next_backup_scheduled.is_none());
    }

    #[test]
    fn test_failed_backup_marks_error_and_stays_due() {
        let root = TempDir::new().unwrap();
        let saves = TempDir::new().unwrap();
        let game = game_with_saves("Factorio", saves.path());
        let (_registry, state, scheduler) = scheduler_for(vec![game], root.path());

        // The game's backup directory cannot be created over this file.
        std::fs::write(root.path().join("Factorio"), b"in the way").unwrap();

        run_one_pass(&scheduler).unwrap();

        let snapshot = state.snapshot();
        // The pass itself is fine; only the one game failed.
        assert_eq!(snapshot.service_status, "Running");
        let entry = snapshot.game("Factorio").unwrap();
        assert_eq!(entry.status, GameStatus::Error);
        assert!(!entry.last_error.is_empty());
        assert!(entry.next_backup_scheduled.is_none());
    }

    #[test]
    fn test_empty_registry_leaves_state_alone() {
        let root = TempDir::new().unwrap();
        let (_registry, state, scheduler) = scheduler_for(vec![], root.path());

        state.update(|s| {
            s.ensure_game("Factorio");
        });

        run_one_pass(&scheduler).unwrap();

        assert!(state.snapshot().game("Factorio").is_some());
    }

    #[test]
    fn test_start_and_stop_lifecycle() {
        let root = TempDir::new().unwrap();
        let saves = TempDir::new().unwrap();
        let game = game_with_saves("Factorio", saves.path());
        let (_registry, state, mut scheduler) = scheduler_for(vec![game], root.path());

        scheduler.start();
        // First pass happens immediately, then the loop sleeps for a minute.
        std::thread::sleep(std::time::Duration::from_millis(300));
        scheduler.stop();

        assert_eq!(archive_files(&game_backup_dir(root.path(), "Factorio")).len(), 1);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.service_status, "Stopping");
        assert_eq!(snapshot.game("Factorio").unwrap().status, GameStatus::Success);
    }

    #[test]
    fn test_stop_reports_stopping_while_backups_drain() {
        let root = TempDir::new().unwrap();
        let saves = TempDir::new().unwrap();
        let game = game_with_saves("Factorio", saves.path());
        let (registry, state, mut scheduler) = scheduler_for(vec![game], root.path());
        registry.stall_lookups(std::time::Duration::from_millis(800));

        scheduler.start();
        // Give the first pass time to dispatch the worker, now stuck in the
        // stalled lookup.
        std::thread::sleep(std::time::Duration::from_millis(200));

        let watcher_state = state.clone();
        let (sender, receiver) = std::sync::mpsc::channel();
        let watcher = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(300));
            sender.send(watcher_state.snapshot().service_status).unwrap();
        });

        scheduler.stop();
        watcher.join().unwrap();

        // Sampled mid-drain, well before the stalled worker finished.
        assert_eq!(receiver.recv().unwrap(), "Stopping");
        assert_eq!(state.snapshot().service_status, "Stopping");
    }

    #[test]
    fn test_shutdown_handle_cancels_before_the_first_pass() {
        let root = TempDir::new().unwrap();
        let saves = TempDir::new().unwrap();
        let game = game_with_saves("Factorio", saves.path());
        let (_registry, state, mut scheduler) = scheduler_for(vec![game], root.path());

        // A signal handler would hold this; requested before the loop even
        // spawns, so no pass may run.
        scheduler.shutdown_handle().request();
        scheduler.start();
        scheduler.stop();

        assert!(archive_files(&game_backup_dir(root.path(), "Factorio")).is_empty());
        assert_eq!(state.snapshot().service_status, "Stopping");
    }

    #[test]
    fn test_stop_without_start_is_a_noop() {
        let root = TempDir::new().unwrap();
        let (_registry, _state, mut scheduler) = scheduler_for(vec![], root.path());
        scheduler.stop();
        scheduler.stop();
    }
}
