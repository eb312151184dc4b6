use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Lifecycle of one game within a scheduler pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum GameStatus {
    Disabled,
    Waiting,
    GameNotRunning,
    Processing,
    Success,
    PathError,
    Error,
}

/// Per-game slice of the persisted service state.
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    /// Display name as configured, preserving case.
    pub game_name: String,
    pub last_backup_time: Option<DateTime<Utc>>,
    pub status: GameStatus,
    pub next_backup_scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: String,
}

impl GameState {
    pub fn waiting<S: Into<String>>(game_name: S) -> GameState {
        Self {
            game_name: game_name.into(),
            last_backup_time: None,
            status: GameStatus::Waiting,
            next_backup_scheduled: None,
            last_error: String::new(),
        }
    }
}

/// Map key for a game, making state lookups case-insensitive.
pub fn state_key(name: &str) -> String {
    name.to_lowercase()
}

/// Whole service state as persisted to disk between runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    pub last_update_time: DateTime<Utc>,
    /// Keyed on the lowercased game name; values keep display casing.
    pub games_state: BTreeMap<String, GameState>,
    pub service_status: String,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            last_update_time: Utc::now(),
            games_state: BTreeMap::new(),
            service_status: "Starting".to_string(),
        }
    }
}

impl ServiceState {
    pub fn game(&self, name: &str) -> Option<&GameState> {
        self.games_state.get(&state_key(name))
    }

    pub fn game_mut(&mut self, name: &str) -> Option<&mut GameState> {
        self.games_state.get_mut(&state_key(name))
    }

    /// Fetches the state for `name`, creating a fresh `Waiting` slot on
    /// first sight. The display name is refreshed so a rename that only
    /// changes case still shows up.
    pub fn ensure_game(&mut self, name: &str) -> &mut GameState {
        let entry = self
            .games_state
            .entry(state_key(name))
            .or_insert_with(|| GameState::waiting(name));
        entry.game_name = name.to_string();
        entry
    }

    /// Drops state for games no longer configured.
    pub fn retain_games<'a, I: IntoIterator<Item = &'a str>>(&mut self, known: I) {
        let keep: HashSet<String> = known.into_iter().map(state_key).collect();
        self.games_state.retain(|key, _| keep.contains(key));
    }
}

/// Mutex-guarded service state with write-through JSON persistence.
///
/// Every mutation bumps `lastUpdateTime` and rewrites the whole file via a
/// temp file in the same directory, so readers never observe a half-written
/// state. Persistence failures are logged and swallowed; backups matter
/// more than the status file.
pub struct StateStore {
    path: PathBuf,
    state: Mutex<ServiceState>,
}

impl StateStore {
    /// Reads the state file once; missing or unreadable files degrade to
    /// the default state.
    pub fn load<P: Into<PathBuf>>(path: P) -> StateStore {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("State file {:?} is corrupt, starting fresh: {}", path, e);
                    ServiceState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No state file at {:?}, starting fresh", path);
                ServiceState::default()
            }
            Err(e) => {
                tracing::warn!("Cannot read state file {:?}, starting fresh: {}", path, e);
                ServiceState::default()
            }
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Applies `mutate` under the lock, stamps the update time, and
    /// persists the result.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut ServiceState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let result = mutate(&mut state);
        state.last_update_time = Utc::now();
        if let Err(e) = persist(&self.path, &state) {
            tracing::error!("Failed to persist state to {:?}: {}", self.path, e);
        }
        result
    }

    pub fn snapshot(&self) -> ServiceState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_service_status<S: Into<String>>(&self, status: S) {
        let status = status.into();
        self.update(|state| state.service_status = status);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn persist(path: &Path, state: &ServiceState) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            parent
        }
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(serde_json::to_string_pretty(state)?.as_bytes())?;
    tmp.persist(path).map_err(|e| Error::from(e.error))?;
    Ok(())
}
