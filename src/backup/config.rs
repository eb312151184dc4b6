use crate::backup::game::{GameEntry, GameRegistry};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::settings::{ArchiveSettings, SettingsProvider};
use crate::backup::state::state_key;

use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use tracing::warn;
use validator::Validate;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Everything the service reads from its YAML config file.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, PartialEq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct WardenConfig {
    #[validate(nested)]
    settings: ArchiveSettings,
    #[validate(nested)]
    #[serde(default)]
    #[builder(default)]
    games: Vec<GameEntry>,
}

fn load_config(path: &Path) -> Result<WardenConfig> {
    File::open(path)
        .map_err(Error::from)
        .and_then(|f| {
            serde_yml::from_reader::<_, WardenConfig>(f)
                .map_err(Error::from)
                .with_msg(format!("Parse YAML config failed: {path:?}"))
        })
        .and_then(|config| {
            config
                .validate()
                .map_err(Error::from)
                .map(|_| config)
                .with_msg(format!("Config validation failed: {path:?}"))
        })
}

/// Config backed by a YAML file, re-read on demand so edits take effect
/// without a restart. A broken edit keeps the last good copy in use.
#[derive(Debug)]
pub struct FileConfig {
    path: PathBuf,
    cached: Mutex<WardenConfig>,
}

impl FileConfig {
    /// Parses and validates the file, failing fast on a broken config.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let config = load_config(&path)?;
        Ok(Self {
            path,
            cached: Mutex::new(config),
        })
    }

    fn refresh(&self) -> Result<()> {
        let config = load_config(&self.path)?;
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    fn cached(&self) -> WardenConfig {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SettingsProvider for FileConfig {
    fn current(&self) -> ArchiveSettings {
        if let Err(e) = self.refresh() {
            warn!("Could not reload config, keeping previous settings: {e}");
        }
        self.cached().settings
    }

    fn reload(&self) -> Result<()> {
        self.refresh()
    }
}

impl GameRegistry for FileConfig {
    fn load_games(&self) -> Result<Vec<GameEntry>> {
        if let Err(e) = self.refresh() {
            warn!("Could not reload config, keeping previous game list: {e}");
        }
        Ok(self.cached().games)
    }

    fn find_game(&self, name: &str) -> Option<GameEntry> {
        let key = state_key(name);
        self.cached()
            .games
            .into_iter()
            .find(|game| state_key(game.name()) == key)
    }

    fn is_game_running(&self, game: &GameEntry) -> bool {
        match game.process_name() {
            Some(process) => process_running(process),
            None => true,
        }
    }
}

/// Scans `/proc` for a process whose name matches. `comm` is truncated to 15
/// bytes by the kernel, so the argv0 of `cmdline` is checked as well.
#[cfg(target_os = "linux")]
fn process_running(name: &str) -> bool {
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Could not scan /proc, assuming {name:?} is running: {e}");
            return true;
        }
    };

    for entry in entries.flatten() {
        if !entry
            .file_name()
            .to_string_lossy()
            .chars()
            .all(|c| c.is_ascii_digit())
        {
            continue;
        }
        let pid_dir = entry.path();

        if let Ok(comm) = std::fs::read_to_string(pid_dir.join("comm")) {
            if comm.trim().eq_ignore_ascii_case(name) {
                return true;
            }
        }

        // cmdline uses null bytes as separators
        if let Ok(cmdline) = std::fs::read(pid_dir.join("cmdline")) {
            if let Some(argv0) = cmdline.split(|b| *b == 0).next() {
                let argv0 = String::from_utf8_lossy(argv0);
                let argv0 = Path::new(argv0.as_ref());
                if argv0
                    .file_name()
                    .is_some_and(|f| f.eq_ignore_ascii_case(name))
                    || argv0
                        .file_stem()
                        .is_some_and(|f| f.eq_ignore_ascii_case(name))
                {
                    return true;
                }
            }
        }
    }

    false
}

#[cfg(not(target_os = "linux"))]
fn process_running(name: &str) -> bool {
    tracing::debug!("Process liveness checks only exist on Linux, assuming {name:?} is running");
    true
}
