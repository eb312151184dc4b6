use crate::backup::archive::walk::CustomDeserializedGlob;
use crate::backup::result_error::result::Result;
use crate::backup::validate::validate_game_name;

use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use validator::Validate;

use std::path::PathBuf;

/// A single game tracked by the warden.
///
/// Paths point at the live data the game writes: `source_path` is the save
/// directory proper, while `mod_path` and `additional_path` cover installs
/// that keep mod data or extra state (profiles, screenshots) elsewhere.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct GameEntry {
    #[validate(custom(function = validate_game_name))]
    #[builder(into)]
    name: String,
    #[builder(into)]
    source_path: PathBuf,
    #[builder(into)]
    mod_path: Option<PathBuf>,
    #[builder(into)]
    additional_path: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    #[builder(default = default_enabled())]
    enabled: bool,
    /// Minutes between backups of this game, at most a day apart.
    #[validate(range(min = 1, max = 1440))]
    #[serde(default = "default_backup_interval")]
    #[builder(default = default_backup_interval())]
    backup_interval_minutes: u32,
    /// Archives older than this many days are deleted; 0 keeps everything.
    #[serde(default)]
    #[builder(default)]
    days_to_keep: u32,
    /// Moves dated sibling folders (rotating autosave dumps) into
    /// `SpecialArchive/` before archiving.
    #[serde(default)]
    #[builder(default)]
    special_archive: bool,
    /// Backups only run while this process is alive; unset means always run.
    #[builder(into)]
    process_name: Option<String>,
    #[serde(default)]
    #[builder(default)]
    exclude: Vec<CustomDeserializedGlob>,
}

fn default_enabled() -> bool {
    true
}

fn default_backup_interval() -> u32 {
    60
}

/// Source of truth for which games exist and whether they are running.
pub trait GameRegistry: Send + Sync {
    /// Every configured game, in config order.
    fn load_games(&self) -> Result<Vec<GameEntry>>;

    /// Case-insensitive lookup by display name.
    fn find_game(&self, name: &str) -> Option<GameEntry>;

    /// Whether the game's process is currently alive. Games without a
    /// `process_name` are always considered running.
    fn is_game_running(&self, game: &GameEntry) -> bool;
}
