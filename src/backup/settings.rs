use crate::backup::result_error::result::Result;
use crate::backup::validate::validate_writable_dir;

use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use validator::Validate;

use std::path::PathBuf;

pub const STATE_FILE_NAME: &str = "savewarden_state.json";

/// How hard the zip writer squeezes archive payloads.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Store entries uncompressed; cheapest on CPU.
    Fast,
    /// Deflate at the default level.
    #[default]
    Optimal,
    /// Bzip2 at maximum effort.
    Smallest,
}

/// Service-wide knobs shared by every game.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct ArchiveSettings {
    /// Backups land in per-game folders under this directory.
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    root_folder: PathBuf,
    /// Minutes between scheduler passes.
    #[validate(range(min = 1, max = 1440))]
    #[serde(default = "default_scan_interval")]
    #[builder(default = default_scan_interval())]
    scan_interval_minutes: u32,
    /// Upper bound on games backed up at the same time.
    #[validate(range(min = 1, max = 10))]
    #[serde(default = "default_max_parallel_backups")]
    #[builder(default = default_max_parallel_backups())]
    max_parallel_backups: u32,
    #[serde(default)]
    #[builder(default)]
    compression: CompressionLevel,
    /// Where the service state JSON lives; defaults to the root folder.
    #[builder(into)]
    state_file: Option<PathBuf>,
}

fn default_scan_interval() -> u32 {
    5
}

fn default_max_parallel_backups() -> u32 {
    2
}

impl ArchiveSettings {
    pub fn state_file_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.root_folder.join(STATE_FILE_NAME))
    }
}

/// Live view of the service settings; implementations may re-read their
/// backing store on every call.
pub trait SettingsProvider: Send + Sync {
    fn current(&self) -> ArchiveSettings;

    /// Forces a refresh of the backing store, reporting parse failures.
    fn reload(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_deserialize_minimal_yaml_uses_defaults() {
        let yaml = "root_folder: /backups\n";
        let settings: ArchiveSettings = serde_yml::from_str(yaml).unwrap();

        assert_eq!(*settings.scan_interval_minutes(), 5);
        assert_eq!(*settings.max_parallel_backups(), 2);
        assert_eq!(*settings.compression(), CompressionLevel::Optimal);
        assert!(settings.state_file().is_none());
    }

    #[test]
    fn test_deserialize_compression_levels() {
        for (text, expected) in [
            ("fast", CompressionLevel::Fast),
            ("optimal", CompressionLevel::Optimal),
            ("smallest", CompressionLevel::Smallest),
        ] {
            let yaml = format!("root_folder: /backups\ncompression: {text}\n");
            let settings: ArchiveSettings = serde_yml::from_str(&yaml).unwrap();
            assert_eq!(*settings.compression(), expected);
        }
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let yaml = "root_folder: /backups\nshiny: true\n";
        assert!(serde_yml::from_str::<ArchiveSettings>(yaml).is_err());
    }

    #[test]
    fn test_state_file_path_defaults_under_root() {
        let settings = ArchiveSettings::builder().root_folder("/backups").build();
        assert_eq!(
            settings.state_file_path(),
            PathBuf::from("/backups").join(STATE_FILE_NAME)
        );
    }

    #[test]
    fn test_state_file_path_override() {
        let settings = ArchiveSettings::builder()
            .root_folder("/backups")
            .state_file("/var/lib/warden/state.json")
            .build();
        assert_eq!(
            settings.state_file_path(),
            PathBuf::from("/var/lib/warden/state.json")
        );
    }

    #[test]
    fn test_validate_accepts_writable_root() {
        let temp_dir = TempDir::new().unwrap();
        let settings = ArchiveSettings::builder()
            .root_folder(temp_dir.path())
            .build();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let temp_dir = TempDir::new().unwrap();
        let settings = ArchiveSettings::builder()
            .root_folder(temp_dir.path())
            .max_parallel_backups(0)
            .build();
        assert!(settings.validate().is_err());
    }
}
