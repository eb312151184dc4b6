//! Age-based cleanup of rolling archives.

use crate::backup::archive::{archive_files, game_backup_dir};
use crate::backup::game::GameEntry;
use crate::backup::settings::ArchiveSettings;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use std::path::{Path, PathBuf};

/// Best guess at when an archive was made: creation time where the
/// filesystem records one, modification time otherwise (common on Linux).
fn archive_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let md = std::fs::metadata(path).ok()?;
    let stamp = md.created().or_else(|_| md.modified()).ok()?;
    Some(DateTime::<Utc>::from(stamp))
}

/// Paths whose timestamp falls before `cutoff`.
fn files_older_than<I>(files: I, cutoff: DateTime<Utc>) -> Vec<PathBuf>
where
    I: IntoIterator<Item = (PathBuf, DateTime<Utc>)>,
{
    files
        .into_iter()
        .filter(|(_, stamp)| *stamp < cutoff)
        .map(|(path, _)| path)
        .collect()
}

/// Deletes rolling archives older than the game's retention window.
///
/// `days_to_keep == 0` keeps everything. Permanent archives live in a
/// subdirectory and are never listed. Returns how many files were removed;
/// individual delete failures are logged and do not stop the sweep.
pub fn cleanup_old_backups(game: &GameEntry, settings: &ArchiveSettings) -> usize {
    let days = *game.days_to_keep();
    if days == 0 {
        debug!("Retention disabled for game {:?}", game.name());
        return 0;
    }

    let backup_dir = game_backup_dir(settings.root_folder(), game.name());
    // A window so large the cutoff predates representable time keeps
    // everything, same as days_to_keep == 0.
    let Some(cutoff) = Utc::now().checked_sub_signed(Duration::days(i64::from(days))) else {
        debug!(
            "Retention window of {days} day(s) for game {:?} keeps everything",
            game.name()
        );
        return 0;
    };
    let stamped = archive_files(&backup_dir)
        .into_iter()
        .filter_map(|path| archive_timestamp(&path).map(|stamp| (path, stamp)));

    let mut deleted = 0usize;
    for path in files_older_than(stamped, cutoff) {
        match std::fs::remove_file(&path) {
            Ok(_) => {
                info!("Removed out of retention archive {:?}", path);
                deleted += 1;
            }
            Err(e) => warn!("Could not remove archive {:?}: {}", path, e),
        }
    }

    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::PERMANENT_DIR;
    use tempfile::TempDir;

    fn game_with_retention(days: u32) -> GameEntry {
        GameEntry::builder()
            .name("Skyrim")
            .source_path("/saves/skyrim")
            .days_to_keep(days)
            .build()
    }

    #[test]
    fn test_files_older_than_selects_before_cutoff() {
        let cutoff = Utc::now();
        let old = (PathBuf::from("old.zip"), cutoff - Duration::days(3));
        let young = (PathBuf::from("young.zip"), cutoff + Duration::seconds(1));
        let boundary = (PathBuf::from("boundary.zip"), cutoff);

        let selected = files_older_than([old, young, boundary], cutoff);
        assert_eq!(selected, vec![PathBuf::from("old.zip")]);
    }

    #[test]
    fn test_archive_timestamp_for_fresh_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("save.zip");
        std::fs::write(&path, "z").unwrap();

        let stamp = archive_timestamp(&path).unwrap();
        assert!(Utc::now() - stamp < Duration::minutes(1));
    }

    #[test]
    fn test_cleanup_disabled_keeps_everything() {
        let root = TempDir::new().unwrap();
        let game = game_with_retention(0);
        let backup_dir = game_backup_dir(root.path(), game.name());
        std::fs::create_dir_all(&backup_dir).unwrap();
        std::fs::write(backup_dir.join("a.zip"), "z").unwrap();

        let settings = ArchiveSettings::builder().root_folder(root.path()).build();
        assert_eq!(cleanup_old_backups(&game, &settings), 0);
        assert!(backup_dir.join("a.zip").exists());
    }

    #[test]
    fn test_cleanup_keeps_archives_inside_window() {
        let root = TempDir::new().unwrap();
        let game = game_with_retention(1);
        let backup_dir = game_backup_dir(root.path(), game.name());
        std::fs::create_dir_all(&backup_dir).unwrap();
        std::fs::write(backup_dir.join("a.zip"), "z").unwrap();
        std::fs::write(backup_dir.join("b.zip"), "z").unwrap();

        let settings = ArchiveSettings::builder().root_folder(root.path()).build();
        assert_eq!(cleanup_old_backups(&game, &settings), 0);
        assert!(backup_dir.join("a.zip").exists());
        assert!(backup_dir.join("b.zip").exists());
    }

    #[test]
    fn test_cleanup_survives_absurd_retention_window() {
        let root = TempDir::new().unwrap();
        let game = game_with_retention(u32::MAX);
        let backup_dir = game_backup_dir(root.path(), game.name());
        std::fs::create_dir_all(&backup_dir).unwrap();
        std::fs::write(backup_dir.join("a.zip"), "z").unwrap();

        let settings = ArchiveSettings::builder().root_folder(root.path()).build();
        assert_eq!(cleanup_old_backups(&game, &settings), 0);
        assert!(backup_dir.join("a.zip").exists());
    }

    #[test]
    fn test_cleanup_never_sees_permanent_archives() {
        let root = TempDir::new().unwrap();
        let game = game_with_retention(1);
        let permanent = game_backup_dir(root.path(), game.name()).join(PERMANENT_DIR);
        std::fs::create_dir_all(&permanent).unwrap();
        std::fs::write(permanent.join("keep.zip"), "z").unwrap();

        let settings = ArchiveSettings::builder().root_folder(root.path()).build();
        assert_eq!(cleanup_old_backups(&game, &settings), 0);
        assert!(permanent.join("keep.zip").exists());
    }

    #[test]
    fn test_cleanup_missing_backup_dir_is_a_noop() {
        let root = TempDir::new().unwrap();
        let game = game_with_retention(7);
        let settings = ArchiveSettings::builder().root_folder(root.path()).build();
        assert_eq!(cleanup_old_backups(&game, &settings), 0);
    }
}
