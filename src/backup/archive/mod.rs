pub mod walk;

use crate::backup::game::GameEntry;

use std::path::{Path, PathBuf};

/// Subdirectory of a game's backup folder holding archives exempt from
/// retention cleanup.
pub const PERMANENT_DIR: &str = "permanent";

/// Subdirectory of a game's backup folder receiving consolidated dated
/// save folders.
pub const SPECIAL_ARCHIVE_DIR: &str = "SpecialArchive";

/// Top-level folder inside every archive, one per configured source path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchivePrefix {
    Saves,
    Mods,
    Additional,
}

impl ArchivePrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchivePrefix::Saves => "saves",
            ArchivePrefix::Mods => "mods",
            ArchivePrefix::Additional => "additional",
        }
    }

    /// Maps the leading path component of an archive entry back to a prefix.
    pub fn of_component(component: &str) -> Option<ArchivePrefix> {
        match component {
            "saves" => Some(ArchivePrefix::Saves),
            "mods" => Some(ArchivePrefix::Mods),
            "additional" => Some(ArchivePrefix::Additional),
            _ => None,
        }
    }
}

/// One configured directory feeding an archive, tagged with the prefix its
/// files land under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRoot {
    pub prefix: ArchivePrefix,
    pub dir: PathBuf,
}

impl SourceRoot {
    pub fn new<P: Into<PathBuf>>(prefix: ArchivePrefix, dir: P) -> SourceRoot {
        Self {
            prefix,
            dir: dir.into(),
        }
    }
}

/// Every source path the game has configured, whether or not it exists.
pub fn configured_sources(game: &GameEntry) -> Vec<SourceRoot> {
    let mut sources = vec![SourceRoot::new(ArchivePrefix::Saves, game.source_path())];
    if let Some(dir) = game.mod_path() {
        sources.push(SourceRoot::new(ArchivePrefix::Mods, dir));
    }
    if let Some(dir) = game.additional_path() {
        sources.push(SourceRoot::new(ArchivePrefix::Additional, dir));
    }
    sources
}

/// Sources that exist on disk right now; configured paths that are missing
/// are logged and dropped.
pub fn usable_sources(game: &GameEntry) -> Vec<SourceRoot> {
    configured_sources(game)
        .into_iter()
        .filter(|source| {
            if source.dir.is_dir() {
                true
            } else {
                tracing::warn!(
                    "{} path {:?} for game {:?} does not exist, skipping",
                    source.prefix.as_str(),
                    source.dir,
                    game.name()
                );
                false
            }
        })
        .collect()
}

/// A game is backupable when at least one configured source exists.
pub fn verify_paths(game: &GameEntry) -> bool {
    !usable_sources(game).is_empty()
}

/// A single file headed into an archive: where it lives on disk and the
/// forward-slash name it gets inside the zip.
#[derive(Debug)]
pub struct ArchiveEntry {
    pub src: PathBuf,
    pub dst: String,
}

impl ArchiveEntry {
    pub fn new<A: Into<PathBuf>, B: Into<String>>(src: A, dst: B) -> ArchiveEntry {
        Self {
            src: src.into(),
            dst: dst.into(),
        }
    }
}

/// Filesystem-safe form of a game name, used for its backup directory and
/// archive file stems. Falls back to `_` when nothing survives sanitizing.
pub fn safe_game_name(name: &str) -> String {
    let safe = sanitize_filename::sanitize(name);
    if safe.is_empty() {
        "_".to_string()
    } else {
        safe
    }
}

/// Per-game backup directory under the configured root.
pub fn game_backup_dir(root: &Path, name: &str) -> PathBuf {
    root.join(safe_game_name(name))
}

/// True for plain `.zip` files.
pub fn is_archive_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Zip archives directly inside `dir`, non-recursive; `permanent/` and
/// `SpecialArchive/` are directories and therefore never listed.
pub fn archive_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| is_archive_file(p))
        .collect()
}
