//! Consolidation of dated save folders.
//!
//! Some games dump whole save folders named by date (`240115`,
//! `backup_240116`). When a save root accumulates several of those,
//! everything dated before yesterday is moved out of the live directory
//! into `SpecialArchive/` under the game's backup folder, keeping the live
//! tree small without deleting anything.

use crate::backup::archive::{game_backup_dir, SPECIAL_ARCHIVE_DIR};
use crate::backup::game::GameEntry;
use crate::backup::result_error::result::Result;
use crate::backup::settings::ArchiveSettings;

use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone};
use regex::Regex;
use tracing::{debug, info, warn};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Matchers for a six-digit `YYMMDD` token: the whole name, anchored at the
/// start or end by a separator, or surrounded by separators.
fn token_patterns() -> &'static [Regex; 4] {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"^(\d{6})$").unwrap(),
            Regex::new(r"^(\d{6})[ ._-]").unwrap(),
            Regex::new(r"[ ._-](\d{6})$").unwrap(),
            Regex::new(r"[ ._-](\d{6})[ ._-]").unwrap(),
        ]
    })
}

fn is_plausible_date(token: &str) -> bool {
    if token.len() != 6 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let year: i32 = token[0..2].parse().unwrap_or(-1);
    let month: u32 = token[2..4].parse().unwrap_or(0);
    let day: u32 = token[4..6].parse().unwrap_or(0);
    (20..=30).contains(&year) && NaiveDate::from_ymd_opt(2000 + year, month, day).is_some()
}

/// Pulls a plausible date token out of a folder name. The two-digit year
/// must land in 2020-2030 and the token must be a real calendar date.
fn extract_date_token(name: &str) -> Option<String> {
    for pattern in token_patterns() {
        if let Some(caps) = pattern.captures(name) {
            let token = &caps[1];
            if is_plausible_date(token) {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Tokens strictly before this move out: yesterday in `YYMMDD`, on the
/// clock's own calendar (the dated folders carry local dates).
fn cutoff_token<Tz: TimeZone>(now: DateTime<Tz>) -> String {
    (now.date_naive() - Duration::days(1))
        .format("%y%m%d")
        .to_string()
}

/// First non-colliding destination: `name`, `name (1)`, `name (2)`, ...
fn unique_dest(dest_base: &Path, name: &str) -> PathBuf {
    let mut dest = dest_base.join(name);
    let mut counter = 0u32;
    while dest.exists() {
        counter += 1;
        dest = dest_base.join(format!("{name} ({counter})"));
    }
    dest
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dest_path = dest.join(entry.file_name());

        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dest_path)?;
        } else {
            std::fs::copy(&src_path, &dest_path)?;
        }
    }

    Ok(())
}

/// Copy-then-delete so the move also works when the backup root sits on a
/// different filesystem.
fn move_folder(src: &Path, dest_base: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dest_base)?;
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "folder".to_string());
    let dest = unique_dest(dest_base, &name);
    copy_dir_recursive(src, &dest)?;
    std::fs::remove_dir_all(src)?;
    Ok(dest)
}

/// Moves dated subfolders of `live_dir` older than `cutoff` into
/// `dest_base`, unless fewer than two distinct dates are present (a single
/// dated folder is someone's naming habit, not a rotation).
fn consolidate(live_dir: &Path, dest_base: &Path, cutoff: &str) -> Result<usize> {
    let mut dated: Vec<(PathBuf, String)> = Vec::new();
    for entry in std::fs::read_dir(live_dir)?.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(token) = extract_date_token(&entry.file_name().to_string_lossy()) {
            dated.push((path, token));
        }
    }

    let distinct: HashSet<&str> = dated.iter().map(|(_, token)| token.as_str()).collect();
    if distinct.len() < 2 {
        debug!(
            "Found {} dated folder(s) in {:?}, nothing to consolidate",
            dated.len(),
            live_dir
        );
        return Ok(0);
    }

    let mut moved = 0usize;
    for (path, token) in &dated {
        if token.as_str() >= cutoff {
            continue;
        }
        match move_folder(path, dest_base) {
            Ok(dest) => {
                info!("Consolidated dated folder {:?} into {:?}", path, dest);
                moved += 1;
            }
            Err(e) => warn!("Could not consolidate {:?}: {}", path, e),
        }
    }

    Ok(moved)
}

/// Runs the consolidation pass for one game if it opted in.
///
/// Only immediate subfolders of the primary save directory are considered.
/// Returns how many folders moved.
pub fn process_special_backup(game: &GameEntry, settings: &ArchiveSettings) -> Result<usize> {
    if !game.special_archive() {
        return Ok(0);
    }
    let live_dir = game.source_path();
    if !live_dir.is_dir() {
        debug!(
            "Save root {:?} for game {:?} missing, skipping consolidation",
            live_dir,
            game.name()
        );
        return Ok(0);
    }
    let dest_base = game_backup_dir(settings.root_folder(), game.name()).join(SPECIAL_ARCHIVE_DIR);
    consolidate(live_dir, &dest_base, &cutoff_token(Local::now()))
}
