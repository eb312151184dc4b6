use crate::backup::archive::walk::{build_exclude_set, source_entries};
use crate::backup::archive::{
    archive_files, game_backup_dir, safe_game_name, usable_sources, ArchivePrefix, PERMANENT_DIR,
};
use crate::backup::game::GameEntry;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::WithMsg;
use crate::backup::settings::{ArchiveSettings, CompressionLevel};

use chrono::{DateTime, TimeZone};
use itertools::Itertools;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use std::fmt::Display;
use std::fs::File;
use std::io::{BufReader, BufWriter, IntoInnerError};
use std::path::{Path, PathBuf};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::JoinHandle;

static TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// `<safe name>_<timestamp>.zip`
pub fn archive_file_name<O: Display, T: TimeZone<Offset = O>>(
    name: &str,
    dt: DateTime<T>,
) -> String {
    format!("{}_{}.zip", safe_game_name(name), dt.format(TIME_FORMAT))
}

/// Zip writer options for a compression level.
fn file_options(level: CompressionLevel) -> SimpleFileOptions {
    let options = SimpleFileOptions::default().large_file(true);
    match level {
        CompressionLevel::Fast => options.compression_method(CompressionMethod::Stored),
        CompressionLevel::Optimal => options.compression_method(CompressionMethod::Deflated),
        CompressionLevel::Smallest => options
            .compression_method(CompressionMethod::Bzip2)
            .compression_level(Some(9)),
    }
}

fn join_thread<T>(handle: JoinHandle<Result<T>>, what: &str) -> Result<T> {
    match handle.join() {
        Ok(res) => res,
        Err(_) => Err(Error::from(std::io::Error::other(format!(
            "{what} thread panicked"
        )))),
    }
}

fn remove_stale_tmp(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not delete tmp file {:?}: {}", path, e);
        }
    }
}

fn mark_read_only(path: &Path) {
    let res = std::fs::metadata(path).and_then(|md| {
        let mut perms = md.permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(path, perms)
    });
    if let Err(e) = res {
        warn!("Could not mark {:?} read-only: {}", path, e);
    }
}

fn collect_non_fatal(skipped: Vec<Error>, producer_err: Option<Error>) -> Option<Error> {
    let mut errors = skipped;
    if let Some(e) = producer_err {
        errors.push(e);
    }
    convert_error_vec(errors).err()
}

/// Streams every existing source of `game` into one timestamped zip.
///
/// Source walking runs on `entry_pool`; entries flow over a bounded channel
/// to a single writer thread that builds `<dir>/<name>_<stamp>.zip.tmp` and
/// renames it into place once complete. Files that cannot be read are
/// skipped and reported through the non-fatal error slot; an archive with
/// zero entries is discarded without leaving a file behind.
///
/// `permanent` archives land under `permanent/` and are marked read-only so
/// retention never touches them.
pub fn create_archive(
    game: &GameEntry,
    settings: &ArchiveSettings,
    permanent: bool,
    entry_pool: Arc<ThreadPool>,
) -> Result<(Option<PathBuf>, Option<Error>)> {
    let sources = usable_sources(game);
    if sources.is_empty() {
        return Err(Error::NoUsablePath(game.name().clone()));
    }
    let exclude = build_exclude_set(game.exclude())?;

    let mut dest_dir = game_backup_dir(settings.root_folder(), game.name());
    if permanent {
        dest_dir = dest_dir.join(PERMANENT_DIR);
    }
    std::fs::create_dir_all(&dest_dir)?;

    let file_name = archive_file_name(game.name(), chrono::Local::now());
    let tmp_path = Arc::new(dest_dir.join(format!("{file_name}.tmp")));

    let (entry_tx, entry_rx) = sync_channel(entry_pool.current_num_threads());
    let producer_join_handle = std::thread::spawn(move || {
        convert_error_vec(entry_pool.install(|| {
            sources
                .par_iter()
                .map(|source| {
                    source_entries(source, &exclude).map(|iter| {
                        let errors = iter
                            .filter_map(|entry_result| {
                                entry_result
                                    .with_msg("Ignoring entry")
                                    .and_then(|entry| entry_tx.send(entry).map_err(Error::from))
                                    .err()
                            })
                            .collect_vec();
                        convert_error_vec(errors)
                    })
                })
                .filter_map(|res| match res {
                    Ok(r) => r.err(),
                    Err(e) => Some(e),
                })
                .collect()
        }))
    });

    let options = file_options(*settings.compression());
    let tmp_path_clone = tmp_path.clone();
    let writer_join_handle = std::thread::spawn(move || -> Result<(u64, Vec<Error>)> {
        let mut writer = File::create_new(tmp_path_clone.as_path())
            .map(BufWriter::new)
            .map(ZipWriter::new)?;

        let mut written = 0u64;
        let mut skipped = Vec::new();
        for entry in entry_rx {
            let mut src = match File::open(&entry.src) {
                Ok(f) => f,
                Err(e) => {
                    warn!("Skipping unreadable file {:?}: {}", entry.src, e);
                    skipped.push(Error::from(e).with_msg(format!("Skipped {:?}", entry.src)));
                    continue;
                }
            };
            writer.start_file(entry.dst.as_str(), options)?;
            match std::io::copy(&mut src, &mut writer) {
                Ok(_) => written += 1,
                Err(e) => {
                    // The file changed or vanished under us; drop the
                    // half-written entry and keep the archive usable.
                    writer.abort_file()?;
                    warn!("Skipping file {:?} mid-write: {}", entry.src, e);
                    skipped.push(Error::from(e).with_msg(format!("Skipped {:?}", entry.src)));
                }
            }
        }

        writer
            .finish()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?;

        Ok((written, skipped))
    });

    let writer_res = join_thread(writer_join_handle, "archive writer");
    let producer_err = join_thread(producer_join_handle, "entry producer").err();

    match writer_res {
        Ok((0, skipped)) => {
            remove_stale_tmp(tmp_path.as_path());
            if let Some(e) = producer_err {
                // Every source failed to produce entries; that is a failed
                // run, not an empty one.
                return Err(e.with_msg(format!("No files archived for game {:?}", game.name())));
            }
            info!("No files to archive for game {:?}", game.name());
            Ok((None, collect_non_fatal(skipped, None)))
        }
        Ok((written, skipped)) => {
            let final_path = dest_dir.join(&file_name);
            if let Err(e) = std::fs::rename(tmp_path.as_path(), &final_path) {
                remove_stale_tmp(tmp_path.as_path());
                return Err(Error::from(e)
                    .with_msg(format!("Could not move archive into place for {file_name:?}")));
            }
            if permanent {
                mark_read_only(&final_path);
            }
            info!(
                "Archived {} files for game {:?} to {:?}",
                written,
                game.name(),
                final_path
            );
            Ok((Some(final_path), collect_non_fatal(skipped, producer_err)))
        }
        Err(e) => {
            remove_stale_tmp(tmp_path.as_path());
            Err(match producer_err {
                Some(pe) => e.chain(pe),
                None => e,
            })
        }
    }
}

/// Newest archive by modification time, non-recursive; `permanent/` being a
/// subdirectory is never considered.
pub fn latest_archive(backup_dir: &Path) -> Option<PathBuf> {
    archive_files(backup_dir).into_iter().max_by_key(|path| {
        std::fs::metadata(path)
            .and_then(|md| md.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    })
}

/// Maps `saves/...`, `mods/...`, `additional/...` entry paths onto the
/// game's configured directories.
fn target_path(game: &GameEntry, inner_path: &Path) -> Option<PathBuf> {
    let mut components = inner_path.components();
    let first = components.next()?;
    let prefix = ArchivePrefix::of_component(&first.as_os_str().to_string_lossy())?;
    let root: &PathBuf = match prefix {
        ArchivePrefix::Saves => game.source_path(),
        ArchivePrefix::Mods => game.mod_path().as_ref()?,
        ArchivePrefix::Additional => game.additional_path().as_ref()?,
    };
    Some(root.join(components.as_path()))
}

/// Extracts the newest archive back over the game's configured paths,
/// overwriting whatever is there.
///
/// Returns the restored archive path, or `None` when the game has no
/// archives yet. Entries whose prefix has no configured target (for
/// example `mods/...` when `mod_path` is unset) are skipped.
pub fn restore_latest(game: &GameEntry, settings: &ArchiveSettings) -> Result<Option<PathBuf>> {
    let backup_dir = game_backup_dir(settings.root_folder(), game.name());
    let Some(archive_path) = latest_archive(&backup_dir) else {
        info!("No archive to restore for game {:?}", game.name());
        return Ok(None);
    };

    info!("Restoring game {:?} from {:?}", game.name(), archive_path);
    let mut archive = ZipArchive::new(BufReader::new(File::open(&archive_path)?))?;
    let mut restored = 0u64;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let Some(inner_path) = file.enclosed_name() else {
            warn!("Skipping archive entry with unsafe name {:?}", file.name());
            continue;
        };
        let Some(target) = target_path(game, &inner_path) else {
            debug!("Skipping entry {:?} with no configured target", file.name());
            continue;
        };

        if file.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut file, &mut out)?;
        restored += 1;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        }
    }
    info!("Restored {} files for game {:?}", restored, game.name());
    Ok(Some(archive_path))
}

/// Archives recorded for a game, including permanent ones.
pub fn backup_count(game: &GameEntry, settings: &ArchiveSettings) -> usize {
    let dir = game_backup_dir(settings.root_folder(), game.name());
    archive_files(&dir).len() + archive_files(&dir.join(PERMANENT_DIR)).len()
}
