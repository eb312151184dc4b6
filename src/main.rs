use clap::{Parser, Subcommand};
use rayon::ThreadPoolBuilder;
use savewarden::backup::config::FileConfig;
use savewarden::backup::game::GameRegistry;
use savewarden::backup::result_error::error::Error;
use savewarden::backup::result_error::result::Result;
use savewarden::backup::retention::cleanup_old_backups;
use savewarden::backup::scheduler::BackupScheduler;
use savewarden::backup::settings::SettingsProvider;
use savewarden::backup::special::process_special_backup;
use savewarden::backup::state::StateStore;
use savewarden::backup::zip::{backup_count, create_archive, restore_latest};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Keeps rolling zip backups of game save data
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the backup service until interrupted
    Run,
    /// Back up one game right now
    Backup {
        /// Game name as configured
        game: String,
        /// Store the archive under permanent/, exempt from retention
        #[arg(long)]
        permanent: bool,
    },
    /// Extract the newest archive of a game back over its source directories
    Restore {
        /// Game name as configured
        game: String,
    },
    /// Print the persisted service and per-game status
    Status,
}

fn run(args: Args) -> Result<()> {
    let config = Arc::new(FileConfig::open(&args.config)?);
    let settings = config.current();
    let thread_pool = Arc::new(ThreadPoolBuilder::new().build()?);

    match args.command {
        Command::Run => {
            let state = Arc::new(StateStore::load(settings.state_file_path()));
            let mut scheduler =
                BackupScheduler::new(config.clone(), config.clone(), state, thread_pool);
            scheduler.start();

            let mut signals = Signals::new([SIGINT, SIGTERM])?;
            if let Some(signal) = signals.forever().next() {
                info!("Received signal {signal}, shutting down");
            }
            scheduler.stop();
            Ok(())
        }
        Command::Backup { game, permanent } => {
            let game = config
                .find_game(&game)
                .ok_or_else(|| Error::UnknownGame(game))?;

            let moved = process_special_backup(&game, &settings)?;
            if moved > 0 {
                info!("Consolidated {moved} dated folder(s)");
            }

            let (file_path, non_fatal_error) =
                create_archive(&game, &settings, permanent, thread_pool)?;
            if let Some(non_fatal_error) = non_fatal_error {
                warn!("Received non fatal error: {non_fatal_error}");
            }
            match file_path {
                Some(path) => println!("{}", path.display()),
                None => info!("Nothing to archive for game {:?}", game.name()),
            }

            if !permanent {
                let deleted = cleanup_old_backups(&game, &settings);
                if deleted > 0 {
                    info!("Removed {deleted} out of retention archive(s)");
                }
            }
            Ok(())
        }
        Command::Restore { game } => {
            let game = config
                .find_game(&game)
                .ok_or_else(|| Error::UnknownGame(game))?;
            match restore_latest(&game, &settings)? {
                Some(path) => println!("Restored {}", path.display()),
                None => println!("No archive to restore for game {:?}", game.name()),
            }
            Ok(())
        }
        Command::Status => {
            let snapshot = StateStore::load(settings.state_file_path()).snapshot();
            println!(
                "Service: {} (updated {})",
                snapshot.service_status, snapshot.last_update_time
            );
            for entry in snapshot.games_state.values() {
                let archives = config
                    .find_game(&entry.game_name)
                    .map(|game| backup_count(&game, &settings))
                    .unwrap_or(0);
                let last = entry
                    .last_backup_time
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}: {} ({} archive(s), last backup: {})",
                    entry.game_name, entry.status, archives, last
                );
                if !entry.last_error.is_empty() {
                    println!("  last error: {}", entry.last_error);
                }
            }
            Ok(())
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("{e}");
        exit(1);
    }
}
