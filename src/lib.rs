//! # savewarden
//!
//! A background service that keeps rolling zip backups of game save data.
//!
//! ## Features
//!
//! - **Scheduled Backups**: per-game intervals driven by a periodic scan loop
//! - **Multiple Sources**: save, mod, and additional directories per game
//! - **Retention Management**: per-game age limits, with a `permanent/` escape hatch
//! - **Dated Folder Consolidation**: rotating autosave dumps tidied into `SpecialArchive/`
//! - **Process Awareness**: games can be skipped while their process is not running
//! - **Persisted Status**: crash-safe JSON state for external monitoring
//!
//! ## Quick Start
//!
//! ```no_run
//! use savewarden::backup::config::FileConfig;
//! use savewarden::backup::scheduler::BackupScheduler;
//! use savewarden::backup::settings::SettingsProvider;
//! use savewarden::backup::state::StateStore;
//! use std::sync::Arc;
//!
//! // Load and validate the YAML config file
//! let config = Arc::new(FileConfig::open("warden.yaml")?);
//!
//! // Start the backup service
//! let state = Arc::new(StateStore::load(config.current().state_file_path()));
//! let thread_pool = Arc::new(rayon::ThreadPoolBuilder::new().build()?);
//! let mut scheduler = BackupScheduler::new(config.clone(), config, state, thread_pool);
//! scheduler.start();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
