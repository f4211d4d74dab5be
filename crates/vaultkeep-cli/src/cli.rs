//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vaultkeep_core::Settings;

/// Vaultkeep - Backups for a supervised Vaultwarden instance
#[derive(Parser)]
#[command(name = "vaultkeep")]
#[command(about = "Backup, retention and restore for a Vaultwarden data directory", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Vaultwarden data directory (overrides VAULTKEEP_DATA_DIR)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Directory holding backup_config.json and manager.log (overrides VAULTKEEP_CONF_DIR)
    #[arg(long, global = true)]
    pub conf_dir: Option<PathBuf>,

    /// Scratch directory for temporary archives (overrides VAULTKEEP_SCRATCH_DIR)
    #[arg(long, global = true)]
    pub scratch_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Environment settings with command-line overrides applied
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::from_env();
        if let Some(dir) = &self.data_dir {
            settings.data_dir = dir.clone();
        }
        if let Some(dir) = &self.conf_dir {
            settings.conf_dir = dir.clone();
        }
        if let Some(dir) = &self.scratch_dir {
            settings.scratch_dir = dir.clone();
        }
        settings
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler in the foreground
    Daemon {
        /// Seconds between configuration checks
        #[arg(long, default_value = "30")]
        poll_secs: u64,
    },

    /// Run one backup now
    Backup,

    /// Restore the data directory from a backup
    Restore {
        /// Backup name in the remote directory
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        name: Option<String>,

        /// Restore from a local archive instead (the file is left in place)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// List backups in the remote directory
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply the retention policy to the remote directory
    Prune {
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the effective backup schedule
    Schedule,

    /// Show or edit the configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Print the end of the log file
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "100")]
        lines: usize,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the configuration with secrets masked
    Show,

    /// Set one configuration key (`null` removes it)
    Set {
        /// Configuration key, e.g. webdav_url or max_backups
        key: String,

        /// New value
        value: String,
    },
}
