//! Vaultkeep CLI - Backups for a supervised Vaultwarden instance
//!
//! Usage:
//!   vaultkeep daemon              Run scheduled backups in the foreground
//!   vaultkeep backup              Back up now
//!   vaultkeep restore NAME        Restore from a remote backup
//!   vaultkeep restore --file PATH Restore from a local archive
//!   vaultkeep list                List remote backups

mod cli;
mod commands;


use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vaultkeep_core::{BackupService, Settings};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    // The log file is append-only and shared by every invocation
    let log_file = std::fs::create_dir_all(&settings.conf_dir)
        .and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(settings.log_path())
        });
    let (file_layer, log_error) = match log_file {
        Ok(file) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .with(file_layer)
        .init();

    if let Some(e) = log_error {
        warn!(
            "Cannot write {}: {}; logging to console only",
            settings.log_path().display(),
            e
        );
    }

    match cli.command {
        Commands::Daemon { poll_secs } => {
            let service = Arc::new(open_service(settings)?);
            commands::cmd_daemon(service, poll_secs).await
        }
        Commands::Backup => commands::cmd_backup(&open_service(settings)?).await,
        Commands::Restore { name, file, yes } => {
            let service = open_service(settings)?;
            commands::cmd_restore(&service, name.as_deref(), file.as_deref(), yes).await
        }
        Commands::List { json } => commands::cmd_list(&open_service(settings)?, json).await,
        Commands::Prune { dry_run } => {
            commands::cmd_prune(&open_service(settings)?, dry_run).await
        }
        Commands::Schedule => commands::cmd_schedule(&open_service(settings)?),
        Commands::Config { action } => {
            let service = open_service(settings)?;
            match action {
                None | Some(ConfigAction::Show) => commands::cmd_config_show(&service),
                Some(ConfigAction::Set { key, value }) => {
                    commands::cmd_config_set(&service, &key, &value)
                }
            }
        }
        Commands::Logs { lines } => commands::cmd_logs(&settings, lines),
    }
}

fn open_service(settings: Settings) -> Result<BackupService> {
    BackupService::from_settings(settings).context("Failed to set up backup service")
}
