//! Backup pipeline: stop → pack → start → encrypt → upload → prune → cleanup

use std::path::PathBuf;

use chrono::Local;
use tracing::{info, warn};

use super::{blocking, BackupOutcome, BackupReport, BackupService};
use crate::archive::{build_archive, is_file_allowed};
use crate::backup::{generate_backup_name, plaintext_name};
use crate::config::BackupConfig;
use crate::crypto::{encrypt_file, file_digest};
use crate::error::{Error, Result};
use crate::remote::{ensure_remote_dir, join_remote};
use crate::retention::apply_retention;
use crate::scratch::Scratch;

impl BackupService {
    /// Run one backup to completion
    ///
    /// Skips when no remote endpoint is configured. The service is down only
    /// between stop and start; encryption and upload happen after it is back.
    pub async fn run_backup_now(&self) -> BackupOutcome {
        let config = match self.config.load() {
            Ok(config) => config,
            Err(e) => {
                self.report_failure(&BackupConfig::default(), "Backup", &e);
                return BackupOutcome::Failed(e);
            }
        };

        if config.remote().is_none() {
            info!("No remote endpoint configured; skipping backup");
            return BackupOutcome::Skipped("No remote endpoint configured".to_string());
        }

        let _guard = match self.lock_run("backup").await {
            Ok(guard) => guard,
            Err(e) => {
                self.report_failure(&config, "Backup", &e);
                return BackupOutcome::Failed(e);
            }
        };
        info!(">>> Starting backup");

        let mut scratch = match Scratch::new(&self.settings.scratch_dir) {
            Ok(scratch) => scratch,
            Err(e) => {
                self.report_failure(&config, "Backup", &e);
                return BackupOutcome::Failed(e);
            }
        };

        let result = self.backup_steps(&config, &mut scratch).await;
        let cleanup = scratch.cleanup();
        if !cleanup.failed.is_empty() {
            warn!("{} scratch files could not be removed", cleanup.failed.len());
        }

        match result {
            Ok(report) => {
                info!("<<< Backup complete: {}", report.name);
                let mut message = format!(
                    "Uploaded {} ({:.2} MB)",
                    report.name,
                    report.size as f64 / 1024.0 / 1024.0
                );
                if let Some(prune) = &report.prune {
                    if prune.deleted_count > 0 {
                        message.push_str(&format!(", pruned {} old backups", prune.deleted_count));
                    }
                }
                self.report(&config, &message, true);
                BackupOutcome::Completed(report)
            }
            Err(e) => {
                self.report_failure(&config, "Backup", &e);
                BackupOutcome::Failed(e)
            }
        }
    }

    async fn backup_steps(&self, config: &BackupConfig, scratch: &mut Scratch) -> Result<BackupReport> {
        let passphrase = config.passphrase().map(str::to_string);
        let name = generate_backup_name(passphrase.is_some());
        let archive_path = scratch.file(plaintext_name(&name));

        // Nothing has been touched if stop fails
        self.controller.stop().await?;

        let source = self.settings.data_dir.clone();
        let dest = archive_path.clone();
        let packed = blocking(move || build_archive(&source, &dest, is_file_allowed)).await;

        // Bring the service back before anything else, whatever packing did
        if let Err(start_error) = self.controller.start().await {
            let mut message = start_error.to_string();
            if let Err(pack_error) = &packed {
                message.push_str(&format!(" (after archive failure: {})", pack_error));
            }
            return Err(Error::Critical(message));
        }
        let archive = packed?;

        let upload_path: PathBuf = match passphrase {
            Some(passphrase) => {
                let encrypted = scratch.file(&name);
                let (source, dest) = (archive_path.clone(), encrypted.clone());
                blocking(move || encrypt_file(&source, &dest, &passphrase)).await?;
                encrypted
            }
            None => archive_path,
        };

        let digest_path = upload_path.clone();
        let digest = blocking(move || file_digest(&digest_path)).await?;
        let size = std::fs::metadata(&upload_path)?.len();

        let (store, remote) = self.connect(config)?;
        ensure_remote_dir(store.as_ref(), &remote.directory).await;
        let remote_path = join_remote(&remote.directory, &name);
        store
            .upload(&upload_path, &remote_path)
            .await
            .map_err(|e| match e {
                Error::RemoteTransfer(_) => e,
                other => Error::RemoteTransfer(other.to_string()),
            })?;
        info!("Uploaded {} (sha256 {})", remote_path, digest);

        // A failed retention pass never fails the backup
        let prune = match apply_retention(
            store.as_ref(),
            &remote.directory,
            &config.retention_policy(),
            Local::now().naive_local(),
        )
        .await
        {
            Ok(prune) => {
                if prune.deleted_count > 0 {
                    info!("Retention removed {} backups", prune.deleted_count);
                }
                Some(prune)
            }
            Err(e) => {
                warn!("Retention pass failed: {}", e);
                None
            }
        };

        Ok(BackupReport {
            name,
            remote_path,
            size,
            digest,
            archive,
            prune,
        })
    }
}
