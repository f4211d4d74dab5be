//! Restore pipeline
//!
//! received → [decrypted] → validated → data-cleared → unpacked →
//! service-restarted → cleaned-up
//!
//! Once the archive is on local disk the service is brought up exactly once,
//! whatever happens in between: `restart` if this run stopped it, `start`
//! otherwise. A failure to bring it up is always critical.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::{blocking, BackupService, RestoreOutcome, RestoreSource};
use crate::archive::{clear_directory, unpack_archive, validate_archive};
use crate::backup::{base_name, is_encrypted_name, plaintext_name};
use crate::config::BackupConfig;
use crate::crypto::decrypt_file;
use crate::error::{Error, Result};
use crate::remote::join_remote;
use crate::scratch::{cleanup_paths, Scratch};

impl BackupService {
    /// Restore the data directory from a remote backup or a local file
    ///
    /// A local file is treated as scratch: it is removed when the run ends.
    pub async fn run_restore(&self, source: RestoreSource) -> RestoreOutcome {
        let config = match self.config.load() {
            Ok(config) => config,
            Err(e) => {
                discard_local(&source);
                self.report_failure(&BackupConfig::default(), "Restore", &e);
                return RestoreOutcome::Failed(e);
            }
        };

        let _guard = match self.lock_run("restore").await {
            Ok(guard) => guard,
            Err(e) => {
                discard_local(&source);
                self.report_failure(&config, "Restore", &e);
                return RestoreOutcome::Failed(e);
            }
        };
        info!(">>> Starting restore");

        let mut scratch = match Scratch::new(&self.settings.scratch_dir) {
            Ok(scratch) => scratch,
            Err(e) => {
                discard_local(&source);
                self.report_failure(&config, "Restore", &e);
                return RestoreOutcome::Failed(e);
            }
        };

        let result = match self.receive(&config, source, &mut scratch).await {
            Ok((name, path)) => self.restore_received(&config, &name, &path, &mut scratch).await,
            Err(e) => Err(e),
        };
        scratch.cleanup();

        match result {
            Ok((name, entries)) => {
                info!("<<< Restore complete: {} ({} entries)", name, entries);
                self.report(&config, &format!("Restored {}", name), true);
                RestoreOutcome::Completed { name, entries }
            }
            Err(e) => {
                self.report_failure(&config, "Restore", &e);
                RestoreOutcome::Failed(e)
            }
        }
    }

    /// Get the archive onto local disk; the service is not touched here
    async fn receive(
        &self,
        config: &BackupConfig,
        source: RestoreSource,
        scratch: &mut Scratch,
    ) -> Result<(String, PathBuf)> {
        match source {
            RestoreSource::Local(path) => {
                scratch.track(path.clone());
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        Error::Validation(format!("{} is not a file", path.display()))
                    })?;
                if !path.is_file() {
                    return Err(Error::Validation(format!("{} not found", path.display())));
                }
                Ok((name, path))
            }
            RestoreSource::Remote(requested) => {
                let name = base_name(&requested).to_string();
                if name.is_empty() {
                    return Err(Error::Validation("Empty backup name".into()));
                }
                let (store, remote) = self.connect(config)?;
                let local = scratch.file(&name);
                let remote_path = join_remote(&remote.directory, &name);
                info!("Downloading {}", remote_path);
                store.download(&remote_path, &local).await.map_err(|e| match e {
                    Error::RemoteTransfer(_) => e,
                    other => Error::RemoteTransfer(other.to_string()),
                })?;
                Ok((name, local))
            }
        }
    }

    async fn restore_received(
        &self,
        config: &BackupConfig,
        name: &str,
        path: &Path,
        scratch: &mut Scratch,
    ) -> Result<(String, usize)> {
        let mut stopped = false;
        let result = self
            .restore_steps(config, name, path, scratch, &mut stopped)
            .await;

        let bring_up = if stopped {
            self.controller.restart().await
        } else {
            self.controller.start().await
        };

        match (result, bring_up) {
            (Ok(entries), Ok(())) => Ok((name.to_string(), entries)),
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(up)) => Err(Error::Critical(up.to_string())),
            (Err(e), Err(up)) => Err(Error::Critical(format!("{} (after restore failure: {})", up, e))),
        }
    }

    async fn restore_steps(
        &self,
        config: &BackupConfig,
        name: &str,
        path: &Path,
        scratch: &mut Scratch,
        stopped: &mut bool,
    ) -> Result<usize> {
        let archive = if is_encrypted_name(name) {
            let passphrase = config.passphrase().map(str::to_string).ok_or_else(|| {
                Error::Encryption(format!(
                    "{} is encrypted but no encryption password is configured",
                    name
                ))
            })?;
            let decrypted = scratch.file(plaintext_name(name));
            let (source, dest) = (path.to_path_buf(), decrypted.clone());
            blocking(move || decrypt_file(&source, &dest, &passphrase)).await?;
            info!("Decrypted {}", name);
            decrypted
        } else {
            path.to_path_buf()
        };

        let to_check = archive.clone();
        let entries = blocking(move || validate_archive(&to_check)).await?;
        info!("Archive {} is valid ({} entries)", name, entries);

        self.controller.stop().await?;
        *stopped = true;

        let data_dir = self.settings.data_dir.clone();
        blocking(move || {
            clear_directory(&data_dir)?;
            unpack_archive(&archive, &data_dir)
        })
        .await
        .map_err(|e| {
            warn!("Data directory may be incomplete: {}", e);
            e
        })?;

        Ok(entries)
    }
}

/// A local source is consumed even when the run fails before tracking it
fn discard_local(source: &RestoreSource) {
    if let RestoreSource::Local(path) = source {
        cleanup_paths(std::slice::from_ref(path));
    }
}
