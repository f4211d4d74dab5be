//! Run lock
//!
//! Two layers: an in-process mutex orders pipelines of one `BackupService`,
//! and an advisory lock on `vaultkeep.lock` in the config directory orders
//! every process sharing that directory (daemon, manual `backup`, `restore`).
//! Both are held from "stop service" to "service back up".

use std::fs::{self, File, OpenOptions};
use std::path::Path;

use fs2::FileExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use super::blocking;
use crate::error::Result;

/// Held for the duration of one pipeline run
pub(crate) struct RunGuard<'a> {
    _local: MutexGuard<'a, ()>,
    file: File,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release run lock: {}", e);
        }
    }
}

/// Take both locks, waiting behind whichever run holds them
pub(crate) async fn acquire<'a>(
    local: &'a Mutex<()>,
    path: &Path,
    what: &str,
) -> Result<RunGuard<'a>> {
    let local = match local.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
            info!("Another backup or restore is running; {} waits", what);
            local.lock().await
        }
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let file = match file.try_lock_exclusive() {
        Ok(()) => file,
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
            info!(
                "Another vaultkeep process holds {}; {} waits",
                path.display(),
                what
            );
            blocking(move || {
                file.lock_exclusive()?;
                Ok(file)
            })
            .await?
        }
        Err(e) => return Err(e.into()),
    };

    Ok(RunGuard {
        _local: local,
        file,
    })
}
