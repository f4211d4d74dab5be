//! Backup and restore entry points
//!
//! `BackupService` wires the collaborators together and exposes the operations
//! callers invoke: `run_backup_now`, `run_restore`, remote listing and pruning.
//! Both pipelines hold one run lock from "stop service" to "service back up",
//! so a scheduled backup and a manual restore never interleave, in this
//! process or in another one sharing the config directory.
//!
//! Entry points never return errors. Failures are logged, sent as a
//! notification and returned as an outcome value.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::error;

use crate::archive::ArchiveStats;
use crate::backup::is_backup_name;
use crate::config::{BackupConfig, ConfigStore, JsonConfigStore, RemoteConfig, Settings};
use crate::error::{Error, Result};
use crate::lifecycle::{ServiceController, SupervisorController};
use crate::notify::{Notifier, TelegramNotifier};
use crate::remote::{RemoteConnector, RemoteEntry, RemoteStore, WebDavConnector};
use crate::retention::{apply_retention, plan_retention, PruneResult, RetentionPlan};
use crate::scheduler::ScheduledJob;

mod backup;
mod lock;
mod restore;

/// Result of one backup run
#[derive(Debug)]
pub enum BackupOutcome {
    Completed(BackupReport),
    /// Nothing to do, e.g. no remote endpoint configured
    Skipped(String),
    Failed(Error),
}

/// What a completed backup produced
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub name: String,
    pub remote_path: String,
    pub size: u64,
    /// Hex SHA-256 of the uploaded file
    pub digest: String,
    pub archive: ArchiveStats,
    /// `None` when the retention pass could not run
    pub prune: Option<PruneResult>,
}

/// Where a restore reads its archive from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    /// Backup name (or path) in the configured remote directory
    Remote(String),
    /// Local file, consumed by the restore
    Local(PathBuf),
}

/// Result of one restore run
#[derive(Debug)]
pub enum RestoreOutcome {
    Completed { name: String, entries: usize },
    Failed(Error),
}

impl BackupOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, BackupOutcome::Failed(_))
    }
}

impl RestoreOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RestoreOutcome::Failed(_))
    }
}

/// Backup/restore orchestrator
pub struct BackupService {
    config: Arc<dyn ConfigStore>,
    controller: Arc<dyn ServiceController>,
    connector: Arc<dyn RemoteConnector>,
    notifier: Arc<dyn Notifier>,
    settings: Settings,
    run_lock: Mutex<()>,
}

impl BackupService {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        controller: Arc<dyn ServiceController>,
        connector: Arc<dyn RemoteConnector>,
        notifier: Arc<dyn Notifier>,
        settings: Settings,
    ) -> Self {
        Self {
            config,
            controller,
            connector,
            notifier,
            settings,
            run_lock: Mutex::new(()),
        }
    }

    /// Production wiring: JSON config file, supervisorctl, WebDAV, Telegram
    pub fn from_settings(settings: Settings) -> Result<Self> {
        Ok(Self::new(
            Arc::new(JsonConfigStore::new(settings.config_path())),
            Arc::new(SupervisorController::from_settings(&settings)),
            Arc::new(WebDavConnector::new()),
            Arc::new(TelegramNotifier::new()?),
            settings,
        ))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Current configuration, read fresh from the store
    pub fn load_config(&self) -> Result<BackupConfig> {
        self.config.load()
    }

    pub fn save_config(&self, config: &BackupConfig) -> Result<()> {
        self.config.save(config)
    }

    /// Take the run lock, waiting behind a pipeline that already holds it
    async fn lock_run(&self, what: &str) -> Result<lock::RunGuard<'_>> {
        lock::acquire(&self.run_lock, &self.settings.lock_path(), what).await
    }

    fn connect(&self, config: &BackupConfig) -> Result<(Arc<dyn RemoteStore>, RemoteConfig)> {
        let remote = config
            .remote()
            .ok_or_else(|| Error::Config("No remote endpoint configured".into()))?;
        let store = self.connector.connect(&remote)?;
        Ok((store, remote))
    }

    /// Send a notification according to the configured policy
    ///
    /// Failures always go out; successes only with `notify_on_success`.
    fn report(&self, config: &BackupConfig, message: &str, success: bool) {
        if success && !config.notify_on_success {
            return;
        }
        self.notifier.notify(config, message, success);
    }

    /// Log and notify a pipeline failure
    fn report_failure(&self, config: &BackupConfig, what: &str, e: &Error) {
        if e.is_critical() {
            error!("{} failed and the service is down: {}", what, e);
        } else {
            error!("{} failed: {}", what, e);
        }
        self.report(config, &format!("{} failed: {}", what, e), false);
    }

    /// Backups in the remote directory, newest first
    pub async fn list_backups(&self) -> Result<Vec<RemoteEntry>> {
        let config = self.config.load()?;
        let (store, remote) = self.connect(&config)?;

        let mut entries: Vec<RemoteEntry> = store
            .list(&remote.directory)
            .await?
            .into_iter()
            .filter(|entry| !entry.is_directory && is_backup_name(&entry.name))
            .collect();
        entries.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(entries)
    }

    /// What a prune would keep and delete right now, without deleting
    pub async fn plan_prune(&self) -> Result<RetentionPlan> {
        let config = self.config.load()?;
        let (store, remote) = self.connect(&config)?;
        let entries = store
            .list(&remote.directory)
            .await
            .map_err(|e| Error::Retention(format!("Failed to list {}: {}", remote.directory, e)))?;
        Ok(plan_retention(
            &entries,
            &config.retention_policy(),
            Local::now().naive_local(),
        ))
    }

    /// Apply the configured retention policy now
    pub async fn prune_now(&self) -> Result<PruneResult> {
        let config = self.config.load()?;
        let (store, remote) = self.connect(&config)?;
        apply_retention(
            store.as_ref(),
            &remote.directory,
            &config.retention_policy(),
            Local::now().naive_local(),
        )
        .await
    }
}

#[async_trait]
impl ScheduledJob for BackupService {
    async fn run(&self) {
        // Outcome is already logged and notified
        let _ = self.run_backup_now().await;
    }
}

/// Run blocking file work on the blocking pool
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?
}
