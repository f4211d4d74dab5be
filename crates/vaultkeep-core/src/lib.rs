//! Vaultkeep Core Library
//!
//! Backup and restore of a supervised Vaultwarden data directory:
//! - Archive builder (tar.gz) with optional AES-256-GCM encryption
//! - Remote store gateway (WebDAV) for uploads, listings and downloads
//! - Retention manager with flat-count and grandfather-father-son policies
//! - Service lifecycle control through supervisorctl
//! - Restore pipeline that validates before it touches any data
//! - Scheduler binding for the single recurring backup job

pub mod archive;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod pipeline;
pub mod remote;
pub mod retention;
pub mod scheduler;
pub mod scratch;

/// Test utilities: in-memory remote store, recording controller and notifier
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use archive::ArchiveStats;
pub use backup::{generate_backup_name, parse_backup_time, BackupInfo};
pub use config::{
    BackupConfig, ConfigStore, JsonConfigStore, MemoryConfigStore, RemoteConfig, RetentionMode,
    Settings,
};
pub use error::{Error, Result};
pub use lifecycle::{ServiceController, SupervisorController};
pub use notify::{Notifier, TelegramNotifier};
pub use pipeline::{BackupOutcome, BackupReport, BackupService, RestoreOutcome, RestoreSource};
pub use remote::{RemoteConnector, RemoteEntry, RemoteStore, WebDavConnector, WebDavStore};
pub use retention::{GfsWindows, PruneResult, RetentionPlan, RetentionPolicy};
pub use scheduler::{ScheduleSpec, ScheduledJob, Scheduler, Trigger, JOB_KEY};
