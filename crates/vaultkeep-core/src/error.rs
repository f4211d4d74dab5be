//! Error types for vaultkeep

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service control error: {0}")]
    ServiceControl(String),

    #[error("Archive build error: {0}")]
    ArchiveBuild(String),

    #[error("Invalid backup archive: {0}")]
    Validation(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Remote transfer error: {0}")]
    RemoteTransfer(String),

    #[error("Retention error: {0}")]
    Retention(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    /// The managed service could not be brought back up after its data was touched.
    #[error("CRITICAL: service is down: {0}")]
    Critical(String),
}

impl Error {
    /// Whether this failure left the managed service stopped
    pub fn is_critical(&self) -> bool {
        matches!(self, Error::Critical(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
