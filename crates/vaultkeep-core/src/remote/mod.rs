//! Remote object store gateway
//!
//! # Architecture
//!
//! - `RemoteStore` trait defines the operations the pipelines need from a store
//! - `WebDavStore` talks to a WebDAV server over HTTP(S)
//! - `RemoteConnector` builds a store from freshly loaded configuration, so every
//!   run picks up the current endpoint and credentials
//!
//! Paths handed to a store are absolute-looking (`/dir/name`) and relative to the
//! configured endpoint.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::error::Result;

mod webdav;

pub use webdav::{parse_multistatus, WebDavConnector, WebDavStore};

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Base name of the entry
    pub name: String,
    /// Path usable with `download`/`remove`
    pub path: String,
    /// Size in bytes, 0 when the server does not report it
    pub size: u64,
    pub is_directory: bool,
    /// Server-provided modification time, passed through verbatim
    pub last_modified: Option<String>,
}

/// Trait for remote backup stores
///
/// Implementations handle transferring backups to and from a remote location.
/// Transfers may block for as long as the transport allows.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Human-readable name for this store
    fn name(&self) -> &str;

    /// List the immediate children of a directory
    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>>;

    /// Upload a local file to a remote path
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Download a remote file to a local path
    async fn download(&self, remote: &str, local: &Path) -> Result<()>;

    /// Delete a remote file
    async fn remove(&self, remote: &str) -> Result<()>;

    /// Whether a remote path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create a remote directory
    async fn mkdir(&self, dir: &str) -> Result<()>;
}

/// Builds a store for the remote section of the current configuration
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>>;
}

/// Join a remote directory and a file name with a single separator
pub fn join_remote(dir: &str, name: &str) -> String {
    let joined = format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'));
    normalize_remote(&joined)
}

/// Collapse duplicate separators and make the path absolute
pub fn normalize_remote(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// The same path with its leading separator toggled
///
/// Servers disagree on whether listing paths are rooted; deletions retry with
/// the other convention before giving up.
pub fn alternate_remote(path: &str) -> String {
    match path.strip_prefix('/') {
        Some(rest) => rest.to_string(),
        None => format!("/{}", path),
    }
}

/// Create the remote directory if needed, ignoring failures
///
/// Most failures here mean the directory already exists; a real problem
/// surfaces on the upload that follows.
pub async fn ensure_remote_dir(store: &dyn RemoteStore, dir: &str) {
    let dir = normalize_remote(dir);
    if dir == "/" {
        return;
    }
    match store.exists(&dir).await {
        Ok(true) => {}
        Ok(false) => {
            if let Err(e) = store.mkdir(&dir).await {
                debug!("mkdir {} failed (ignored): {}", dir, e);
            }
        }
        Err(e) => debug!("exists check for {} failed (ignored): {}", dir, e),
    }
}

/// Delete a remote file, retrying once with the alternate path convention
pub async fn remove_with_fallback(store: &dyn RemoteStore, path: &str) -> Result<()> {
    match store.remove(path).await {
        Ok(()) => Ok(()),
        Err(first) => {
            let alternate = alternate_remote(path);
            warn!(
                "Failed to delete {} ({}), retrying as {}",
                path, first, alternate
            );
            store.remove(&alternate).await
        }
    }
}
