//! Test utilities for vaultkeep-core
//!
//! In-process doubles for every collaborator of the pipelines: a remote store
//! kept in memory, a service controller and a notifier that record their calls.
//! Doubles can share a `Journal` so tests can assert on the order of events
//! across collaborators (e.g. service start before upload).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::backup::base_name;
use crate::config::{BackupConfig, RemoteConfig};
use crate::error::{Error, Result};
use crate::lifecycle::ServiceController;
use crate::notify::Notifier;
use crate::remote::{normalize_remote, RemoteConnector, RemoteEntry, RemoteStore};

/// Ordered record of events shared between doubles
pub type Journal = Arc<Mutex<Vec<String>>>;

fn record(journal: &Option<Journal>, event: String) {
    if let Some(journal) = journal {
        journal.lock().unwrap().push(event);
    }
}

fn parent_of(path: &str) -> String {
    match normalize_remote(path).rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => "/".to_string(),
    }
}

#[derive(Default)]
struct StoreState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    fail_remove: HashSet<String>,
    fail_list: bool,
    fail_upload: bool,
    fail_download: bool,
}

/// Remote store held in memory
///
/// Keys are stored exactly as given, so a file inserted as `vw/a` is not
/// removable as `/vw/a`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    journal: Option<Journal>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    /// Put a file straight into the store
    pub fn insert(&self, path: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), data.to_vec());
    }

    /// Contents of a stored file
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    /// Keys of every stored file, sorted
    pub fn paths(&self) -> Vec<String> {
        self.state.lock().unwrap().files.keys().cloned().collect()
    }

    /// Make removal of any path ending in `name` fail
    pub fn fail_remove(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_remove
            .insert(name.to_string());
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().unwrap().fail_list = fail;
    }

    pub fn fail_upload(&self, fail: bool) {
        self.state.lock().unwrap().fail_upload = fail;
    }

    pub fn fail_download(&self, fail: bool) {
        self.state.lock().unwrap().fail_download = fail;
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>> {
        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(Error::RemoteTransfer("listing refused".into()));
        }

        let dir = normalize_remote(dir);

        let mut entries: Vec<RemoteEntry> = state
            .files
            .iter()
            .filter(|(path, _)| parent_of(path.as_str()) == dir)
            .map(|(path, data)| RemoteEntry {
                name: base_name(path).to_string(),
                path: path.clone(),
                size: data.len() as u64,
                is_directory: false,
                last_modified: None,
            })
            .collect();
        entries.extend(
            state
                .dirs
                .iter()
                .filter(|path| parent_of(path.as_str()) == dir && path.as_str() != dir)
                .map(|path| RemoteEntry {
                    name: base_name(path).to_string(),
                    path: path.clone(),
                    size: 0,
                    is_directory: true,
                    last_modified: None,
                }),
        );
        Ok(entries)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        if self.state.lock().unwrap().fail_upload {
            return Err(Error::RemoteTransfer(format!("upload of {} refused", remote)));
        }
        let data = std::fs::read(local)
            .map_err(|e| Error::RemoteTransfer(format!("read {}: {}", local.display(), e)))?;
        self.insert(remote, &data);
        record(&self.journal, format!("upload {}", remote));
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let data = {
            let state = self.state.lock().unwrap();
            if state.fail_download {
                return Err(Error::RemoteTransfer(format!("download of {} refused", remote)));
            }
            state
                .files
                .get(remote)
                .or_else(|| state.files.get(&normalize_remote(remote)))
                .cloned()
                .ok_or_else(|| Error::RemoteTransfer(format!("{} not found", remote)))?
        };
        std::fs::write(local, data)?;
        record(&self.journal, format!("download {}", remote));
        Ok(())
    }

    async fn remove(&self, remote: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remove.iter().any(|name| remote.ends_with(name.as_str())) {
            return Err(Error::RemoteTransfer(format!("delete of {} refused", remote)));
        }
        state
            .files
            .remove(remote)
            .map(|_| ())
            .ok_or_else(|| Error::RemoteTransfer(format!("{} not found", remote)))?;
        drop(state);
        record(&self.journal, format!("remove {}", remote));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.files.contains_key(path) || state.dirs.contains(&normalize_remote(path)))
    }

    async fn mkdir(&self, dir: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .dirs
            .insert(normalize_remote(dir));
        record(&self.journal, format!("mkdir {}", normalize_remote(dir)));
        Ok(())
    }
}

/// Connector that hands out the same in-memory store
pub struct StaticConnector {
    store: MemoryStore,
    connections: Mutex<Vec<RemoteConfig>>,
}

impl StaticConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Remote sections the pipelines connected with, in order
    pub fn connections(&self) -> Vec<RemoteConfig> {
        self.connections.lock().unwrap().clone()
    }
}

impl RemoteConnector for StaticConnector {
    fn connect(&self, config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>> {
        self.connections.lock().unwrap().push(config.clone());
        Ok(Arc::new(self.store.clone()))
    }
}

#[derive(Default)]
struct ControllerState {
    calls: Vec<&'static str>,
    fail: HashSet<&'static str>,
    delays: HashMap<&'static str, Duration>,
}

/// Service controller that records verbs and can be told to fail them
#[derive(Clone, Default)]
pub struct RecordingController {
    state: Arc<Mutex<ControllerState>>,
    journal: Option<Journal>,
}

impl RecordingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    /// Make every call of `verb` ("stop", "start" or "restart") fail
    pub fn fail(&self, verb: &'static str) {
        self.state.lock().unwrap().fail.insert(verb);
    }

    /// Make every call of `verb` take `delay` after it is recorded
    pub fn delay(&self, verb: &'static str, delay: Duration) {
        self.state.lock().unwrap().delays.insert(verb, delay);
    }

    /// Verbs called so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of start and restart calls
    pub fn bring_ups(&self) -> usize {
        self.calls()
            .iter()
            .filter(|verb| **verb == "start" || **verb == "restart")
            .count()
    }

    async fn call(&self, verb: &'static str) -> Result<()> {
        let (failed, delay) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(verb);
            (state.fail.contains(verb), state.delays.get(verb).copied())
        };
        record(&self.journal, verb.to_string());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failed {
            Err(Error::ServiceControl(format!("{} refused", verb)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ServiceController for RecordingController {
    async fn stop(&self) -> Result<()> {
        self.call("stop").await
    }

    async fn start(&self) -> Result<()> {
        self.call("start").await
    }

    async fn restart(&self) -> Result<()> {
        self.call("restart").await
    }
}

/// A notification as the notifier received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub message: String,
    pub success: bool,
}

/// Notifier that keeps every message instead of sending it
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<SentNotification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, _config: &BackupConfig, message: &str, success: bool) {
        self.sent.lock().unwrap().push(SentNotification {
            message: message.to_string(),
            success,
        });
    }
}
