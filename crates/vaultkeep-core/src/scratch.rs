//! Scratch files of a single run
//!
//! Every pipeline run registers the temporary files it creates here and
//! releases them on exit, whatever the outcome. Cleanup never fails the run.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;

/// Tracks temporary paths created during one run
#[derive(Debug, Default)]
pub struct Scratch {
    dir: PathBuf,
    paths: Vec<PathBuf>,
}

impl Scratch {
    /// Prepare the scratch directory
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            paths: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of `name` inside the scratch directory, registered for cleanup
    pub fn file(&mut self, name: &str) -> PathBuf {
        let path = self.dir.join(name);
        self.track(path.clone());
        path
    }

    /// Register an existing path for cleanup
    pub fn track(&mut self, path: PathBuf) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Remove every registered path; safe to call more than once
    pub fn cleanup(&mut self) -> CleanupReport {
        let report = cleanup_paths(&self.paths);
        self.paths.clear();
        report
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if !self.paths.is_empty() {
            self.cleanup();
        }
    }
}

/// Outcome of a cleanup pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub missing: usize,
    pub failed: Vec<PathBuf>,
}

/// Remove each path if it exists, logging and swallowing failures
pub fn cleanup_paths(paths: &[PathBuf]) -> CleanupReport {
    let mut report = CleanupReport::default();

    for path in paths {
        let result = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                report.missing += 1;
                continue;
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!("Removed scratch file {}", path.display());
                report.removed += 1;
            }
            Err(e) => {
                warn!("Failed to remove scratch file {}: {}", path.display(), e);
                report.failed.push(path.clone());
            }
        }
    }

    report
}
