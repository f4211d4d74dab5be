//! Backup artifacts and their naming contract
//!
//! A backup is identified only by its file name:
//!
//! `vw_backup_YYYYMMDD_HHMMSS.tar.gz[.enc]`
//!
//! The embedded timestamp (local time of the run) is the sole source of truth
//! for chronological ordering. Nothing else about a backup is stored; size and
//! path come from the remote listing.

use std::sync::OnceLock;

use chrono::{Local, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::remote::RemoteEntry;

/// Prefix every generated backup name starts with
pub const BACKUP_PREFIX: &str = "vw_backup_";

/// Extension of the plaintext archive format
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// Marker appended to encrypted archives
pub const ENCRYPTED_SUFFIX: &str = ".enc";

/// Timestamp layout embedded in backup names
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^vw_backup_(\d{8}_\d{6})(?:\..+)?$").expect("valid regex")
    })
}

/// Information about a remote backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Backup filename
    pub name: String,
    /// Remote path
    pub path: String,
    /// Size in bytes (0 when the remote store does not report it)
    pub size: u64,
    /// When the backup was created, parsed from the name
    pub created_at: NaiveDateTime,
    /// Whether the archive carries the encrypted marker
    pub encrypted: bool,
}

impl BackupInfo {
    /// Build from a listing entry; `None` for directories and foreign names
    pub fn from_entry(entry: &RemoteEntry) -> Option<Self> {
        if entry.is_directory {
            return None;
        }
        let created_at = parse_backup_time(&entry.name)?;
        Some(Self {
            name: entry.name.clone(),
            path: entry.path.clone(),
            size: entry.size,
            created_at,
            encrypted: is_encrypted_name(&entry.name),
        })
    }
}

/// Format the timestamp portion of a backup name
pub fn format_backup_time(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Build a backup filename for the given creation time
pub fn backup_name_at(at: NaiveDateTime, encrypted: bool) -> String {
    let mut name = format!(
        "{}{}{}",
        BACKUP_PREFIX,
        format_backup_time(at),
        ARCHIVE_EXTENSION
    );
    if encrypted {
        name.push_str(ENCRYPTED_SUFFIX);
    }
    name
}

/// Generate a backup filename stamped with the current local time
pub fn generate_backup_name(encrypted: bool) -> String {
    backup_name_at(Local::now().naive_local(), encrypted)
}

/// Parse backup creation time from filename
///
/// Returns `None` for anything outside the naming grammar; such names are
/// never touched by retention.
pub fn parse_backup_time(name: &str) -> Option<NaiveDateTime> {
    let captures = name_pattern().captures(name)?;
    NaiveDateTime::parse_from_str(&captures[1], TIMESTAMP_FORMAT).ok()
}

/// Whether a listing entry looks like one of ours at all
pub fn is_backup_name(name: &str) -> bool {
    name.contains(BACKUP_PREFIX)
}

/// Whether the name carries the encrypted marker
pub fn is_encrypted_name(name: &str) -> bool {
    name.ends_with(ENCRYPTED_SUFFIX)
}

/// Name of the plaintext archive an encrypted one decrypts to
pub fn plaintext_name(name: &str) -> &str {
    name.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(name)
}

/// Last path segment, tolerating either separator convention
pub fn base_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(path)
}
