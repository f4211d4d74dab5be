//! Remote backup retention
//!
//! Two mutually exclusive policies:
//!
//! - `KeepLast(n)`: keep the `n` newest backups by name
//! - `Gfs`: grandfather-father-son windows measured back from "now"
//!
//! The keep-set is recomputed from a fresh listing on every run. Entries that
//! are directories, foreign files, or backups whose name does not parse are
//! never deleted.

use std::collections::HashSet;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backup::{is_backup_name, BackupInfo};
use crate::error::{Error, Result};
use crate::remote::{remove_with_fallback, RemoteEntry, RemoteStore};

/// Backups kept by the flat-count policy when nothing valid is configured
pub const DEFAULT_MAX_BACKUPS: usize = 10;

/// Upper bound for every GFS tier size
pub const MAX_GFS_WINDOW: u32 = 10_000;

/// Tier sizes of the GFS policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GfsWindows {
    /// Every backup younger than this many days is kept ("son" tier)
    pub daily_days: u32,
    /// 7-day windows after the son tier, newest backup of each kept
    pub weekly: u32,
    /// 30-day windows counted back from now, newest backup of each kept
    pub monthly: u32,
}

impl Default for GfsWindows {
    fn default() -> Self {
        Self {
            daily_days: 7,
            weekly: 4,
            monthly: 12,
        }
    }
}

impl GfsWindows {
    /// Every tier limited to `MAX_GFS_WINDOW`
    pub fn clamped(self) -> Self {
        Self {
            daily_days: self.daily_days.min(MAX_GFS_WINDOW),
            weekly: self.weekly.min(MAX_GFS_WINDOW),
            monthly: self.monthly.min(MAX_GFS_WINDOW),
        }
    }
}

/// Backup retention policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Keep the N newest backups
    KeepLast(usize),
    /// Grandfather-father-son tiers
    Gfs(GfsWindows),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::KeepLast(DEFAULT_MAX_BACKUPS)
    }
}

impl RetentionPolicy {
    /// Create a simple policy keeping last N backups
    pub fn keep_last(n: usize) -> Self {
        Self::KeepLast(n)
    }
}

impl std::fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionPolicy::KeepLast(n) => write!(f, "keep the {} newest", n),
            RetentionPolicy::Gfs(w) => write!(
                f,
                "GFS ({} days daily, {} weekly, {} monthly)",
                w.daily_days, w.weekly, w.monthly
            ),
        }
    }
}

/// Partition of a listing into what survives and what goes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPlan {
    /// Backups in the keep-set, newest first
    pub keep: Vec<BackupInfo>,
    /// Backups outside the keep-set, newest first
    pub delete: Vec<BackupInfo>,
    /// Backup-looking names whose timestamp does not parse
    pub ignored: Vec<String>,
}

/// Result of a prune operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneResult {
    /// Number of backups deleted
    pub deleted_count: usize,
    /// Names of deleted backups
    pub deleted_names: Vec<String>,
    /// Names whose deletion failed
    pub failed_names: Vec<String>,
    /// Number of backups retained (including failed deletions and ignored names)
    pub retained_count: usize,
    /// Total bytes freed, as reported by the listing
    pub bytes_freed: u64,
}

fn newest_first(a: &BackupInfo, b: &BackupInfo) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.name.cmp(&a.name))
}

/// Newest backup whose age falls in `[from, to)`
fn newest_in_window<'a>(
    backups: &'a [BackupInfo],
    now: NaiveDateTime,
    from: Duration,
    to: Duration,
) -> Option<&'a BackupInfo> {
    backups
        .iter()
        .filter(|b| {
            let age = now - b.created_at;
            age >= from && age < to
        })
        .min_by(|a, b| newest_first(a, b))
}

fn gfs_keep_set(backups: &[BackupInfo], windows: &GfsWindows, now: NaiveDateTime) -> HashSet<String> {
    let windows = windows.clamped();
    let mut keep = HashSet::new();
    let son_span = Duration::days(windows.daily_days as i64);
    // Windows starting past the oldest backup cannot select anything
    let Some(oldest) = backups.iter().map(|b| now - b.created_at).max() else {
        return keep;
    };

    // Sons: everything recent, including timestamps from the future
    for backup in backups {
        if now - backup.created_at < son_span {
            keep.insert(backup.name.clone());
        }
    }

    // Fathers: one per week after the son tier
    let week = Duration::days(7);
    for i in 0..windows.weekly as i32 {
        let from = son_span + week * i;
        if from > oldest {
            break;
        }
        if let Some(b) = newest_in_window(backups, now, from, from + week) {
            keep.insert(b.name.clone());
        }
    }

    // Grandfathers: one per 30 days, counted from now
    let month = Duration::days(30);
    for j in 0..windows.monthly as i32 {
        let from = month * j;
        if from > oldest {
            break;
        }
        if let Some(b) = newest_in_window(backups, now, from, from + month) {
            keep.insert(b.name.clone());
        }
    }

    keep
}

/// Decide which backups of a listing survive `policy` at time `now`
pub fn plan_retention(
    entries: &[RemoteEntry],
    policy: &RetentionPolicy,
    now: NaiveDateTime,
) -> RetentionPlan {
    let mut backups = Vec::new();
    let mut ignored = Vec::new();

    for entry in entries {
        if entry.is_directory || !is_backup_name(&entry.name) {
            continue;
        }
        match BackupInfo::from_entry(entry) {
            Some(info) => backups.push(info),
            None => ignored.push(entry.name.clone()),
        }
    }

    let (keep, delete) = match policy {
        RetentionPolicy::KeepLast(n) => {
            let n = if *n == 0 { DEFAULT_MAX_BACKUPS } else { *n };
            // The fixed-width timestamp makes name order chronological
            backups.sort_by(|a, b| b.name.cmp(&a.name));
            let delete = backups.split_off(n.min(backups.len()));
            (backups, delete)
        }
        RetentionPolicy::Gfs(windows) => {
            let keep_names = gfs_keep_set(&backups, windows, now);
            backups.sort_by(newest_first);
            backups
                .into_iter()
                .partition(|b| keep_names.contains(&b.name))
        }
    };

    RetentionPlan {
        keep,
        delete,
        ignored,
    }
}

/// Apply a retention policy to a remote directory
///
/// Listing failures are returned as `Error::Retention`. Individual deletion
/// failures are logged and reported in `failed_names`; they never stop the
/// remaining deletions.
pub async fn apply_retention(
    store: &dyn RemoteStore,
    dir: &str,
    policy: &RetentionPolicy,
    now: NaiveDateTime,
) -> Result<PruneResult> {
    let entries = store
        .list(dir)
        .await
        .map_err(|e| Error::Retention(format!("Failed to list {}: {}", dir, e)))?;

    let plan = plan_retention(&entries, policy, now);
    let total = plan.keep.len() + plan.delete.len() + plan.ignored.len();

    let mut deleted_names = Vec::new();
    let mut failed_names = Vec::new();
    let mut bytes_freed = 0u64;

    for backup in &plan.delete {
        match remove_with_fallback(store, &backup.path).await {
            Ok(()) => {
                info!("Pruned old backup: {}", backup.name);
                bytes_freed += backup.size;
                deleted_names.push(backup.name.clone());
            }
            Err(e) => {
                warn!("Failed to delete backup {}: {}", backup.name, e);
                failed_names.push(backup.name.clone());
            }
        }
    }

    for name in &plan.ignored {
        warn!("Skipping backup with unrecognised name: {}", name);
    }

    Ok(PruneResult {
        deleted_count: deleted_names.len(),
        retained_count: total - deleted_names.len(),
        deleted_names,
        failed_names,
        bytes_freed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::backup_name_at;
    use crate::test_utils::MemoryStore;
    use chrono::NaiveDate;

    fn day(n: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, n)
            .unwrap()
            .and_hms_opt(3, 0, 0)
            .unwrap()
    }

    fn entry(name: &str) -> RemoteEntry {
        RemoteEntry {
            name: name.to_string(),
            path: format!("/vw/{}", name),
            size: 100,
            is_directory: false,
            last_modified: None,
        }
    }

    fn names(backups: &[BackupInfo]) -> Vec<String> {
        backups.iter().map(|b| b.name.clone()).collect()
    }

    #[test]
    fn test_default_retention_policy() {
        assert_eq!(RetentionPolicy::default(), RetentionPolicy::KeepLast(10));
        let windows = GfsWindows::default();
        assert_eq!((windows.daily_days, windows.weekly, windows.monthly), (7, 4, 12));
    }

    #[test]
    fn test_keep_last_three_of_five_days() {
        let entries: Vec<_> = (1..=5)
            .map(|d| entry(&backup_name_at(day(d), false)))
            .collect();
        let plan = plan_retention(&entries, &RetentionPolicy::keep_last(3), day(6));

        assert_eq!(
            names(&plan.keep),
            vec![
                backup_name_at(day(5), false),
                backup_name_at(day(4), false),
                backup_name_at(day(3), false),
            ]
        );
        assert_eq!(
            names(&plan.delete),
            vec![backup_name_at(day(2), false), backup_name_at(day(1), false)]
        );
    }

    #[test]
    fn test_keep_last_deletes_exactly_the_oldest() {
        let n = 10;
        let k = 7;
        let entries: Vec<_> = (1..=(n + k) as u32)
            .map(|d| entry(&backup_name_at(day(d), d % 2 == 0)))
            .collect();
        let plan = plan_retention(&entries, &RetentionPolicy::keep_last(n), day(28));

        assert_eq!(plan.keep.len(), n);
        assert_eq!(plan.delete.len(), k);
        let oldest_kept = plan.keep.iter().map(|b| b.created_at).min().unwrap();
        assert!(plan.delete.iter().all(|b| b.created_at < oldest_kept));
    }

    #[test]
    fn test_keep_last_zero_uses_default() {
        let entries: Vec<_> = (1..=12)
            .map(|d| entry(&backup_name_at(day(d), false)))
            .collect();
        let plan = plan_retention(&entries, &RetentionPolicy::keep_last(0), day(20));
        assert_eq!(plan.keep.len(), DEFAULT_MAX_BACKUPS);
        assert_eq!(plan.delete.len(), 2);
    }

    #[test]
    fn test_unparseable_and_foreign_entries_are_never_deleted() {
        let mut entries: Vec<_> = (1..=5)
            .map(|d| entry(&backup_name_at(day(d), false)))
            .collect();
        entries.push(entry("vw_backup_manual_copy.tar.gz"));
        entries.push(entry("notes.txt"));
        entries.push(RemoteEntry {
            is_directory: true,
            ..entry("vw_backup_20200101_000000")
        });

        for policy in [
            RetentionPolicy::keep_last(1),
            RetentionPolicy::Gfs(GfsWindows::default()),
        ] {
            let plan = plan_retention(&entries, &policy, day(30));
            assert_eq!(plan.ignored, vec!["vw_backup_manual_copy.tar.gz".to_string()]);
            let doomed = names(&plan.delete);
            assert!(!doomed.iter().any(|n| n.contains("manual")));
            assert!(!doomed.contains(&"notes.txt".to_string()));
            assert!(!doomed.contains(&"vw_backup_20200101_000000".to_string()));
        }
    }

    #[test]
    fn test_gfs_over_400_daily_backups() {
        let now = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let entries: Vec<_> = (0..400)
            .map(|age| entry(&backup_name_at(now - Duration::days(age), false)))
            .collect();

        let plan = plan_retention(&entries, &RetentionPolicy::Gfs(GfsWindows::default()), now);
        assert!(plan.keep.len() <= 7 + 4 + 12);

        let mut kept_ages: Vec<i64> = plan
            .keep
            .iter()
            .map(|b| (now - b.created_at).num_days())
            .collect();
        kept_ages.sort();

        // Sons 0..=6, fathers at the start of each week window, grandfathers
        // at the start of each 30-day window (window 0 overlaps the sons)
        let mut expected: Vec<i64> = (0..7).collect();
        expected.extend([7, 14, 21, 28]);
        expected.extend((1..12).map(|j| j * 30));
        expected.sort();
        assert_eq!(kept_ages, expected);
        assert_eq!(plan.keep.len() + plan.delete.len(), 400);
    }

    #[test]
    fn test_gfs_keeps_newest_in_each_window() {
        let now = day(31);
        // Two backups in the first father window (ages 8 and 10 days)
        let entries = vec![
            entry(&backup_name_at(now - Duration::days(10), false)),
            entry(&backup_name_at(now - Duration::days(8), false)),
            entry(&backup_name_at(now - Duration::hours(1), false)),
        ];
        let windows = GfsWindows {
            daily_days: 7,
            weekly: 1,
            monthly: 0,
        };
        let plan = plan_retention(&entries, &RetentionPolicy::Gfs(windows), now);

        assert_eq!(plan.keep.len(), 2);
        assert_eq!(
            names(&plan.delete),
            vec![backup_name_at(now - Duration::days(10), false)]
        );
    }

    #[test]
    fn test_gfs_keeps_future_timestamps() {
        let now = day(10);
        let entries = vec![entry(&backup_name_at(day(12), false))];
        let plan = plan_retention(&entries, &RetentionPolicy::Gfs(GfsWindows::default()), now);
        assert_eq!(plan.keep.len(), 1);
    }

    #[test]
    fn test_gfs_huge_windows_are_bounded() {
        let now = day(60);
        let entries: Vec<_> = (1..=50)
            .map(|d| entry(&backup_name_at(day(d), false)))
            .collect();
        let windows = GfsWindows {
            daily_days: 0,
            weekly: u32::MAX,
            monthly: u32::MAX,
        };
        let plan = plan_retention(&entries, &RetentionPolicy::Gfs(windows), now);

        // One per week and per month, never more than the listing holds
        assert!(!plan.keep.is_empty());
        assert_eq!(plan.keep.len() + plan.delete.len(), 50);
        assert_eq!(windows.clamped().weekly, MAX_GFS_WINDOW);
    }

    #[tokio::test]
    async fn test_apply_retention_deletes_and_reports() {
        let store = MemoryStore::new();
        for d in 1..=5 {
            store.insert(&format!("/vw/{}", backup_name_at(day(d), false)), b"data");
        }

        let result = apply_retention(&store, "/vw", &RetentionPolicy::keep_last(3), day(6))
            .await
            .unwrap();

        assert_eq!(result.deleted_count, 2);
        assert_eq!(result.retained_count, 3);
        assert_eq!(result.bytes_freed, 8);
        assert!(result.failed_names.is_empty());

        let remaining = store.paths();
        assert_eq!(remaining.len(), 3);
        for d in 3..=5 {
            assert!(remaining.contains(&format!("/vw/{}", backup_name_at(day(d), false))));
        }
    }

    #[tokio::test]
    async fn test_apply_retention_is_idempotent() {
        let now = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let store = MemoryStore::new();
        for age in 0..120 {
            let name = backup_name_at(now - Duration::days(age), true);
            store.insert(&format!("/vw/{}", name), b"x");
        }

        for policy in [
            RetentionPolicy::Gfs(GfsWindows::default()),
            RetentionPolicy::keep_last(5),
        ] {
            apply_retention(&store, "/vw", &policy, now).await.unwrap();
            let second = apply_retention(&store, "/vw", &policy, now).await.unwrap();
            assert_eq!(second.deleted_count, 0);
        }
    }

    #[tokio::test]
    async fn test_deletion_failure_does_not_block_others() {
        let store = MemoryStore::new();
        for d in 1..=5 {
            store.insert(&format!("/vw/{}", backup_name_at(day(d), false)), b"data");
        }
        let stuck = backup_name_at(day(1), false);
        store.fail_remove(&stuck);

        let result = apply_retention(&store, "/vw", &RetentionPolicy::keep_last(2), day(6))
            .await
            .unwrap();

        assert_eq!(result.failed_names, vec![stuck]);
        assert_eq!(result.deleted_count, 2);
        assert_eq!(result.retained_count, 3);
        assert_eq!(store.paths().len(), 3);
    }

    #[tokio::test]
    async fn test_listing_failure_is_retention_error() {
        let store = MemoryStore::new();
        store.fail_list(true);
        let err = apply_retention(&store, "/vw", &RetentionPolicy::default(), day(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Retention(_)));
    }
}
