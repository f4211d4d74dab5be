//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `backup` - Backup and restore runs
//! - `config` - Configuration show/set
//! - `daemon` - Scheduler loop and schedule display
//! - `logs` - Log file tail
//! - `remote` - Remote listing and pruning

pub mod backup;
pub mod config;
pub mod daemon;
pub mod logs;
pub mod remote;

// Re-export command functions for main.rs
pub use backup::*;
pub use config::*;
pub use daemon::*;
pub use logs::*;
pub use remote::*;

/// Format a byte size as human-readable
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
