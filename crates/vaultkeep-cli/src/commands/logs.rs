//! Log file command

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use vaultkeep_core::Settings;

/// Print the last `lines` lines of the log file
pub fn cmd_logs(settings: &Settings, lines: usize) -> Result<()> {
    let path = settings.log_path();
    if !path.exists() {
        println!("No log file at {}", path.display());
        return Ok(());
    }

    for line in tail_lines(&path, lines)? {
        println!("{}", line);
    }
    Ok(())
}

/// Last `count` lines of a text file
pub fn tail_lines(path: &Path, count: usize) -> Result<Vec<String>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mut tail = std::collections::VecDeque::with_capacity(count);
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if tail.len() == count {
            tail.pop_front();
        }
        if count > 0 {
            tail.push_back(line);
        }
    }
    Ok(tail.into())
}
