//! Backup and restore commands

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use vaultkeep_core::{BackupOutcome, BackupService, RestoreOutcome, RestoreSource};

use super::format_size;

/// Run one backup now
pub async fn cmd_backup(service: &BackupService) -> Result<()> {
    println!("Backing up {}...", service.settings().data_dir.display());

    match service.run_backup_now().await {
        BackupOutcome::Completed(report) => {
            println!("✅ Backup uploaded: {}", report.name);
            println!("   Location: {}", report.remote_path);
            println!("   Size: {}", format_size(report.size));
            println!(
                "   Entries: {} ({} skipped)",
                report.archive.entries(),
                report.archive.skipped
            );
            println!("   SHA-256: {}", report.digest);
            match &report.prune {
                Some(prune) if prune.deleted_count > 0 => {
                    println!(
                        "   Pruned: {} old backup(s), {} freed",
                        prune.deleted_count,
                        format_size(prune.bytes_freed)
                    );
                }
                Some(_) => {}
                None => println!("   ⚠️  Retention pass failed, see log"),
            }
            Ok(())
        }
        BackupOutcome::Skipped(reason) => {
            println!("Backup skipped: {}", reason);
            println!("   Set one with: vaultkeep config set webdav_url <url>");
            Ok(())
        }
        BackupOutcome::Failed(e) => {
            if e.is_critical() {
                eprintln!("🚨 The service could not be started again");
            }
            Err(anyhow::Error::new(e).context("Backup failed"))
        }
    }
}

/// Restore the data directory from a remote backup or a local archive
pub async fn cmd_restore(
    service: &BackupService,
    name: Option<&str>,
    file: Option<&Path>,
    yes: bool,
) -> Result<()> {
    let data_dir = &service.settings().data_dir;

    let source = match (name, file) {
        (_, Some(file)) => {
            if !file.is_file() {
                bail!("Archive not found: {}", file.display());
            }
            RestoreSource::Local(file.to_path_buf())
        }
        (Some(name), None) => RestoreSource::Remote(name.to_string()),
        (None, None) => bail!("Give a backup name or --file"),
    };

    if !yes {
        println!(
            "⚠️  This will replace everything in {}",
            data_dir.display()
        );
        print!("Continue? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled");
            return Ok(());
        }
    }

    restore_from(service, source).await
}

/// Run the restore without prompting
pub async fn restore_from(service: &BackupService, source: RestoreSource) -> Result<()> {
    // The pipeline consumes a local archive, so hand it a copy
    let source = match source {
        RestoreSource::Local(file) => {
            RestoreSource::Local(stage_local_archive(&file, &service.settings().scratch_dir)?)
        }
        remote => remote,
    };

    match service.run_restore(source).await {
        RestoreOutcome::Completed { name, entries } => {
            println!("✅ Restored from: {}", name);
            println!("   Location: {}", service.settings().data_dir.display());
            println!("   Entries: {}", entries);
            Ok(())
        }
        RestoreOutcome::Failed(e) => {
            if e.is_critical() {
                eprintln!("🚨 The service is down and needs attention");
            }
            Err(anyhow::Error::new(e).context("Restore failed"))
        }
    }
}

/// Copy a local archive into the scratch directory, keeping its file name
fn stage_local_archive(file: &Path, scratch_dir: &Path) -> Result<PathBuf> {
    let file_name = file
        .file_name()
        .with_context(|| format!("Not a file: {}", file.display()))?;

    fs::create_dir_all(scratch_dir).with_context(|| {
        format!(
            "Failed to create scratch directory: {}",
            scratch_dir.display()
        )
    })?;
    let staged = scratch_dir.join(file_name);

    if staged.exists() && fs::canonicalize(&staged)? == fs::canonicalize(file)? {
        bail!(
            "{} is inside the scratch directory and would be removed; move it elsewhere first",
            file.display()
        );
    }

    fs::copy(file, &staged)
        .with_context(|| format!("Failed to copy {} to {}", file.display(), staged.display()))?;
    Ok(staged)
}
