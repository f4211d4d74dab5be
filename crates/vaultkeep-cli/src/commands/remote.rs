//! Remote directory commands (list, prune)

use anyhow::{Context, Result};
use vaultkeep_core::BackupService;

use super::format_size;

/// List backups in the remote directory, newest first
pub async fn cmd_list(service: &BackupService, json: bool) -> Result<()> {
    let backups = service
        .list_backups()
        .await
        .context("Failed to list remote backups")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&backups)?);
        return Ok(());
    }

    if backups.is_empty() {
        println!("No backups found");
        return Ok(());
    }

    println!("{:<42} {:>10}  Last modified", "Name", "Size");
    println!("{}", "-".repeat(84));

    let mut total_size = 0u64;
    for backup in &backups {
        println!(
            "{:<42} {:>10}  {}",
            backup.name,
            format_size(backup.size),
            backup.last_modified.as_deref().unwrap_or("-")
        );
        total_size += backup.size;
    }

    println!();
    println!(
        "Total: {} backup(s), {}",
        backups.len(),
        format_size(total_size)
    );

    Ok(())
}

/// Apply the configured retention policy, or show what it would do
pub async fn cmd_prune(service: &BackupService, dry_run: bool) -> Result<()> {
    let policy = service.load_config()?.retention_policy();
    println!("Retention policy: {}", policy);

    if dry_run {
        let plan = service
            .plan_prune()
            .await
            .context("Failed to plan retention")?;

        if plan.delete.is_empty() {
            println!("Nothing to prune. Keeping {} backup(s).", plan.keep.len());
        } else {
            println!(
                "Would delete {} backup(s), keeping {}:",
                plan.delete.len(),
                plan.keep.len()
            );
            for backup in &plan.delete {
                println!("  - {} ({})", backup.name, format_size(backup.size));
            }
        }
        if !plan.ignored.is_empty() {
            println!("Ignored {} unrecognized file(s)", plan.ignored.len());
        }
        return Ok(());
    }

    let result = service.prune_now().await.context("Failed to prune backups")?;

    println!("✅ Pruned {} backup(s)", result.deleted_count);
    println!("   Freed: {}", format_size(result.bytes_freed));
    println!("   Remaining: {} backup(s)", result.retained_count);

    if !result.deleted_names.is_empty() {
        println!();
        println!("Deleted:");
        for name in &result.deleted_names {
            println!("  - {}", name);
        }
    }
    if !result.failed_names.is_empty() {
        println!();
        println!("⚠️  Could not delete:");
        for name in &result.failed_names {
            println!("  - {}", name);
        }
    }

    Ok(())
}
