//! Configuration commands

use anyhow::{Context, Result};
use vaultkeep_core::BackupService;

/// Print the configuration with secrets masked
pub fn cmd_config_show(service: &BackupService) -> Result<()> {
    let config = service
        .load_config()
        .context("Failed to load configuration")?;

    println!("# {}", service.settings().config_path().display());
    println!("{}", serde_json::to_string_pretty(&config.redacted())?);
    Ok(())
}

/// Set one configuration key and save
pub fn cmd_config_set(service: &BackupService, key: &str, value: &str) -> Result<()> {
    let mut config = service
        .load_config()
        .context("Failed to load configuration")?;
    config.set_key(key, value)?;
    service
        .save_config(&config)
        .context("Failed to save configuration")?;

    println!("✅ Set {}", key);
    Ok(())
}
