//! Daemon and schedule commands

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use tracing::{info, warn};
use vaultkeep_core::{BackupService, ScheduleSpec, Scheduler, Trigger, JOB_KEY};

/// Run scheduled backups until interrupted
///
/// The configuration is re-read every `poll_secs` seconds and the job is
/// replaced when its schedule changes. On shutdown a backup in progress is
/// allowed to finish so the data service is brought back up.
pub async fn cmd_daemon(service: Arc<BackupService>, poll_secs: u64) -> Result<()> {
    let settings = service.settings();
    println!("🚀 Starting vaultkeep daemon...");
    println!("   Data: {}", settings.data_dir.display());
    println!("   Config: {}", settings.config_path().display());
    println!("   Log: {}", settings.log_path().display());

    let scheduler = Scheduler::new(service.clone());
    let mut spec = current_schedule(&service);
    scheduler.update_schedule(&spec);

    let mut poll = tokio::time::interval(Duration::from_secs(poll_secs.max(1)));
    poll.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutting down");
                break;
            }
            _ = poll.tick() => {
                match service.load_config() {
                    Ok(config) => {
                        let next = config.schedule();
                        if next != spec {
                            let trigger = scheduler.update_schedule(&next);
                            info!("Schedule changed, job {} now runs {}", JOB_KEY, trigger);
                            spec = next;
                        }
                    }
                    Err(e) => warn!("Failed to read configuration: {}", e),
                }
            }
        }
    }

    scheduler.shutdown().await;
    Ok(())
}

/// Show the schedule the daemon would use with the current configuration
pub fn cmd_schedule(service: &BackupService) -> Result<()> {
    let config = service.load_config()?;
    let spec = config.schedule();
    let trigger = Trigger::from_spec(&spec);

    println!("Job: {}", JOB_KEY);
    println!("Trigger: {}", trigger);
    if let ScheduleSpec::Cron(expression) = &spec {
        if trigger.is_default() {
            println!("   ⚠️  '{}' is not a valid cron expression, using the default", expression);
        }
    }
    match trigger.next_after(Local::now()) {
        Some(next) => println!("Next run: {}", next.format("%Y-%m-%d %H:%M:%S")),
        None => println!("Next run: never"),
    }
    if config.remote().is_none() {
        println!("   ⚠️  No remote endpoint configured; scheduled runs will be skipped");
    }

    Ok(())
}

fn current_schedule(service: &BackupService) -> ScheduleSpec {
    match service.load_config() {
        Ok(config) => config.schedule(),
        Err(e) => {
            warn!("Failed to read configuration, using the default schedule: {}", e);
            ScheduleSpec::default()
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
