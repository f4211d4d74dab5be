//! Service lifecycle control
//!
//! The managed service runs under a process supervisor. Pipelines only see the
//! `ServiceController` trait, so tests can record calls and inject failures.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::{Error, Result};

/// Stop/start/restart of the managed service
///
/// Every verb must be safe to repeat: stopping a stopped service or starting a
/// running one is success.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn stop(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn restart(&self) -> Result<()>;
}

/// Controls a supervisord program through `supervisorctl`
#[derive(Debug, Clone)]
pub struct SupervisorController {
    supervisorctl: String,
    program: String,
}

impl SupervisorController {
    pub fn new(supervisorctl: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            supervisorctl: supervisorctl.into(),
            program: program.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.supervisorctl.clone(), settings.service_name.clone())
    }

    async fn run(&self, verb: &str) -> Result<()> {
        info!("{} service {}...", verb, self.program);

        let output = Command::new(&self.supervisorctl)
            .arg(verb)
            .arg(&self.program)
            .output()
            .await
            .map_err(|e| {
                Error::ServiceControl(format!(
                    "Failed to run {} {} {}: {}",
                    self.supervisorctl, verb, self.program, e
                ))
            })?;

        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let text = text.trim();
        debug!("supervisorctl {} {}: {}", verb, self.program, text);

        if output.status.success() || already_in_state(verb, text) {
            Ok(())
        } else {
            Err(Error::ServiceControl(format!(
                "{} {} failed ({}): {}",
                verb, self.program, output.status, text
            )))
        }
    }
}

/// Whether supervisorctl refused only because the program is already there
fn already_in_state(verb: &str, output: &str) -> bool {
    let output = output.to_ascii_lowercase();
    match verb {
        "stop" => output.contains("not running"),
        "start" => output.contains("already started"),
        _ => false,
    }
}

#[async_trait]
impl ServiceController for SupervisorController {
    async fn stop(&self) -> Result<()> {
        self.run("stop").await
    }

    async fn start(&self) -> Result<()> {
        self.run("start").await
    }

    async fn restart(&self) -> Result<()> {
        self.run("restart").await
    }
}
