//! Operator notifications
//!
//! Notifications are best-effort: they never block a pipeline and a delivery
//! failure is logged at debug level and otherwise ignored.

use std::time::Duration;

use chrono::Local;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::{BackupConfig, TelegramConfig};
use crate::error::Result;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Delivery timeout for one notification
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Sink for operator notifications
///
/// `notify` must return immediately; delivery happens in the background.
pub trait Notifier: Send + Sync {
    fn notify(&self, config: &BackupConfig, message: &str, success: bool);
}

/// Render the notification text
pub fn format_message(message: &str, success: bool) -> String {
    let (emoji, title) = if success {
        ("✅", "Vaultwarden backup succeeded")
    } else {
        ("❌", "Vaultwarden backup/restore failed")
    };
    format!(
        "{} *{}*\n\n{}\n\n🕒 Time: {}",
        emoji,
        title,
        message,
        Local::now().format("%Y-%m-%d %H:%M:%S")
    )
}

/// Telegram Bot API notifier
#[derive(Clone)]
pub struct TelegramNotifier {
    http_client: Client,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new() -> Result<Self> {
        let http_client = Client::builder().timeout(NOTIFY_TIMEOUT).build()?;
        Ok(Self {
            http_client,
            api_base: TELEGRAM_API.to_string(),
        })
    }

    /// Point at a different Bot API host (tests, self-hosted bot API)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Deliver one message and wait for the result
    pub async fn send(&self, telegram: &TelegramConfig, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, telegram.bot_token);
        let response = self
            .http_client
            .post(&url)
            .json(&json!({
                "chat_id": telegram.chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await?;

        response.error_for_status()?;
        Ok(())
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, config: &BackupConfig, message: &str, success: bool) {
        let Some(telegram) = config.telegram() else {
            return;
        };
        let text = format_message(message, success);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; dropping notification");
            return;
        };
        let notifier = self.clone();
        runtime.spawn(async move {
            if let Err(e) = notifier.send(&telegram, &text).await {
                debug!("Notification failed (ignored): {}", e);
            }
        });
    }
}
