//! Backup configuration and runtime settings
//!
//! The backup configuration is a flat JSON object persisted by a `ConfigStore`.
//! It is loaded fresh at the start of every operation; nothing caches it, so an
//! edit takes effect on the next run.
//!
//! Runtime settings (where the data, config and scratch directories live, which
//! supervisor program to control) come from the environment:
//!
//! - `VAULTKEEP_DATA_DIR`: managed service data directory (default `/data`)
//! - `VAULTKEEP_CONF_DIR`: config and log directory (default `/conf`)
//! - `VAULTKEEP_SCRATCH_DIR`: scratch area (default `/tmp/backup_work`)
//! - `VAULTKEEP_SERVICE`: supervisor program name (default `vaultwarden`)
//! - `VAULTKEEP_SUPERVISORCTL`: supervisor control binary (default `supervisorctl`)

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Deserializer, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::{Error, Result};
use crate::retention::{GfsWindows, RetentionPolicy, DEFAULT_MAX_BACKUPS, MAX_GFS_WINDOW};
use crate::scheduler::ScheduleSpec;

pub const DATA_DIR_ENV: &str = "VAULTKEEP_DATA_DIR";
pub const CONF_DIR_ENV: &str = "VAULTKEEP_CONF_DIR";
pub const SCRATCH_DIR_ENV: &str = "VAULTKEEP_SCRATCH_DIR";
pub const SERVICE_ENV: &str = "VAULTKEEP_SERVICE";
pub const SUPERVISORCTL_ENV: &str = "VAULTKEEP_SUPERVISORCTL";

/// File name of the configuration inside the config directory
pub const CONFIG_FILE_NAME: &str = "backup_config.json";

/// File name of the append-only log inside the config directory
pub const LOG_FILE_NAME: &str = "manager.log";

/// File name of the run lock shared by all processes using the config directory
pub const LOCK_FILE_NAME: &str = "vaultkeep.lock";

/// Which retention policy prunes the remote directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionMode {
    /// Keep the newest `max_backups`
    #[default]
    Count,
    /// Grandfather-father-son windows
    Gfs,
}

/// Backup configuration as persisted by the config store
///
/// Every key is optional. Numeric keys accept JSON numbers or numeric strings,
/// since hand-edited files and web forms produce both. Unknown keys are kept
/// and written back on save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webdav_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webdav_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webdav_password: Option<String>,
    /// Remote directory backups are stored in (default `/`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webdav_path: Option<String>,

    /// Archive passphrase; absent or empty means plaintext archives
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_password: Option<String>,

    pub retention_mode: RetentionMode,
    #[serde(
        deserialize_with = "lenient_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_backups: Option<i64>,
    #[serde(
        deserialize_with = "lenient_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub gfs_daily_days: Option<i64>,
    #[serde(
        deserialize_with = "lenient_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub gfs_weekly: Option<i64>,
    #[serde(
        deserialize_with = "lenient_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub gfs_monthly: Option<i64>,

    /// Cron expression; takes precedence over hour/minute
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_cron: Option<String>,
    #[serde(
        deserialize_with = "lenient_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub schedule_hour: Option<i64>,
    #[serde(
        deserialize_with = "lenient_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub schedule_minute: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tg_bot_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tg_chat_id: Option<String>,
    pub notify_on_success: bool,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Remote endpoint section of the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub directory: String,
}

/// Telegram credentials section of the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

fn lenient_int<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::Value;

    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl BackupConfig {
    /// Remote section, or `None` when no endpoint is configured
    pub fn remote(&self) -> Option<RemoteConfig> {
        let url = non_empty(&self.webdav_url)?;
        Some(RemoteConfig {
            url: url.to_string(),
            user: self.webdav_user.clone().unwrap_or_default(),
            password: self.webdav_password.clone().unwrap_or_default(),
            directory: self.remote_dir(),
        })
    }

    /// Remote backup directory, `/` when unset
    pub fn remote_dir(&self) -> String {
        non_empty(&self.webdav_path).unwrap_or("/").to_string()
    }

    /// Archive passphrase, if encryption is enabled
    pub fn passphrase(&self) -> Option<&str> {
        self.encryption_password
            .as_deref()
            .filter(|s| !s.is_empty())
    }

    /// Retention policy selected by `retention_mode`
    pub fn retention_policy(&self) -> RetentionPolicy {
        match self.retention_mode {
            RetentionMode::Count => {
                let max = self
                    .max_backups
                    .filter(|&n| n > 0)
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_MAX_BACKUPS);
                RetentionPolicy::keep_last(max)
            }
            RetentionMode::Gfs => {
                let defaults = GfsWindows::default();
                let pick = |value: Option<i64>, default: u32| {
                    value
                        .filter(|&n| n >= 0)
                        .map(|n| n.min(i64::from(MAX_GFS_WINDOW)) as u32)
                        .unwrap_or(default)
                };
                RetentionPolicy::Gfs(GfsWindows {
                    daily_days: pick(self.gfs_daily_days, defaults.daily_days),
                    weekly: pick(self.gfs_weekly, defaults.weekly),
                    monthly: pick(self.gfs_monthly, defaults.monthly),
                })
            }
        }
    }

    /// Schedule section: cron first, then hour/minute, then the 03:00 default
    pub fn schedule(&self) -> ScheduleSpec {
        if let Some(expr) = non_empty(&self.schedule_cron) {
            return ScheduleSpec::Cron(expr.to_string());
        }
        match (self.schedule_hour, self.schedule_minute) {
            (None, None) => ScheduleSpec::default(),
            (hour, minute) => {
                let hour = hour.unwrap_or(3);
                let minute = minute.unwrap_or(0);
                if (0..24).contains(&hour) && (0..60).contains(&minute) {
                    ScheduleSpec::Daily {
                        hour: hour as u32,
                        minute: minute as u32,
                    }
                } else {
                    ScheduleSpec::default()
                }
            }
        }
    }

    /// Telegram section, or `None` when token or chat id is missing
    pub fn telegram(&self) -> Option<TelegramConfig> {
        Some(TelegramConfig {
            bot_token: non_empty(&self.tg_bot_token)?.to_string(),
            chat_id: non_empty(&self.tg_chat_id)?.to_string(),
        })
    }

    /// Copy with secrets replaced, for display
    pub fn redacted(&self) -> Self {
        let mask = |value: &Option<String>| {
            non_empty(value).map(|_| "********".to_string())
        };
        Self {
            webdav_password: mask(&self.webdav_password),
            encryption_password: mask(&self.encryption_password),
            tg_bot_token: mask(&self.tg_bot_token),
            ..self.clone()
        }
    }

    /// Set one key from its string form, as typed on a command line
    ///
    /// The value is parsed as JSON when possible (numbers, booleans, `null`)
    /// and kept as a string otherwise.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        use serde_json::Value;

        let object = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => return Err(Error::Config("Configuration is not an object".into())),
        };

        let with_value = |new_value: Option<Value>| {
            let mut object = object.clone();
            match new_value {
                Some(v) => object.insert(key.to_string(), v),
                None => object.remove(key),
            };
            serde_json::from_value::<BackupConfig>(Value::Object(object))
        };

        let updated = match serde_json::from_str::<Value>(value) {
            Ok(Value::Null) => with_value(None),
            // Chat ids and similar look numeric but belong in string fields
            Ok(parsed) => with_value(Some(parsed))
                .or_else(|_| with_value(Some(Value::String(value.to_string())))),
            Err(_) => with_value(Some(Value::String(value.to_string()))),
        };

        *self = updated
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", key, e)))?;
        Ok(())
    }
}

/// Trait for configuration persistence
pub trait ConfigStore: Send + Sync {
    /// Load the current configuration
    fn load(&self) -> Result<BackupConfig>;

    /// Persist a configuration
    fn save(&self, config: &BackupConfig) -> Result<()>;
}

/// JSON file configuration store
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<BackupConfig> {
        if !self.path.exists() {
            return Ok(BackupConfig::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(BackupConfig::default());
        }
        serde_json::from_str(&raw).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", self.path.display(), e))
        })
    }

    fn save(&self, config: &BackupConfig) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        // Write then rename so a crash never leaves a truncated config
        let mut temp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut temp, config)?;
        temp.write_all(b"\n")?;
        temp.persist(&self.path)
            .map_err(|e| Error::Config(format!("Failed to save config: {}", e)))?;

        info!("Saved configuration to {}", self.path.display());
        Ok(())
    }
}

/// In-memory configuration store
#[derive(Default)]
pub struct MemoryConfigStore {
    config: Mutex<BackupConfig>,
}

impl MemoryConfigStore {
    pub fn new(config: BackupConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<BackupConfig> {
        self.config
            .lock()
            .map(|c| c.clone())
            .map_err(|_| Error::Config("Config lock poisoned".into()))
    }

    fn save(&self, config: &BackupConfig) -> Result<()> {
        let mut guard = self
            .config
            .lock()
            .map_err(|_| Error::Config("Config lock poisoned".into()))?;
        *guard = config.clone();
        Ok(())
    }
}

/// Process-level settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Managed service data directory
    pub data_dir: PathBuf,
    /// Holds the config file and the log file
    pub conf_dir: PathBuf,
    /// Scratch area for one run's temporary files
    pub scratch_dir: PathBuf,
    /// Supervisor program name of the managed service
    pub service_name: String,
    /// Supervisor control binary
    pub supervisorctl: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            conf_dir: PathBuf::from("/conf"),
            scratch_dir: PathBuf::from("/tmp/backup_work"),
            service_name: "vaultwarden".to_string(),
            supervisorctl: "supervisorctl".to_string(),
        }
    }
}

impl Settings {
    /// Read settings from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|s| !s.trim().is_empty());

        Self {
            data_dir: var(DATA_DIR_ENV).map(PathBuf::from).unwrap_or(defaults.data_dir),
            conf_dir: var(CONF_DIR_ENV).map(PathBuf::from).unwrap_or(defaults.conf_dir),
            scratch_dir: var(SCRATCH_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            service_name: var(SERVICE_ENV).unwrap_or(defaults.service_name),
            supervisorctl: var(SUPERVISORCTL_ENV).unwrap_or(defaults.supervisorctl),
        }
    }

    /// Path of the JSON configuration file
    pub fn config_path(&self) -> PathBuf {
        self.conf_dir.join(CONFIG_FILE_NAME)
    }

    /// Path of the append-only log file
    pub fn log_path(&self) -> PathBuf {
        self.conf_dir.join(LOG_FILE_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.conf_dir.join(LOCK_FILE_NAME)
    }
}
