mod defaults;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::GatewayError;
use defaults::*;

/// Top-level wagate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// General process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Persistence config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Session lifecycle and reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Backoff step: the n-th consecutive reconnect waits `n * step`.
    #[serde(default = "default_reconnect_step_ms")]
    pub reconnect_step_ms: u64,
    /// Ceiling for a single reconnect delay.
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    /// Give up after this many consecutive failed cycles. Unset = retry forever.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    /// Close codes that mean the credentials are permanently rejected.
    #[serde(default = "default_fatal_close_codes")]
    pub fatal_close_codes: Vec<u16>,
    /// Window during which presence updates for one contact are coalesced.
    #[serde(default = "default_presence_debounce_ms")]
    pub presence_debounce_ms: u64,
    /// Device name shown in the phone's linked devices list.
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_step_ms: default_reconnect_step_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            max_reconnect_attempts: None,
            fatal_close_codes: default_fatal_close_codes(),
            presence_debounce_ms: default_presence_debounce_ms(),
            device_name: default_device_name(),
        }
    }
}

impl SessionConfig {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> std::time::Duration {
        let ms = (attempt as u64)
            .saturating_mul(self.reconnect_step_ms)
            .min(self.reconnect_cap_ms);
        std::time::Duration::from_millis(ms)
    }
}

/// Ingestion queue config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// History backfill limits and pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Messages older than this many days are skipped.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Most-recent messages kept per conversation per backfill.
    #[serde(default = "default_per_chat_limit")]
    pub per_chat_limit: usize,
    #[serde(default = "default_contact_batch_size")]
    pub contact_batch_size: usize,
    #[serde(default = "default_contact_batch_pause_ms")]
    pub contact_batch_pause_ms: u64,
    #[serde(default = "default_chat_pause_ms")]
    pub chat_pause_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            per_chat_limit: default_per_chat_limit(),
            contact_batch_size: default_contact_batch_size(),
            contact_batch_pause_ms: default_contact_batch_pause_ms(),
            chat_pause_ms: default_chat_pause_ms(),
        }
    }
}

/// Outbound humanization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_typing_ms_per_char")]
    pub typing_ms_per_char: u64,
    #[serde(default = "default_typing_cap_ms")]
    pub typing_cap_ms: u64,
    /// Refuse to send when the existence check says the number has no account.
    #[serde(default)]
    pub strict_recipient_check: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            typing_ms_per_char: default_typing_ms_per_char(),
            typing_cap_ms: default_typing_cap_ms(),
            strict_recipient_check: false,
        }
    }
}

/// Media storage and transcription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_media_dir")]
    pub dir: String,
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
    /// OpenAI API key for Whisper transcription. Presence = audio gets transcribed.
    #[serde(default)]
    pub whisper_api_key: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_media_dir(),
            public_base_url: default_public_base_url(),
            download_timeout_secs: default_download_timeout(),
            whisper_api_key: None,
        }
    }
}

/// Tenant webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_webhook_timeout(),
        }
    }
}

/// Reminder sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_lookahead_hours")]
    pub lookahead_hours: i64,
    /// Placeholders: `{name}`, `{title}`, `{date}`, `{time}`.
    #[serde(default = "default_reminder_template")]
    pub template: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval(),
            lookahead_hours: default_lookahead_hours(),
            template: default_reminder_template(),
        }
    }
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist.
pub fn load(path: &str) -> Result<Config, GatewayError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| GatewayError::Config(format!("failed to parse config: {}", e)))?;

    if config.queue.workers == 0 {
        return Err(GatewayError::Config("queue.workers must be at least 1".into()));
    }
    if config.sender.min_delay_ms > config.sender.max_delay_ms {
        return Err(GatewayError::Config(
            "sender.min_delay_ms must not exceed sender.max_delay_ms".into(),
        ));
    }

    Ok(config)
}
