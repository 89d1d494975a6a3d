//! Herald configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{HeraldError, Result};
use crate::types::ChannelType;

const REDACTED: &str = "***";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeraldConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub notifiers: NotifiersConfig,
}

impl HeraldConfig {
    /// Load config from the default path (~/.herald/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HeraldError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| HeraldError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| HeraldError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Herald home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".herald")
    }

    /// Reject configurations the dispatcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.buffer_size == 0 {
            return Err(HeraldError::Config("queue.buffer_size must be > 0".into()));
        }
        if self.queue.worker_count == 0 {
            return Err(HeraldError::Config("queue.worker_count must be > 0".into()));
        }
        for (name, ntfy) in &self.notifiers.ntfy {
            ntfy.validate()
                .map_err(|e| HeraldError::Config(format!("ntfy account '{name}': {e}")))?;
        }
        for channel_type in [ChannelType::Email, ChannelType::Chat, ChannelType::Push] {
            let defaults = self.notifiers.default_accounts(channel_type);
            if defaults.len() > 1 {
                return Err(HeraldError::Config(format!(
                    "more than one default {channel_type} account: {}",
                    defaults.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Copy with every secret replaced, safe to log.
    pub fn sanitized(&self) -> Self {
        let mut copy = self.clone();
        for smtp in copy.notifiers.email.values_mut() {
            redact(&mut smtp.password);
        }
        for slack in copy.notifiers.slack.values_mut() {
            redact(&mut slack.webhook_url);
        }
        for ntfy in copy.notifiers.ntfy.values_mut() {
            redact(&mut ntfy.password);
            redact(&mut ntfy.token);
        }
        copy
    }
}

fn redact(secret: &mut String) {
    if !secret.is_empty() {
        *secret = REDACTED.to_string();
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String { "info".into() }
fn default_log_format() -> String { "text".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Dispatch queue and worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Bounded wait for one dequeue before the worker polls again.
    #[serde(default = "default_dequeue_timeout")]
    pub dequeue_timeout_secs: u64,
    /// Upper bound on a single adapter call.
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,
    #[serde(default)]
    pub persist_to_disk: bool,
    #[serde(default = "default_persist_path")]
    pub persist_path: String,
    /// Applied to notifications that arrive with `max_retries == 0`.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_buffer_size() -> usize { 1000 }
fn default_worker_count() -> usize { 5 }
fn default_dequeue_timeout() -> u64 { 5 }
fn default_delivery_timeout() -> u64 { 30 }
fn default_persist_path() -> String { "~/.herald/queue.json".into() }
fn default_max_retries() -> u32 { crate::types::DEFAULT_MAX_RETRIES }

impl QueueConfig {
    /// Snapshot file, with a leading `~` resolved. `None` when persistence is off.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        if !self.persist_to_disk {
            return None;
        }
        Some(PathBuf::from(shellexpand::tilde(&self.persist_path).to_string()))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            worker_count: default_worker_count(),
            dequeue_timeout_secs: default_dequeue_timeout(),
            delivery_timeout_secs: default_delivery_timeout(),
            persist_to_disk: false,
            persist_path: default_persist_path(),
            default_max_retries: default_max_retries(),
            retry: RetryConfig::default(),
        }
    }
}

/// Delay applied before a failed attempt is re-enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// `fixed`, `linear` or `exponential`.
    #[serde(default = "default_backoff")]
    pub backoff: String,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_backoff() -> String { "exponential".into() }
fn default_base_delay() -> u64 { 1000 }
fn default_max_delay() -> u64 { 60_000 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: default_backoff(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

/// Which adapters to register. Map keys are account names.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifiersConfig {
    /// Register the stdout (debug) adapter.
    #[serde(default)]
    pub stdout: bool,
    #[serde(default)]
    pub email: BTreeMap<String, SmtpAccountConfig>,
    #[serde(default)]
    pub slack: BTreeMap<String, SlackAccountConfig>,
    #[serde(default)]
    pub ntfy: BTreeMap<String, NtfyAccountConfig>,
}

impl NotifiersConfig {
    /// Accounts flagged `default = true` for a channel type.
    pub fn default_accounts(&self, channel_type: ChannelType) -> Vec<String> {
        fn flagged<T>(accounts: &BTreeMap<String, T>, is_default: impl Fn(&T) -> bool) -> Vec<String> {
            accounts
                .iter()
                .filter(|(_, cfg)| is_default(cfg))
                .map(|(name, _)| name.clone())
                .collect()
        }
        match channel_type {
            ChannelType::Email => flagged(&self.email, |c| c.default),
            ChannelType::Chat => flagged(&self.slack, |c| c.default),
            ChannelType::Push => flagged(&self.ntfy, |c| c.default),
            ChannelType::Debug => Vec::new(),
        }
    }

    /// The account unqualified requests resolve to. A lone account is implicitly the default.
    pub fn default_account(&self, channel_type: ChannelType) -> Option<String> {
        if let Some(name) = self.default_accounts(channel_type).into_iter().next() {
            return Some(name);
        }
        let names: Vec<&String> = match channel_type {
            ChannelType::Email => self.email.keys().collect(),
            ChannelType::Chat => self.slack.keys().collect(),
            ChannelType::Push => self.ntfy.keys().collect(),
            ChannelType::Debug => Vec::new(),
        };
        match names.as_slice() {
            [only] => Some((*only).clone()),
            _ => None,
        }
    }
}

/// One SMTP account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpAccountConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default = "bool_true")]
    pub use_tls: bool,
    #[serde(default)]
    pub default: bool,
}

fn default_smtp_port() -> u16 { 587 }
fn bool_true() -> bool { true }

/// One Slack incoming-webhook account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackAccountConfig {
    pub webhook_url: String,
    /// Channel used when a notification names no recipient.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub icon_emoji: Option<String>,
    #[serde(default)]
    pub default: bool,
}

/// One ntfy server account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtfyAccountConfig {
    #[serde(default = "default_ntfy_url")]
    pub url: String,
    /// Topic used when a notification names no recipient.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub default: bool,
}

fn default_ntfy_url() -> String { "https://ntfy.sh".into() }

impl NtfyAccountConfig {
    /// Token auth and basic auth are mutually exclusive.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.token.is_empty() && (!self.username.is_empty() || !self.password.is_empty()) {
            return Err("either token or username/password should be specified, not both".into());
        }
        Ok(())
    }
}
