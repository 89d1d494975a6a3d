//! Notification data model — the unit of work and everything reported about it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retry budget applied when a notification arrives with `max_retries == 0`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delivery medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Email,
    #[serde(alias = "slack")]
    Chat,
    #[serde(alias = "ntfy")]
    Push,
    #[serde(alias = "stdout")]
    Debug,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Email => "email",
            ChannelType::Chat => "chat",
            ChannelType::Push => "push",
            ChannelType::Debug => "debug",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelType {
    type Err = crate::error::HeraldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" | "smtp" => Ok(ChannelType::Email),
            "chat" | "slack" => Ok(ChannelType::Chat),
            "push" | "ntfy" => Ok(ChannelType::Push),
            "debug" | "stdout" => Ok(ChannelType::Debug),
            other => Err(crate::error::HeraldError::UnsupportedChannel(other.to_string())),
        }
    }
}

/// Urgency. Recorded and forwarded to channels; never reorders the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    #[default]
    Pending,
    Queued,
    Processing,
    Sent,
    Retrying,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Queued => "queued",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Retrying => "retrying",
            NotificationStatus::Failed => "failed",
        }
    }

    /// `sent` and `failed` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Failed)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[serde(alias = "text")]
    Plain,
    #[serde(alias = "html")]
    Rich,
}

impl ContentKind {
    /// Guess the body format from common HTML markers.
    pub fn detect(body: &str) -> Self {
        let trimmed = body.trim();
        let looks_rich = trimmed.starts_with('<')
            || ["<html", "<!DOCTYPE", "<p>", "<div>", "<br>"]
                .iter()
                .any(|marker| trimmed.contains(marker));
        if looks_rich { ContentKind::Rich } else { ContentKind::Plain }
    }
}

/// A notification to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique id. Assigned on send when empty.
    #[serde(default)]
    pub id: String,
    pub channel_type: ChannelType,
    /// Named account within the channel type. Empty means "the default".
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: NotificationStatus,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    /// `None` lets the channel detect the format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_kind: Option<ContentKind>,
    /// Primary destinations: addresses, chat channels, push topics.
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    /// Channel-specific extras.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// Accepted and stored, not consulted by the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Notification {
    /// Create a pending notification for a channel.
    pub fn new(channel_type: ChannelType, subject: &str, body: &str) -> Self {
        Self {
            id: String::new(),
            channel_type,
            account: String::new(),
            priority: Priority::Normal,
            status: NotificationStatus::Pending,
            subject: subject.to_string(),
            body: body.to_string(),
            content_kind: None,
            recipients: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
            scheduled_for: None,
            sent_at: None,
            retry_count: 0,
            max_retries: 0,
            last_error: None,
        }
    }

    pub fn to(mut self, recipient: &str) -> Self {
        self.recipients.push(recipient.to_string());
        self
    }

    pub fn with_account(mut self, account: &str) -> Self {
        self.account = account.to_string();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Fill in id and retry budget. Called once, when the notification enters the system.
    pub fn apply_defaults(&mut self, default_max_retries: u32) {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        if self.max_retries == 0 {
            self.max_retries = if default_max_retries == 0 {
                DEFAULT_MAX_RETRIES
            } else {
                default_max_retries
            };
        }
    }

    /// To, CC and BCC in that order.
    pub fn all_recipients(&self) -> impl Iterator<Item = &String> {
        self.recipients.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Explicit content kind, or the one detected from the body.
    pub fn effective_content_kind(&self) -> ContentKind {
        self.content_kind.unwrap_or_else(|| ContentKind::detect(&self.body))
    }

    /// Delivery latency for sent notifications.
    pub fn latency(&self) -> Option<chrono::Duration> {
        self.sent_at.map(|sent| sent - self.created_at)
    }
}

/// What an adapter reports for one delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw data returned by the provider, if any.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub provider_response: serde_json::Map<String, serde_json::Value>,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryReport {
    pub fn delivered(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            provider_response: serde_json::Map::new(),
            delivered_at: Utc::now(),
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: String::new(),
            error: Some(error.into()),
            provider_response: serde_json::Map::new(),
            delivered_at: Utc::now(),
        }
    }

    pub fn with_response(mut self, key: &str, value: serde_json::Value) -> Self {
        self.provider_response.insert(key.to_string(), value);
        self
    }
}

/// Acknowledgment returned by send/retry. A receipt means "queued", not "delivered".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub notification_id: String,
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: NotificationStatus,
    pub at: DateTime<Utc>,
}

impl SendReceipt {
    /// Acknowledgment that a notification was accepted into the queue.
    pub fn queued(notification_id: &str) -> Self {
        Self {
            notification_id: notification_id.to_string(),
            success: true,
            message: "notification queued successfully".into(),
            error: None,
            status: NotificationStatus::Queued,
            at: Utc::now(),
        }
    }
}

/// Query over the notification store. Empty sets match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationFilter {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub channel_types: Vec<ChannelType>,
    #[serde(default)]
    pub statuses: Vec<NotificationStatus>,
    /// Substrings matched against To, CC and BCC.
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    /// 0 means unlimited.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl NotificationFilter {
    pub fn matches(&self, n: &Notification) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| *id == n.id) {
            return false;
        }
        if !self.channel_types.is_empty() && !self.channel_types.contains(&n.channel_type) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&n.status) {
            return false;
        }
        if !self.recipients.is_empty()
            && !self
                .recipients
                .iter()
                .any(|needle| n.all_recipients().any(|r| r.contains(needle.as_str())))
        {
            return false;
        }
        if self.created_after.is_some_and(|after| n.created_at < after) {
            return false;
        }
        if self.created_before.is_some_and(|before| n.created_at > before) {
            return false;
        }
        true
    }
}

/// Aggregate counts over the store at one instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationStats {
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_pending: u64,
    pub total_queued: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
    /// Mean `sent_at - created_at` over sent notifications.
    pub average_latency_ms: f64,
}
