//! Push channel — ntfy JSON publishing.
//!
//! Each recipient is a topic. Optional ntfy features (tags, click, attach,
//! icon, delay, email, actions) are read from the notification metadata.

use std::time::Duration;

use async_trait::async_trait;
use herald_core::config::NtfyAccountConfig;
use herald_core::traits::validate_common;
use herald_core::{
    ChannelAdapter, ChannelType, DeliveryReport, HeraldError, Notification, Priority, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Publish request body.
#[derive(Debug, Clone, Serialize)]
pub struct NtfyMessage {
    pub topic: String,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    pub priority: u8,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<NtfyAction>,
}

/// Action button attached to a push message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtfyAction {
    pub action: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear: bool,
}

/// ntfy priority scale (1 = min, 5 = max).
pub fn ntfy_priority(priority: Priority) -> u8 {
    match priority {
        Priority::Low => 2,
        Priority::Normal => 3,
        Priority::High => 4,
        Priority::Critical => 5,
    }
}

/// One ntfy server account.
pub struct NtfyAdapter {
    account: String,
    config: NtfyAccountConfig,
    client: reqwest::Client,
}

impl NtfyAdapter {
    pub fn new(account: &str, config: &NtfyAccountConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| HeraldError::Config(format!("ntfy account '{account}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HeraldError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            account: account.to_string(),
            config: config.clone(),
            client,
        })
    }

    /// Topics to publish to: the notification's recipients, else the account default.
    fn topics(&self, notification: &Notification) -> Vec<String> {
        if notification.recipients.is_empty() {
            self.config.topic.iter().cloned().collect()
        } else {
            notification.recipients.clone()
        }
    }

    pub fn build_message(&self, notification: &Notification, topic: &str) -> NtfyMessage {
        let meta = &notification.metadata;
        let text = |key: &str| meta.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let tags = meta
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let actions = meta
            .get("actions")
            .and_then(|v| v.as_array())
            .map(|actions| {
                actions
                    .iter()
                    .filter_map(|a| serde_json::from_value::<NtfyAction>(a.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        NtfyMessage {
            topic: topic.to_string(),
            message: notification.body.clone(),
            title: notification.subject.clone(),
            priority: ntfy_priority(notification.priority),
            tags,
            click: text("click"),
            attach: text("attach"),
            icon: text("icon"),
            delay: text("delay"),
            email: text("email"),
            actions,
        }
    }

    async fn publish(&self, message: &NtfyMessage) -> Result<()> {
        let mut request = self.client.post(&self.config.url).json(message);
        if !self.config.token.is_empty() {
            request = request.bearer_auth(&self.config.token);
        } else if !self.config.username.is_empty() && !self.config.password.is_empty() {
            request = request.basic_auth(&self.config.username, Some(&self.config.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| HeraldError::Channel(format!("ntfy request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HeraldError::Delivery(format!(
                "ntfy server returned status: {status}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelAdapter for NtfyAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Push
    }

    fn validate(&self, notification: &Notification) -> Result<()> {
        validate_common(ChannelType::Push, notification)?;
        if self.topics(notification).is_empty() {
            return Err(HeraldError::Validation(
                "push notification needs a topic or an account default".into(),
            ));
        }
        Ok(())
    }

    async fn deliver(&self, notification: &Notification) -> Result<DeliveryReport> {
        let topics = self.topics(notification);
        for topic in &topics {
            self.publish(&self.build_message(notification, topic)).await?;
        }
        tracing::debug!("🔔 ntfy ({}) published to {} topic(s)", self.account, topics.len());
        Ok(
            DeliveryReport::delivered(format!("Notification sent to {} topic(s)", topics.len()))
                .with_response("server", json!(self.config.url))
                .with_response("topics", json!(topics)),
        )
    }
}
