//! Chat channel — Slack incoming webhooks.

use std::time::Duration;

use async_trait::async_trait;
use herald_core::config::SlackAccountConfig;
use herald_core::traits::validate_common;
use herald_core::{
    ChannelAdapter, ChannelType, DeliveryReport, HeraldError, Notification, Priority, Result,
};
use serde_json::{Value, json};

/// One Slack webhook account.
pub struct SlackAdapter {
    account: String,
    config: SlackAccountConfig,
    client: reqwest::Client,
}

impl SlackAdapter {
    pub fn new(account: &str, config: &SlackAccountConfig) -> Result<Self> {
        if config.webhook_url.trim().is_empty() {
            return Err(HeraldError::Config(format!(
                "slack account '{account}': webhook_url is required"
            )));
        }
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

    /// Channels to post to: the notification's recipients, else the account default.
    fn targets(&self, notification: &Notification) -> Vec<String> {
        if notification.recipients.is_empty() {
            self.config.channel.iter().cloned().collect()
        } else {
            notification.recipients.clone()
        }
    }

    /// Webhook payload for one channel.
    pub fn build_payload(&self, notification: &Notification, channel: &str) -> Value {
        let mut payload = json!({ "channel": channel, "mrkdwn": true });
        if let Some(username) = &self.config.username {
            payload["username"] = json!(username);
        }
        if let Some(icon) = &self.config.icon_emoji {
            payload["icon_emoji"] = json!(icon);
        }

        let mut blocks = Vec::new();
        if notification.priority >= Priority::High {
            let emoji = if notification.priority == Priority::Critical {
                ":rotating_light:"
            } else {
                ":warning:"
            };
            blocks.push(json!({
                "type": "context",
                "elements": [{
                    "type": "mrkdwn",
                    "text": format!("{emoji} *Priority: {:?}*", notification.priority),
                }],
            }));
        }

        if notification.subject.is_empty() {
            payload["text"] = json!(notification.body);
        } else {
            // fallback for notifications and clients without block support
            payload["text"] = json!(format!("*{}*\n{}", notification.subject, notification.body));
            blocks.push(json!({
                "type": "header",
                "text": { "type": "plain_text", "text": notification.subject },
            }));
            blocks.push(json!({
                "type": "section",
                "text": { "type": "mrkdwn", "text": notification.body },
            }));
        }

        if !blocks.is_empty() {
            payload["blocks"] = Value::Array(blocks);
        }
        payload
    }

    async fn post(&self, payload: &Value) -> Result<()> {
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| HeraldError::Channel(format!("Slack request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HeraldError::Delivery(format!(
                "Slack API returned status {status}: {body}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Chat
    }

    fn validate(&self, notification: &Notification) -> Result<()> {
        validate_common(ChannelType::Chat, notification)?;
        if self.targets(notification).is_empty() {
            return Err(HeraldError::Validation(
                "chat notification needs a recipient channel or an account default".into(),
            ));
        }
        Ok(())
    }

    async fn deliver(&self, notification: &Notification) -> Result<DeliveryReport> {
        let channels = self.targets(notification);
        for channel in &channels {
            let payload = self.build_payload(notification, channel);
            self.post(&payload).await?;
            tracing::debug!("💬 Slack ({}) posted to {channel}", self.account);
        }
        Ok(
            DeliveryReport::delivered(format!(
                "Slack notification sent to {} channel(s)",
                channels.len()
            ))
            .with_response("channels", json!(channels)),
        )
    }
}
