//! Stdout channel — prints notifications instead of delivering them.
//! Handy for local runs and smoke tests.

use async_trait::async_trait;
use herald_core::traits::validate_common;
use herald_core::{ChannelAdapter, ChannelType, DeliveryReport, HeraldError, Notification, Result};

const RULE: &str = "========================================";

/// Debug adapter writing a framed block per notification to stdout.
#[derive(Debug, Default)]
pub struct StdoutAdapter;

impl StdoutAdapter {
    pub fn new() -> Self {
        Self
    }

    /// The block printed for one notification.
    pub fn render(notification: &Notification) -> String {
        format!(
            "{RULE}\nNotification ID: {}\nType: {}\nPriority: {}\nRecipients: {:?}\nSubject: {}\nBody:\n{}\n{RULE}",
            notification.id,
            notification.channel_type,
            notification.priority as u8,
            notification.recipients,
            notification.subject,
            notification.body,
        )
    }
}

#[async_trait]
impl ChannelAdapter for StdoutAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Debug
    }

    fn validate(&self, notification: &Notification) -> Result<()> {
        validate_common(ChannelType::Debug, notification)?;
        if notification.recipients.is_empty() {
            return Err(HeraldError::Validation("notification has no recipients".into()));
        }
        Ok(())
    }

    async fn deliver(&self, notification: &Notification) -> Result<DeliveryReport> {
        println!("{}", Self::render(notification));
        Ok(DeliveryReport::delivered("Notification printed to stdout"))
    }
}
