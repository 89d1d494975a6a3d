//! Channel adapter capability — what every delivery channel must provide.

use async_trait::async_trait;

use crate::error::{HeraldError, Result};
use crate::types::{ChannelType, DeliveryReport, Notification};

/// A delivery channel for one channel type (and optionally one named account).
///
/// Adapters are shared across workers and must tolerate concurrent calls for
/// different notifications. A single notification is never delivered by two
/// workers at once.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// The channel type this adapter serves.
    fn channel_type(&self) -> ChannelType;

    /// Reject notifications this channel cannot deliver. Runs before enqueue.
    fn validate(&self, notification: &Notification) -> Result<()>;

    /// Attempt delivery once. `Err` and `Ok(report)` with `success == false`
    /// are both treated as a failed attempt.
    async fn deliver(&self, notification: &Notification) -> Result<DeliveryReport>;

    /// Release connections and other resources at shutdown.
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Checks shared by all channels: the type matches and there is a body.
pub fn validate_common(expected: ChannelType, notification: &Notification) -> Result<()> {
    if notification.channel_type != expected {
        return Err(HeraldError::Validation(format!(
            "channel type mismatch: expected {expected}, got {}",
            notification.channel_type
        )));
    }
    if notification.body.trim().is_empty() {
        return Err(HeraldError::Validation(format!("{expected} body is required")));
    }
    Ok(())
}
