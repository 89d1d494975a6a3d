//! # Herald Channels
//! Delivery channel adapters and registry construction from config.
//!
//! | Channel type | Adapter | Transport |
//! |---|---|---|
//! | `debug` | [`StdoutAdapter`] | stdout |
//! | `email` | [`SmtpAdapter`] | SMTP (lettre) |
//! | `chat` | [`SlackAdapter`] | Slack incoming webhook |
//! | `push` | [`NtfyAdapter`] | ntfy HTTP publish |

pub mod debug;
pub mod email;
pub mod ntfy;
pub mod slack;

use std::sync::Arc;

use herald_core::config::NotifiersConfig;
use herald_core::{ChannelType, Result};
use herald_dispatch::AdapterRegistry;

pub use debug::StdoutAdapter;
pub use email::SmtpAdapter;
pub use ntfy::NtfyAdapter;
pub use slack::SlackAdapter;

/// Register one adapter per configured account and record each type's
/// default account.
///
/// Must be called inside a Tokio runtime: SMTP accounts build a pooled
/// async transport.
pub fn registry_from_config(notifiers: &NotifiersConfig) -> Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();

    if notifiers.stdout {
        registry.register("", Arc::new(StdoutAdapter::new()))?;
    }
    for (name, account) in &notifiers.email {
        registry.register(name, Arc::new(SmtpAdapter::new(name, account)?))?;
    }
    for (name, account) in &notifiers.slack {
        registry.register(name, Arc::new(SlackAdapter::new(name, account)?))?;
    }
    for (name, account) in &notifiers.ntfy {
        registry.register(name, Arc::new(NtfyAdapter::new(name, account)?))?;
    }

    for channel_type in [ChannelType::Email, ChannelType::Chat, ChannelType::Push] {
        if let Some(account) = notifiers.default_account(channel_type) {
            registry.set_default(channel_type, &account)?;
            tracing::debug!("Default {channel_type} account: {account}");
        }
    }

    if registry.is_empty() {
        tracing::warn!("⚠️ No notification channels configured");
    } else {
        tracing::info!("📡 {} channel adapter(s) ready", registry.count());
    }
    Ok(registry)
}
