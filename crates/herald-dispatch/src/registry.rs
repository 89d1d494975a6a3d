//! Adapter registry — which adapter serves which (channel type, account).
//!
//! Built once at startup, then shared read-only behind an `Arc`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use herald_core::{ChannelAdapter, ChannelType, HeraldError, Result};

/// Registered channel adapters.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<(ChannelType, String), Arc<dyn ChannelAdapter>>,
    defaults: HashMap<ChannelType, String>,
}

impl AdapterRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its channel type and an account name.
    /// The empty account name is the type-wide fallback.
    pub fn register(&mut self, account: &str, adapter: Arc<dyn ChannelAdapter>) -> Result<()> {
        let key = (adapter.channel_type(), account.to_string());
        if self.adapters.contains_key(&key) {
            return Err(HeraldError::DuplicateRegistration(describe(key.0, account)));
        }
        tracing::info!("📡 Registered channel: {}", describe(key.0, account));
        self.adapters.insert(key, adapter);
        Ok(())
    }

    /// Account used when a notification names none.
    pub fn set_default(&mut self, channel_type: ChannelType, account: &str) -> Result<()> {
        if !self.adapters.contains_key(&(channel_type, account.to_string())) {
            return Err(HeraldError::UnsupportedChannel(describe(channel_type, account)));
        }
        self.defaults.insert(channel_type, account.to_string());
        Ok(())
    }

    pub fn default_account(&self, channel_type: ChannelType) -> Option<&str> {
        self.defaults.get(&channel_type).map(String::as_str)
    }

    /// Find the adapter for a notification's channel type and account.
    ///
    /// An explicit account must match exactly. An empty account tries the
    /// type's default account, then the type-wide adapter.
    pub fn resolve(&self, channel_type: ChannelType, account: &str) -> Result<Arc<dyn ChannelAdapter>> {
        if let Some(adapter) = self.adapters.get(&(channel_type, account.to_string())) {
            return Ok(adapter.clone());
        }
        if account.is_empty()
            && let Some(default) = self.defaults.get(&channel_type)
            && let Some(adapter) = self.adapters.get(&(channel_type, default.clone()))
        {
            return Ok(adapter.clone());
        }
        Err(HeraldError::UnsupportedChannel(describe(channel_type, account)))
    }

    /// Channel types with at least one adapter, sorted.
    pub fn supported_types(&self) -> Vec<ChannelType> {
        self.adapters
            .keys()
            .map(|(channel_type, _)| *channel_type)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Registered account names for one channel type, sorted.
    pub fn accounts_for(&self, channel_type: ChannelType) -> Vec<String> {
        let mut accounts: Vec<String> = self
            .adapters
            .keys()
            .filter(|(t, _)| *t == channel_type)
            .map(|(_, account)| account.clone())
            .collect();
        accounts.sort();
        accounts
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Total number of registered adapters.
    pub fn count(&self) -> usize {
        self.adapters.len()
    }

    /// Release every adapter. Failures are logged and skipped.
    pub async fn release_all(&self) {
        for ((channel_type, account), adapter) in &self.adapters {
            if let Err(e) = adapter.release().await {
                tracing::warn!("⚠️ Failed to release {}: {e}", describe(*channel_type, account));
            }
        }
    }
}

fn describe(channel_type: ChannelType, account: &str) -> String {
    if account.is_empty() {
        channel_type.to_string()
    } else {
        format!("{channel_type}/{account}")
    }
}
