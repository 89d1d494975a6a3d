//! Notification store — the authoritative record of every notification.
//!
//! Queue envelopes carry copies; status transitions happen here.

use std::collections::{BTreeMap, HashMap, HashSet};

use herald_core::{
    DeliveryReport, HeraldError, Notification, NotificationFilter, NotificationStats,
    NotificationStatus, Result,
};
use parking_lot::RwLock;

/// Error text recorded on a canceled notification.
pub const CANCELED: &str = "canceled";

/// What the worker should do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Retry budget left: requeue. Carries the updated record.
    Retry(Notification),
    /// Terminal (exhausted, canceled meanwhile, or gone): drop the envelope.
    Finalized,
}

#[derive(Default)]
struct StoreInner {
    by_id: HashMap<String, Notification>,
    /// Insertion order, for stable listing.
    order: Vec<String>,
    /// Ids with a delivery attempt in progress.
    attempting: HashSet<String>,
}

/// Thread-safe map of notification id → notification.
#[derive(Default)]
pub struct NotificationStore {
    inner: RwLock<StoreInner>,
}

impl NotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new notification. Ids must be unique.
    pub fn put(&self, notification: Notification) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&notification.id) {
            return Err(HeraldError::Validation(format!(
                "duplicate notification id: {}",
                notification.id
            )));
        }
        inner.order.push(notification.id.clone());
        inner.by_id.insert(notification.id.clone(), notification);
        Ok(())
    }

    /// Insert or overwrite, keeping the original position when present.
    pub fn upsert(&self, notification: Notification) {
        let mut inner = self.inner.write();
        if !inner.by_id.contains_key(&notification.id) {
            inner.order.push(notification.id.clone());
        }
        inner.by_id.insert(notification.id.clone(), notification);
    }

    pub fn remove(&self, id: &str) -> Option<Notification> {
        let mut inner = self.inner.write();
        let removed = inner.by_id.remove(id)?;
        inner.order.retain(|existing| existing != id);
        inner.attempting.remove(id);
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<Notification> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `f` to one notification under the write lock.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Notification) -> R) -> Result<R> {
        let mut inner = self.inner.write();
        let notification = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| HeraldError::NotFound(id.to_string()))?;
        Ok(f(notification))
    }

    /// Promote `pending` to `queued`. Later statuses are left alone, since a
    /// worker may already have picked the envelope up.
    pub fn mark_queued(&self, id: &str) -> Option<NotificationStatus> {
        let mut inner = self.inner.write();
        let notification = inner.by_id.get_mut(id)?;
        if notification.status == NotificationStatus::Pending {
            notification.status = NotificationStatus::Queued;
        }
        Some(notification.status)
    }

    /// Claim a dequeued envelope for delivery.
    ///
    /// Returns `None` when the envelope must be skipped: the notification
    /// already reached a terminal status (canceled while queued, or
    /// delivered) or another attempt holds it. A notification unknown to the
    /// store (snapshot replay) is adopted. Pair with [`end_attempt`](Self::end_attempt).
    pub fn begin_attempt(&self, snapshot: &Notification) -> Option<Notification> {
        let mut inner = self.inner.write();
        let id = snapshot.id.clone();
        if inner.attempting.contains(&id) {
            return None;
        }
        let current = match inner.by_id.get_mut(&id) {
            Some(existing) => {
                if existing.status.is_terminal() {
                    return None;
                }
                existing.status = NotificationStatus::Processing;
                existing.clone()
            }
            None => {
                let mut adopted = snapshot.clone();
                adopted.status = NotificationStatus::Processing;
                inner.order.push(id.clone());
                inner.by_id.insert(id.clone(), adopted.clone());
                adopted
            }
        };
        inner.attempting.insert(id);
        Some(current)
    }

    /// Release the claim taken by `begin_attempt` before a requeue. Terminal
    /// outcomes release it themselves.
    pub fn end_attempt(&self, id: &str) {
        self.inner.write().attempting.remove(id);
    }

    /// Record a successful delivery. Overrides a cancel that raced the attempt:
    /// the message did go out.
    pub fn record_success(&self, id: &str, report: &DeliveryReport) -> Option<Notification> {
        let mut inner = self.inner.write();
        inner.attempting.remove(id);
        let notification = inner.by_id.get_mut(id)?;
        notification.status = NotificationStatus::Sent;
        notification.sent_at = Some(report.delivered_at);
        notification.last_error = None;
        Some(notification.clone())
    }

    /// Record a failed attempt and decide between retry and final failure.
    ///
    /// With budget left (`retry_count < max_retries`) the count goes up, the
    /// status becomes `retrying` and the attempt claim is kept until
    /// `end_attempt`. Otherwise the status becomes `failed` and the claim is
    /// released.
    pub fn record_failure(&self, id: &str, error: &str) -> FailureOutcome {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let Some(notification) = inner.by_id.get_mut(id) else {
            inner.attempting.remove(id);
            return FailureOutcome::Finalized;
        };
        if !notification.status.is_terminal() {
            notification.last_error = Some(error.to_string());
            if notification.retry_count < notification.max_retries {
                notification.retry_count += 1;
                notification.status = NotificationStatus::Retrying;
                return FailureOutcome::Retry(notification.clone());
            }
            notification.status = NotificationStatus::Failed;
        }
        inner.attempting.remove(id);
        FailureOutcome::Finalized
    }

    /// Force a notification to `failed`, e.g. when its adapter vanished.
    pub fn mark_failed(&self, id: &str, error: &str) {
        let mut inner = self.inner.write();
        inner.attempting.remove(id);
        if let Some(notification) = inner.by_id.get_mut(id) {
            notification.status = NotificationStatus::Failed;
            notification.last_error = Some(error.to_string());
        }
    }

    /// Cancel: `failed` with `last_error = "canceled"`. Already-failed
    /// notifications are left untouched; sent ones cannot be canceled.
    pub fn cancel(&self, id: &str) -> Result<Notification> {
        let mut inner = self.inner.write();
        let notification = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| HeraldError::NotFound(id.to_string()))?;
        match notification.status {
            NotificationStatus::Sent => Err(HeraldError::InvalidState(format!(
                "notification {id} was already sent"
            ))),
            NotificationStatus::Failed => Ok(notification.clone()),
            _ => {
                notification.status = NotificationStatus::Failed;
                notification.last_error = Some(CANCELED.into());
                Ok(notification.clone())
            }
        }
    }

    /// Reset a notification for another round of attempts.
    pub fn reset_for_retry(&self, id: &str) -> Result<Notification> {
        let mut inner = self.inner.write();
        if inner.attempting.contains(id) {
            return Err(HeraldError::InvalidState(format!(
                "notification {id} has a delivery attempt in progress"
            )));
        }
        let notification = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| HeraldError::NotFound(id.to_string()))?;
        if notification.status == NotificationStatus::Sent {
            return Err(HeraldError::InvalidState(format!(
                "notification {id} was already sent"
            )));
        }
        notification.retry_count = 0;
        notification.status = NotificationStatus::Pending;
        notification.last_error = None;
        notification.sent_at = None;
        Ok(notification.clone())
    }

    /// Roll back a `reset_for_retry` that never reached the queue. Only a
    /// record still `pending` is replaced.
    pub fn restore_pending(&self, previous: Notification) -> bool {
        let mut inner = self.inner.write();
        match inner.by_id.get_mut(&previous.id) {
            Some(current) if current.status == NotificationStatus::Pending => {
                *current = previous;
                true
            }
            _ => false,
        }
    }

    /// Matching notifications in insertion order, after offset and limit.
    pub fn list(&self, filter: &NotificationFilter) -> Vec<Notification> {
        let inner = self.inner.read();
        let matching = inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|n| filter.matches(n))
            .skip(filter.offset);
        if filter.limit == 0 {
            matching.cloned().collect()
        } else {
            matching.take(filter.limit).cloned().collect()
        }
    }

    /// Counts over one consistent view of the store.
    pub fn stats(&self) -> NotificationStats {
        let inner = self.inner.read();
        let mut stats = NotificationStats::default();
        let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_status: BTreeMap<String, u64> = BTreeMap::new();
        let mut latency_total_ms = 0f64;
        let mut latency_samples = 0u64;

        for notification in inner.by_id.values() {
            *by_type.entry(notification.channel_type.to_string()).or_default() += 1;
            *by_status.entry(notification.status.to_string()).or_default() += 1;
            match notification.status {
                NotificationStatus::Sent => {
                    stats.total_sent += 1;
                    if let Some(latency) = notification.latency() {
                        latency_total_ms += latency.num_milliseconds() as f64;
                        latency_samples += 1;
                    }
                }
                NotificationStatus::Failed => stats.total_failed += 1,
                NotificationStatus::Pending => stats.total_pending += 1,
                NotificationStatus::Queued => stats.total_queued += 1,
                _ => {}
            }
        }

        if latency_samples > 0 {
            stats.average_latency_ms = latency_total_ms / latency_samples as f64;
        }
        stats.by_type = by_type;
        stats.by_status = by_status;
        stats
    }
}
