//! Notification service — the public face of the dispatcher.
//!
//! `send` validates and admits; delivery happens later on the worker pool.
//! A receipt means "queued", never "delivered": callers poll `get` for the outcome.

use std::collections::HashSet;
use std::sync::Arc;

use herald_core::config::QueueConfig;
use herald_core::{
    HeraldError, Notification, NotificationFilter, NotificationStats, NotificationStatus, Result,
    SendReceipt,
};
use parking_lot::Mutex;

use crate::queue::DispatchQueue;
use crate::registry::AdapterRegistry;
use crate::store::NotificationStore;
use crate::worker::{DispatchContext, WorkerPool, WorkerSettings};

/// Dispatcher: store + queue + worker pool over a fixed adapter registry.
pub struct DispatchService {
    context: DispatchContext,
    settings: WorkerSettings,
    default_max_retries: u32,
    pool: Mutex<Option<WorkerPool>>,
}

impl DispatchService {
    /// Assemble a service around an existing queue. Notifications replayed
    /// from the queue's snapshot are adopted into the store.
    pub fn new(
        registry: Arc<AdapterRegistry>,
        queue: DispatchQueue,
        settings: WorkerSettings,
        default_max_retries: u32,
    ) -> Self {
        let store = Arc::new(NotificationStore::new());
        for notification in queue.pending_notifications() {
            store.upsert(notification);
        }
        Self {
            context: DispatchContext {
                queue: Arc::new(queue),
                store,
                registry,
            },
            settings,
            default_max_retries,
            pool: Mutex::new(None),
        }
    }

    /// Build from the `[queue]` config section.
    pub fn from_config(config: &QueueConfig, registry: Arc<AdapterRegistry>) -> Result<Self> {
        let queue = match config.snapshot_path() {
            Some(path) => DispatchQueue::with_snapshot(config.buffer_size, &path)?,
            None => DispatchQueue::new(config.buffer_size),
        };
        let settings = WorkerSettings::from_config(config)?;
        Ok(Self::new(registry, queue, settings, config.default_max_retries))
    }

    /// Spawn the worker pool.
    pub fn start(&self) -> Result<()> {
        self.context.queue.health_check()?;
        let mut pool = self.pool.lock();
        if pool.is_some() {
            return Err(HeraldError::InvalidState("dispatcher already started".into()));
        }
        let started = WorkerPool::start(self.context.clone(), self.settings.clone());
        tracing::info!(
            "🚀 Dispatcher started: {} worker(s), queue capacity {}",
            started.worker_count(),
            self.context.queue.capacity()
        );
        *pool = Some(started);
        Ok(())
    }

    /// Stop admitting, let workers finish their current envelope, close the
    /// queue and release adapters. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.context.queue.seal();
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.stop().await;
        }
        self.context.queue.close();
        self.context.registry.release_all().await;
        tracing::info!("🛑 Dispatcher shut down");
    }

    /// Validate and queue one notification.
    pub async fn send(&self, notification: Notification) -> Result<SendReceipt> {
        let notification = self.prepare(notification)?;
        self.admit(notification).await
    }

    /// Validate every item, then queue them in order. Nothing is stored when
    /// any item is invalid; an admission failure midway leaves earlier items queued.
    pub async fn send_batch(&self, notifications: Vec<Notification>) -> Result<Vec<SendReceipt>> {
        let mut prepared = Vec::with_capacity(notifications.len());
        let mut seen = HashSet::new();
        for (index, notification) in notifications.into_iter().enumerate() {
            let notification = self.prepare(notification).map_err(|e| match e {
                HeraldError::Validation(msg) => {
                    HeraldError::Validation(format!("batch item {index}: {msg}"))
                }
                other => other,
            })?;
            if !seen.insert(notification.id.clone()) {
                return Err(HeraldError::Validation(format!(
                    "batch item {index}: duplicate notification id {}",
                    notification.id
                )));
            }
            prepared.push(notification);
        }

        let mut receipts = Vec::with_capacity(prepared.len());
        for notification in prepared {
            receipts.push(self.admit(notification).await?);
        }
        Ok(receipts)
    }

    pub fn get(&self, id: &str) -> Result<Notification> {
        self.context
            .store
            .get(id)
            .ok_or_else(|| HeraldError::NotFound(id.to_string()))
    }

    pub fn list(&self, filter: &NotificationFilter) -> Vec<Notification> {
        self.context.store.list(filter)
    }

    /// Mark a notification failed with `last_error = "canceled"`. Its
    /// buffered envelopes are dropped; an attempt already running finishes.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let canceled = self.context.store.cancel(id)?;
        if let Err(e) = self.context.queue.discard_notification(id) {
            tracing::debug!("Queue unavailable while canceling {id}: {e}");
        }
        tracing::info!("🚫 Canceled {} ({})", id, canceled.status);
        Ok(())
    }

    /// Reset the retry count and queue the notification again.
    ///
    /// If enqueue fails, or this future is dropped while waiting for room,
    /// the previous record is put back.
    pub async fn retry(&self, id: &str) -> Result<SendReceipt> {
        self.context.queue.discard_notification(id)?;
        let previous = self.get(id)?;
        let notification = self.context.store.reset_for_retry(id)?;
        let mut restore = Restore {
            store: &self.context.store,
            previous: Some(previous),
        };

        self.context.queue.enqueue(notification).await?;
        restore.previous = None;

        self.context.store.mark_queued(id);
        tracing::info!("🔄 Requeued {id} by request");
        Ok(SendReceipt::queued(id))
    }

    pub fn stats(&self) -> NotificationStats {
        self.context.store.stats()
    }

    /// Healthy while the queue accepts work and workers are running.
    pub fn health_check(&self) -> Result<()> {
        self.context.queue.health_check()?;
        if self.pool.lock().is_none() {
            return Err(HeraldError::InvalidState("dispatcher not started".into()));
        }
        Ok(())
    }

    /// Envelopes waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.context.queue.size()
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.context.registry
    }

    /// Defaults, adapter resolution and channel validation. Touches no state.
    fn prepare(&self, mut notification: Notification) -> Result<Notification> {
        notification.apply_defaults(self.default_max_retries);
        notification.status = NotificationStatus::Pending;
        notification.retry_count = 0;
        notification.sent_at = None;
        notification.last_error = None;

        let adapter = self
            .context
            .registry
            .resolve(notification.channel_type, &notification.account)?;
        adapter.validate(&notification)?;
        Ok(notification)
    }

    /// Store as `pending`, enqueue, then promote to `queued`.
    ///
    /// If enqueue fails, or this future is dropped while waiting for room,
    /// the stored record is removed again.
    async fn admit(&self, notification: Notification) -> Result<SendReceipt> {
        let id = notification.id.clone();
        self.context.store.put(notification.clone())?;
        let mut rollback = Rollback {
            store: &self.context.store,
            id: &id,
            armed: true,
        };

        self.context.queue.enqueue(notification).await?;
        rollback.armed = false;

        self.context.store.mark_queued(&id);
        tracing::info!("📨 Queued notification {id}");
        Ok(SendReceipt::queued(&id))
    }
}

/// Removes a stored notification unless disarmed.
struct Rollback<'a> {
    store: &'a NotificationStore,
    id: &'a str,
    armed: bool,
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store.remove(self.id);
        }
    }
}

/// Puts a notification back the way it was before a retry, unless disarmed.
struct Restore<'a> {
    store: &'a NotificationStore,
    previous: Option<Notification>,
}

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.store.restore_pending(previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{BackoffStrategy, RetryPolicy};
    use async_trait::async_trait;
    use herald_core::{ChannelAdapter, ChannelType, DeliveryReport};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Scripted debug-channel adapter.
    #[derive(Default)]
    struct Scripted {
        /// Fail this many calls before succeeding.
        fail_first: u32,
        always_fail: bool,
        /// Answer with a non-success report instead of an error.
        reject: bool,
        delay: Duration,
        calls: AtomicU32,
        delivered: parking_lot::Mutex<Vec<String>>,
    }

    impl Scripted {
        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChannelAdapter for Scripted {
        fn channel_type(&self) -> ChannelType {
            ChannelType::Debug
        }

        fn validate(&self, notification: &Notification) -> Result<()> {
            herald_core::traits::validate_common(ChannelType::Debug, notification)?;
            if notification.recipients.is_empty() {
                return Err(HeraldError::Validation("at least one recipient is required".into()));
            }
            Ok(())
        }

        async fn deliver(&self, notification: &Notification) -> Result<DeliveryReport> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.always_fail || call <= self.fail_first {
                return Err(HeraldError::Delivery(format!("scripted failure {call}")));
            }
            if self.reject {
                return Ok(DeliveryReport::rejected("mailbox full"));
            }
            self.delivered.lock().push(notification.id.clone());
            Ok(DeliveryReport::delivered("printed"))
        }
    }

    fn settings(workers: usize) -> WorkerSettings {
        WorkerSettings {
            worker_count: workers,
            dequeue_timeout: Duration::from_millis(50),
            delivery_timeout: Duration::from_secs(2),
            retry: RetryPolicy::immediate(),
        }
    }

    fn service_with(adapter: Arc<Scripted>, capacity: usize, settings: WorkerSettings) -> DispatchService {
        let mut registry = AdapterRegistry::new();
        registry.register("", adapter).unwrap();
        DispatchService::new(Arc::new(registry), DispatchQueue::new(capacity), settings, 3)
    }

    fn note(body: &str) -> Notification {
        Notification::new(ChannelType::Debug, "Subject", body).to("tester")
    }

    async fn wait_for(svc: &DispatchService, id: &str, status: NotificationStatus) -> Notification {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let current = svc.get(id).unwrap();
            if current.status == status {
                return current;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{id} stuck in {} waiting for {status}",
                current.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_send_and_deliver() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter.clone(), 16, settings(2));
        svc.start().unwrap();

        let receipt = svc.send(note("hello")).await.unwrap();
        assert!(receipt.success);
        assert!(!receipt.notification_id.is_empty());
        assert_eq!(receipt.status, NotificationStatus::Queued);

        let sent = wait_for(&svc, &receipt.notification_id, NotificationStatus::Sent).await;
        assert!(sent.sent_at.is_some());
        assert_eq!(sent.retry_count, 0);
        assert_eq!(sent.max_retries, 3);
        assert_eq!(adapter.calls(), 1);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_before_and_after_processing() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter, 16, settings(1));

        let receipt = svc.send(note("hello").with_max_retries(0)).await.unwrap();
        let id = receipt.notification_id;
        assert_eq!(receipt.status, NotificationStatus::Queued);
        let queued = svc.get(&id).unwrap();
        assert_eq!(queued.status, NotificationStatus::Queued);
        assert!(queued.sent_at.is_none());

        svc.start().unwrap();
        let sent = wait_for(&svc, &id, NotificationStatus::Sent).await;
        assert!(sent.sent_at.is_some());
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_entries_start_queued() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter, 16, settings(1));

        let receipts = svc
            .send_batch((0..4).map(|i| note(&format!("b{i}"))).collect())
            .await
            .unwrap();
        let ids: HashSet<String> = receipts.iter().map(|r| r.notification_id.clone()).collect();
        assert_eq!(ids.len(), 4);
        for id in &ids {
            assert_eq!(svc.get(id).unwrap().status, NotificationStatus::Queued);
        }
        assert_eq!(svc.stats().total_queued, 4);
    }

    #[tokio::test]
    async fn test_stats_after_three_sends() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter, 16, settings(2));
        svc.start().unwrap();

        for i in 0..3 {
            let id = svc.send(note(&format!("s{i}"))).await.unwrap().notification_id;
            wait_for(&svc, &id, NotificationStatus::Sent).await;
        }
        let stats = svc.stats();
        assert_eq!(stats.total_sent, 3);
        assert_eq!(stats.by_status.get("sent"), Some(&3));
        svc.shutdown().await;
    }

    fn with_backoff(workers: usize, delay: Duration) -> WorkerSettings {
        WorkerSettings {
            retry: RetryPolicy {
                strategy: BackoffStrategy::Fixed,
                base_delay: delay,
                max_delay: delay,
            },
            ..settings(workers)
        }
    }

    async fn wait_for_calls(adapter: &Scripted, calls: u32) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while adapter.calls() < calls {
            assert!(tokio::time::Instant::now() < deadline, "adapter never reached {calls} call(s)");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_rejected_report_counts_as_failure() {
        let adapter = Arc::new(Scripted {
            reject: true,
            ..Default::default()
        });
        let svc = service_with(adapter.clone(), 8, settings(1));
        svc.start().unwrap();

        let id = svc.send(note("full").with_max_retries(1)).await.unwrap().notification_id;
        let failed = wait_for(&svc, &id, NotificationStatus::Failed).await;
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("mailbox full"));
        assert!(failed.sent_at.is_none());
        assert_eq!(adapter.calls(), 2);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_backoff_delays_requeue() {
        let adapter = Arc::new(Scripted {
            fail_first: 1,
            ..Default::default()
        });
        let svc = service_with(adapter.clone(), 8, with_backoff(1, Duration::from_millis(200)));
        svc.start().unwrap();

        let started = tokio::time::Instant::now();
        let id = svc.send(note("later")).await.unwrap().notification_id;
        wait_for_calls(&adapter, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(adapter.calls(), 1);
        assert_eq!(svc.get(&id).unwrap().status, NotificationStatus::Retrying);

        let sent = wait_for(&svc, &id, NotificationStatus::Sent).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(sent.retry_count, 1);
        assert_eq!(adapter.calls(), 2);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_skips_requeued_envelope() {
        let adapter = Arc::new(Scripted {
            always_fail: true,
            ..Default::default()
        });
        let svc = service_with(adapter.clone(), 8, with_backoff(1, Duration::from_millis(300)));
        svc.start().unwrap();

        let id = svc.send(note("doomed")).await.unwrap().notification_id;
        wait_for(&svc, &id, NotificationStatus::Retrying).await;
        svc.cancel(&id).unwrap();

        // the worker requeues after the backoff, then skips the stale envelope
        tokio::time::sleep(Duration::from_millis(600)).await;
        let canceled = svc.get(&id).unwrap();
        assert_eq!(canceled.status, NotificationStatus::Failed);
        assert_eq!(canceled.last_error.as_deref(), Some("canceled"));
        assert_eq!(adapter.calls(), 1);
        assert_eq!(svc.queue_depth(), 0);
        assert_eq!(svc.context.queue.in_flight(), 0);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_inflight_delivery() {
        let adapter = Arc::new(Scripted {
            delay: Duration::from_millis(300),
            ..Default::default()
        });
        let svc = service_with(adapter.clone(), 8, settings(1));
        svc.start().unwrap();

        let id = svc.send(note("slow")).await.unwrap().notification_id;
        wait_for_calls(&adapter, 1).await;
        svc.shutdown().await;

        let done = svc.get(&id).unwrap();
        assert_eq!(done.status, NotificationStatus::Sent);
        assert_eq!(*adapter.delivered.lock(), vec![id.clone()]);
        assert!(svc.health_check().is_err());
    }

    #[tokio::test]
    async fn test_dropped_retry_restores_record() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter.clone(), 2, settings(1));

        svc.send(note("a")).await.unwrap();
        let x = svc.send(note("x")).await.unwrap().notification_id;
        svc.cancel(&x).unwrap();
        svc.send(note("c")).await.unwrap();
        assert_eq!(svc.queue_depth(), 2);

        // queue is full, so the retry gives up waiting for room
        let attempt = tokio::time::timeout(Duration::from_millis(50), svc.retry(&x)).await;
        assert!(attempt.is_err());
        let restored = svc.get(&x).unwrap();
        assert_eq!(restored.status, NotificationStatus::Failed);
        assert_eq!(restored.last_error.as_deref(), Some("canceled"));

        svc.start().unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while svc.stats().total_sent < 2 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(svc.get(&x).unwrap().status, NotificationStatus::Failed);
        assert_eq!(adapter.calls(), 2);

        // with room again the retry goes through
        svc.retry(&x).await.unwrap();
        wait_for(&svc, &x, NotificationStatus::Sent).await;
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_notification_never_stored() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter.clone(), 16, settings(1));

        let no_recipient = Notification::new(ChannelType::Debug, "S", "body");
        assert!(matches!(svc.send(no_recipient).await, Err(HeraldError::Validation(_))));

        let unsupported = Notification::new(ChannelType::Email, "S", "body").to("a@b.c");
        assert!(matches!(
            svc.send(unsupported).await,
            Err(HeraldError::UnsupportedChannel(_))
        ));

        assert!(svc.list(&NotificationFilter::default()).is_empty());
        assert_eq!(svc.queue_depth(), 0);
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let adapter = Arc::new(Scripted {
            fail_first: 2,
            ..Default::default()
        });
        let svc = service_with(adapter.clone(), 16, settings(1));
        svc.start().unwrap();

        let receipt = svc.send(note("flaky").with_max_retries(3)).await.unwrap();
        let sent = wait_for(&svc, &receipt.notification_id, NotificationStatus::Sent).await;
        assert_eq!(sent.retry_count, 2);
        assert!(sent.last_error.is_none());
        assert_eq!(adapter.calls(), 3);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let adapter = Arc::new(Scripted {
            always_fail: true,
            ..Default::default()
        });
        let svc = service_with(adapter.clone(), 16, settings(2));
        svc.start().unwrap();

        let receipt = svc.send(note("doomed").with_max_retries(2)).await.unwrap();
        let failed = wait_for(&svc, &receipt.notification_id, NotificationStatus::Failed).await;
        assert_eq!(failed.retry_count, 2);
        assert!(failed.last_error.as_deref().unwrap_or("").contains("scripted failure"));

        // no stray attempts after the final failure
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(adapter.calls(), 3);
        assert_eq!(svc.queue_depth(), 0);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_delivery_timeout_is_a_failure() {
        let adapter = Arc::new(Scripted {
            delay: Duration::from_millis(500),
            ..Default::default()
        });
        let mut s = settings(1);
        s.delivery_timeout = Duration::from_millis(50);
        let svc = service_with(adapter.clone(), 4, s);
        svc.start().unwrap();

        let mut slow = note("slow");
        slow.max_retries = 1;
        let receipt = svc.send(slow).await.unwrap();
        let failed = wait_for(&svc, &receipt.notification_id, NotificationStatus::Failed).await;
        assert!(failed.last_error.unwrap().contains("timed out"));
        assert!(adapter.delivered.lock().is_empty());
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_queued_is_never_delivered() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter.clone(), 4, settings(1));

        let receipt = svc.send(note("never")).await.unwrap();
        let id = receipt.notification_id;
        svc.cancel(&id).unwrap();
        svc.start().unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let canceled = svc.get(&id).unwrap();
        assert_eq!(canceled.status, NotificationStatus::Failed);
        assert_eq!(canceled.last_error.as_deref(), Some("canceled"));
        assert_eq!(adapter.calls(), 0);

        // idempotent
        svc.cancel(&id).unwrap();
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_errors() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter, 4, settings(1));
        svc.start().unwrap();

        assert!(matches!(svc.cancel("missing"), Err(HeraldError::NotFound(_))));
        let receipt = svc.send(note("quick")).await.unwrap();
        wait_for(&svc, &receipt.notification_id, NotificationStatus::Sent).await;
        assert!(matches!(
            svc.cancel(&receipt.notification_id),
            Err(HeraldError::InvalidState(_))
        ));
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_manual_retry_after_failure() {
        let adapter = Arc::new(Scripted {
            fail_first: 2,
            ..Default::default()
        });
        let svc = service_with(adapter.clone(), 4, settings(1));
        svc.start().unwrap();

        let mut flaky = note("second chance").with_max_retries(1);
        flaky.id = "fixed-id".into();
        let receipt = svc.send(flaky).await.unwrap();
        assert_eq!(receipt.notification_id, "fixed-id");
        let failed = wait_for(&svc, "fixed-id", NotificationStatus::Failed).await;
        assert_eq!(failed.retry_count, 1);
        assert_eq!(adapter.calls(), 2);

        svc.retry("fixed-id").await.unwrap();
        let sent = wait_for(&svc, "fixed-id", NotificationStatus::Sent).await;
        assert_eq!(sent.retry_count, 0);
        assert_eq!(adapter.calls(), 3);

        assert!(matches!(svc.retry("fixed-id").await, Err(HeraldError::InvalidState(_))));
        assert!(matches!(svc.retry("nope").await, Err(HeraldError::NotFound(_))));
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_revives_failed_notification() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter.clone(), 4, settings(1));

        let receipt = svc.send(note("revive")).await.unwrap();
        let id = receipt.notification_id;
        svc.cancel(&id).unwrap();

        let again = svc.retry(&id).await.unwrap();
        assert_eq!(again.notification_id, id);
        let reset = svc.get(&id).unwrap();
        assert_eq!(reset.retry_count, 0);
        assert_eq!(reset.status, NotificationStatus::Queued);
        assert_eq!(svc.queue_depth(), 1);

        svc.start().unwrap();
        wait_for(&svc, &id, NotificationStatus::Sent).await;
        assert_eq!(adapter.calls(), 1);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_all_or_nothing_validation() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter.clone(), 16, settings(2));

        let bad = Notification::new(ChannelType::Debug, "S", "no recipient");
        let err = svc
            .send_batch(vec![note("a"), bad, note("c")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("batch item 1"));
        assert!(svc.list(&NotificationFilter::default()).is_empty());

        let mut dup_a = note("x");
        dup_a.id = "same".into();
        let mut dup_b = note("y");
        dup_b.id = "same".into();
        assert!(svc.send_batch(vec![dup_a, dup_b]).await.is_err());
        assert!(svc.list(&NotificationFilter::default()).is_empty());

        svc.start().unwrap();
        let receipts = svc
            .send_batch(vec![note("a"), note("b"), note("c")])
            .await
            .unwrap();
        assert_eq!(receipts.len(), 3);
        for receipt in &receipts {
            wait_for(&svc, &receipt.notification_id, NotificationStatus::Sent).await;
        }
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_each_notification_delivered_once() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter.clone(), 8, settings(4));
        svc.start().unwrap();

        let mut ids = Vec::new();
        for i in 0..50 {
            ids.push(svc.send(note(&format!("n{i}"))).await.unwrap().notification_id);
        }
        for id in &ids {
            wait_for(&svc, id, NotificationStatus::Sent).await;
        }

        let delivered = adapter.delivered.lock().clone();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for id in delivered {
            *counts.entry(id).or_default() += 1;
        }
        assert_eq!(counts.len(), 50);
        assert!(counts.values().all(|&c| c == 1));
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_backpressure_and_dropped_send_rolls_back() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter, 1, settings(1));

        svc.send(note("fills the queue")).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), svc.send(note("waits"))).await;
        assert!(blocked.is_err());

        let all = svc.list(&NotificationFilter::default());
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].body, "fills the queue");
        assert_eq!(svc.queue_depth(), 1);
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter, 16, settings(2));
        svc.start().unwrap();

        let a = svc.send(note("a")).await.unwrap().notification_id;
        let b = svc.send(note("b")).await.unwrap().notification_id;
        wait_for(&svc, &a, NotificationStatus::Sent).await;
        wait_for(&svc, &b, NotificationStatus::Sent).await;
        svc.shutdown().await;

        let sent = svc.list(&NotificationFilter {
            statuses: vec![NotificationStatus::Sent],
            ..Default::default()
        });
        assert_eq!(sent.len(), 2);

        let stats = svc.stats();
        assert_eq!(stats.total_sent, 2);
        assert_eq!(stats.by_type.get("debug"), Some(&2));
        assert!(stats.average_latency_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_shutdown_lifecycle() {
        let adapter = Arc::new(Scripted::default());
        let svc = service_with(adapter, 4, settings(2));
        assert!(svc.health_check().is_err());

        svc.start().unwrap();
        assert!(svc.health_check().is_ok());
        assert!(matches!(svc.start(), Err(HeraldError::InvalidState(_))));

        svc.shutdown().await;
        svc.shutdown().await;
        assert!(svc.health_check().is_err());
        assert!(matches!(svc.send(note("late")).await, Err(HeraldError::QueueClosed)));
        assert!(svc.start().is_err());
        assert!(svc.list(&NotificationFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = std::env::temp_dir().join(format!("herald-test-svc-{}", uuid::Uuid::new_v4()));
        let path = dir.join("queue.json");

        let first = {
            let mut registry = AdapterRegistry::new();
            registry.register("", Arc::new(Scripted::default())).unwrap();
            let queue = DispatchQueue::with_snapshot(8, &path).unwrap();
            let svc = DispatchService::new(Arc::new(registry), queue, settings(1), 3);
            svc.send(note("survivor")).await.unwrap().notification_id
        };

        let adapter = Arc::new(Scripted::default());
        let mut registry = AdapterRegistry::new();
        registry.register("", adapter.clone()).unwrap();
        let queue = DispatchQueue::with_snapshot(8, &path).unwrap();
        let svc = DispatchService::new(Arc::new(registry), queue, settings(1), 3);

        assert_eq!(svc.get(&first).unwrap().status, NotificationStatus::Queued);
        svc.start().unwrap();
        wait_for(&svc, &first, NotificationStatus::Sent).await;
        assert_eq!(adapter.calls(), 1);
        svc.shutdown().await;

        std::fs::remove_dir_all(&dir).ok();
    }
}
