//! Worker pool — N identical loops pulling envelopes and driving adapters.

use std::sync::Arc;
use std::time::Duration;

use herald_core::config::QueueConfig;
use herald_core::{DeliveryReport, HeraldError, Notification, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryPolicy;
use crate::queue::{DispatchQueue, Envelope};
use crate::registry::AdapterRegistry;
use crate::store::{FailureOutcome, NotificationStore};

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_count: usize,
    /// How long one dequeue waits before re-checking for shutdown.
    pub dequeue_timeout: Duration,
    /// Upper bound on a single adapter call.
    pub delivery_timeout: Duration,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &QueueConfig) -> Result<Self> {
        Ok(Self {
            worker_count: config.worker_count.max(1),
            dequeue_timeout: Duration::from_secs(config.dequeue_timeout_secs.max(1)),
            delivery_timeout: Duration::from_secs(config.delivery_timeout_secs.max(1)),
            retry: RetryPolicy::from_config(&config.retry)?,
        })
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_count: 5,
            dequeue_timeout: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared handles every worker needs.
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub queue: Arc<DispatchQueue>,
    pub store: Arc<NotificationStore>,
    pub registry: Arc<AdapterRegistry>,
}

/// Running workers.
pub struct WorkerPool {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn start(context: DispatchContext, settings: WorkerSettings) -> Self {
        let token = CancellationToken::new();
        let settings = Arc::new(settings);
        let handles = (0..settings.worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    context: context.clone(),
                    settings: settings.clone(),
                    token: token.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect::<Vec<_>>();
        tracing::info!("👷 Started {} dispatch worker(s)", handles.len());
        Self { token, handles }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker and wait for each to finish its current envelope.
    pub async fn stop(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker task ended abnormally: {e}");
            }
        }
        tracing::info!("👷 Dispatch workers stopped");
    }
}

struct Worker {
    id: usize,
    context: DispatchContext,
    settings: Arc<WorkerSettings>,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        tracing::debug!("Worker {} started", self.id);
        loop {
            let next = tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                next = self.context.queue.dequeue(self.settings.dequeue_timeout) => next,
            };
            match next {
                Ok(envelope) => self.process(envelope).await,
                Err(HeraldError::Timeout) => continue,
                Err(e) if e.is_queue_fault() => {
                    tracing::debug!("Worker {} leaving: {e}", self.id);
                    break;
                }
                Err(e) => tracing::warn!("⚠️ Worker {} dequeue failed: {e}", self.id),
            }
        }
        tracing::debug!("Worker {} stopped", self.id);
    }

    async fn process(&self, envelope: Envelope) {
        let Envelope {
            envelope_id,
            notification: snapshot,
            attempt,
            ..
        } = envelope;
        let store = &self.context.store;
        let queue = &self.context.queue;

        let Some(notification) = store.begin_attempt(&snapshot) else {
            tracing::debug!("Skipping {} (terminal or held by another attempt)", snapshot.id);
            self.settle(&envelope_id, queue.ack(&envelope_id));
            return;
        };

        let adapter = match self
            .context
            .registry
            .resolve(notification.channel_type, &notification.account)
        {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::error!("❌ {} has no adapter: {e}", notification.id);
                store.mark_failed(&notification.id, &e.to_string());
                self.settle(&envelope_id, queue.nack(&envelope_id, false));
                return;
            }
        };

        tracing::debug!(
            "📤 Worker {} delivering {} via {} (attempt {attempt})",
            self.id,
            notification.id,
            notification.channel_type
        );

        match self.deliver(adapter, &notification).await {
            Ok(report) => {
                store.record_success(&notification.id, &report);
                tracing::info!(
                    "✅ Delivered {} via {}: {}",
                    notification.id,
                    notification.channel_type,
                    report.message
                );
                self.settle(&envelope_id, queue.ack(&envelope_id));
            }
            Err(error) => match store.record_failure(&notification.id, &error) {
                FailureOutcome::Retry(updated) => {
                    let delay = self.settings.retry.delay_for(updated.retry_count);
                    tracing::warn!(
                        "🔁 Delivery of {} failed ({error}), retry {}/{} in {delay:?}",
                        updated.id,
                        updated.retry_count,
                        updated.max_retries
                    );
                    if !delay.is_zero() {
                        tokio::select! {
                            () = self.token.cancelled() => {}
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    store.end_attempt(&notification.id);
                    self.settle(&envelope_id, queue.nack_with(&envelope_id, true, Some(updated)));
                }
                FailureOutcome::Finalized => {
                    tracing::error!("❌ Delivery of {} failed for good: {error}", notification.id);
                    self.settle(&envelope_id, queue.nack(&envelope_id, false));
                }
            },
        }
    }

    /// One adapter call on its own task, bounded by the delivery timeout.
    /// A panicking adapter surfaces as a failed attempt.
    async fn deliver(
        &self,
        adapter: Arc<dyn herald_core::ChannelAdapter>,
        notification: &Notification,
    ) -> std::result::Result<DeliveryReport, String> {
        let owned = notification.clone();
        let mut task = tokio::spawn(async move { adapter.deliver(&owned).await });

        match tokio::time::timeout(self.settings.delivery_timeout, &mut task).await {
            Ok(Ok(Ok(report))) if report.success => Ok(report),
            Ok(Ok(Ok(report))) => Err(report
                .error
                .unwrap_or_else(|| "delivery rejected by channel".into())),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join_error)) => Err(format!("adapter task failed: {join_error}")),
            Err(_) => {
                task.abort();
                Err(format!(
                    "delivery timed out after {:?}",
                    self.settings.delivery_timeout
                ))
            }
        }
    }

    fn settle(&self, envelope_id: &str, result: Result<()>) {
        if let Err(e) = result {
            tracing::warn!("⚠️ Worker {} could not settle envelope {envelope_id}: {e}", self.id);
        }
    }
}
