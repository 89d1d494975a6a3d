//! Dispatch queue — bounded, in-process, at-least-once.
//!
//! Envelopes stay in the bookkeeping map from admission until `ack` or a
//! final `nack`, and hold their capacity slot for that whole time. A requeue
//! reuses the slot, so it never blocks on a full buffer.
//!
//! Optional snapshot: the full envelope map is written as a flat JSON object
//! (`{envelope_id: envelope}`) after every mutation and replayed on open.
//! Best effort only: a crash mid-write can lose or corrupt the file.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_core::{HeraldError, Notification, NotificationStatus, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};

/// Queue-internal wrapper around one notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Distinct from the notification id.
    pub envelope_id: String,
    pub notification: Notification,
    /// Number of times this envelope has been dequeued.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Envelope {
    fn wrap(mut notification: Notification) -> Self {
        notification.status = NotificationStatus::Queued;
        Self {
            envelope_id: uuid::Uuid::new_v4().to_string(),
            notification,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }
}

struct QueueState {
    /// Envelope ids waiting for a worker, FIFO.
    buffer: VecDeque<String>,
    /// Every unfinished envelope, buffered or in flight.
    envelopes: HashMap<String, Envelope>,
    in_flight: HashSet<String>,
    /// Slots owed because a snapshot replay exceeded capacity.
    slot_debt: usize,
    sealed: bool,
    closed: bool,
}

/// Bounded FIFO of delivery attempts shared by all workers.
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    slots: Semaphore,
    ready: Notify,
    capacity: usize,
    snapshot_path: Option<PathBuf>,
}

impl DispatchQueue {
    /// In-memory queue without a snapshot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                buffer: VecDeque::new(),
                envelopes: HashMap::new(),
                in_flight: HashSet::new(),
                slot_debt: 0,
                sealed: false,
                closed: false,
            }),
            slots: Semaphore::new(capacity),
            ready: Notify::new(),
            capacity,
            snapshot_path: None,
        }
    }

    /// Queue that snapshots to `path`, replaying whatever the file holds.
    pub fn with_snapshot(capacity: usize, path: &Path) -> Result<Self> {
        let mut queue = Self::new(capacity);
        queue.snapshot_path = Some(path.to_path_buf());

        let replayed = load_snapshot(path)?;
        if !replayed.is_empty() {
            let count = replayed.len();
            let state = queue.state.get_mut();
            for mut envelope in replayed {
                envelope.notification.status = NotificationStatus::Queued;
                state.buffer.push_back(envelope.envelope_id.clone());
                state.envelopes.insert(envelope.envelope_id.clone(), envelope);
            }
            let taken = count.min(queue.capacity);
            state.slot_debt = count - taken;
            queue.slots.forget_permits(taken);
            tracing::info!("♻️ Replayed {count} envelope(s) from {}", path.display());
        }
        Ok(queue)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit one notification, waiting while the buffer is full.
    ///
    /// Dropping the returned future before it resolves leaves the queue untouched.
    pub async fn enqueue(&self, notification: Notification) -> Result<String> {
        if self.is_sealed() {
            return Err(HeraldError::QueueClosed);
        }
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| HeraldError::QueueClosed)?;

        let envelope_id = {
            let mut state = self.state.lock();
            if state.sealed || state.closed {
                return Err(HeraldError::QueueClosed);
            }
            permit.forget();
            let envelope = Envelope::wrap(notification);
            let envelope_id = envelope.envelope_id.clone();
            tracing::debug!(
                "📥 Enqueue {} (notification {}, depth {})",
                envelope_id,
                envelope.notification.id,
                state.buffer.len() + 1
            );
            state.buffer.push_back(envelope_id.clone());
            state.envelopes.insert(envelope_id.clone(), envelope);
            self.persist(&state);
            envelope_id
        };
        self.ready.notify_one();
        Ok(envelope_id)
    }

    /// Admit several notifications in order. No cross-item atomicity: items
    /// admitted before a failure stay queued.
    pub async fn enqueue_batch(&self, notifications: Vec<Notification>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(notifications.len());
        for notification in notifications {
            ids.push(self.enqueue(notification).await?);
        }
        Ok(ids)
    }

    /// Take the next envelope, waiting up to `wait`.
    ///
    /// Returns `Timeout` when nothing arrived in time and `QueueClosed` once
    /// the queue is closed.
    pub async fn dequeue(&self, wait: Duration) -> Result<Envelope> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.try_take()? {
                return Ok(envelope);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(HeraldError::Timeout);
            }
        }
    }

    fn try_take(&self) -> Result<Option<Envelope>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HeraldError::QueueClosed);
        }
        while let Some(envelope_id) = state.buffer.pop_front() {
            let Some(envelope) = state.envelopes.get_mut(&envelope_id) else {
                continue;
            };
            envelope.attempt += 1;
            envelope.notification.status = NotificationStatus::Processing;
            let taken = envelope.clone();
            state.in_flight.insert(envelope_id);
            self.persist(&state);
            if !state.buffer.is_empty() {
                // notify_one keeps at most one stored permit; pass the wakeup on
                self.ready.notify_one();
            }
            return Ok(Some(taken));
        }
        Ok(None)
    }

    /// Delivery succeeded: forget the envelope and free its slot.
    pub fn ack(&self, envelope_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HeraldError::QueueClosed);
        }
        if !state.in_flight.remove(envelope_id) {
            return Err(HeraldError::UnknownEnvelope(envelope_id.to_string()));
        }
        state.envelopes.remove(envelope_id);
        self.release_slots(&mut state, 1);
        self.persist(&state);
        Ok(())
    }

    /// Delivery failed. `requeue` puts the same envelope at the back of the
    /// buffer; otherwise it is finalized as failed and forgotten.
    pub fn nack(&self, envelope_id: &str, requeue: bool) -> Result<()> {
        self.nack_with(envelope_id, requeue, None)
    }

    /// Like [`nack`](Self::nack), replacing the envelope's notification
    /// snapshot with `latest` so the snapshot file carries current retry state.
    pub fn nack_with(
        &self,
        envelope_id: &str,
        requeue: bool,
        latest: Option<Notification>,
    ) -> Result<()> {
        let requeued = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(HeraldError::QueueClosed);
            }
            if !state.in_flight.remove(envelope_id) {
                return Err(HeraldError::UnknownEnvelope(envelope_id.to_string()));
            }
            if requeue {
                if let Some(envelope) = state.envelopes.get_mut(envelope_id) {
                    if let Some(latest) = latest {
                        envelope.notification = latest;
                    }
                    envelope.notification.status = NotificationStatus::Retrying;
                }
                state.buffer.push_back(envelope_id.to_string());
            } else {
                state.envelopes.remove(envelope_id);
                self.release_slots(&mut state, 1);
            }
            self.persist(&state);
            requeue
        };
        if requeued {
            self.ready.notify_one();
        }
        Ok(())
    }

    /// Envelopes waiting in the buffer (in-flight ones excluded).
    pub fn size(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Envelopes handed to a worker and not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Drop every envelope, buffered and in flight.
    pub fn purge(&self) -> Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HeraldError::QueueClosed);
        }
        let dropped = state.envelopes.len();
        state.buffer.clear();
        state.envelopes.clear();
        state.in_flight.clear();
        self.release_slots(&mut state, dropped);
        self.persist(&state);
        tracing::info!("🧹 Purged {dropped} envelope(s)");
        Ok(dropped)
    }

    /// Drop buffered envelopes for one notification. In-flight envelopes
    /// are left to their worker.
    pub fn discard_notification(&self, notification_id: &str) -> Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HeraldError::QueueClosed);
        }
        let doomed: Vec<String> = state
            .buffer
            .iter()
            .filter(|id| {
                state
                    .envelopes
                    .get(*id)
                    .is_some_and(|e| e.notification.id == notification_id)
            })
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        state.buffer.retain(|id| !doomed.contains(id));
        for id in &doomed {
            state.envelopes.remove(id);
        }
        self.release_slots(&mut state, doomed.len());
        self.persist(&state);
        Ok(doomed.len())
    }

    /// Refuse new admissions. Acks, nacks and requeues of in-flight
    /// envelopes keep working so workers can finish.
    pub fn seal(&self) {
        let mut state = self.state.lock();
        if !state.sealed {
            state.sealed = true;
            self.slots.close();
            tracing::debug!("🔒 Queue sealed ({} buffered)", state.buffer.len());
        }
    }

    /// Shut the queue down. Every later operation fails with `QueueClosed`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.sealed = true;
            state.closed = true;
            self.slots.close();
            self.persist(&state);
        }
        self.ready.notify_waiters();
        tracing::info!("📪 Queue closed");
    }

    pub fn health_check(&self) -> Result<()> {
        let state = self.state.lock();
        if state.closed || state.sealed {
            return Err(HeraldError::QueueClosed);
        }
        Ok(())
    }

    fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    /// Copies of every unfinished notification, e.g. after a snapshot replay.
    pub fn pending_notifications(&self) -> Vec<Notification> {
        let state = self.state.lock();
        state
            .buffer
            .iter()
            .filter_map(|id| state.envelopes.get(id))
            .map(|envelope| envelope.notification.clone())
            .collect()
    }

    fn release_slots(&self, state: &mut QueueState, count: usize) {
        let repaid = count.min(state.slot_debt);
        state.slot_debt -= repaid;
        if count > repaid {
            self.slots.add_permits(count - repaid);
        }
    }

    fn persist(&self, state: &QueueState) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        if let Err(e) = write_snapshot(path, &state.envelopes) {
            tracing::warn!("⚠️ Failed to write queue snapshot {}: {e}", path.display());
        }
    }
}

fn write_snapshot(path: &Path, envelopes: &HashMap<String, Envelope>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec(envelopes)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Read a snapshot, oldest envelope first. A missing file is an empty queue.
fn load_snapshot(path: &Path) -> Result<Vec<Envelope>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read(path)?;
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let map: HashMap<String, Envelope> = serde_json::from_slice(&raw)?;
    let mut envelopes: Vec<Envelope> = map.into_values().collect();
    envelopes.sort_by_key(|e| e.enqueued_at);
    Ok(envelopes)
}
