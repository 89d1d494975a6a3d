//! # Herald Dispatch
//!
//! The dispatcher core: a bounded in-process queue with at-least-once
//! hand-off, the notification store, the adapter registry, and the worker
//! pool that turns queued envelopes into delivery attempts.
//!
//! ```text
//! send ─▶ validate ─▶ store(pending) ─▶ queue ─▶ worker ─▶ adapter
//!                                         ▲          │
//!                                         └─ requeue ┘ (retry budget left)
//! ```

pub mod backoff;
pub mod queue;
pub mod registry;
pub mod service;
pub mod store;
pub mod worker;

pub use backoff::{BackoffStrategy, RetryPolicy};
pub use queue::{DispatchQueue, Envelope};
pub use registry::AdapterRegistry;
pub use service::DispatchService;
pub use store::NotificationStore;
pub use worker::{WorkerPool, WorkerSettings};
