//! Herald error types.

/// Every failure the dispatch core can report.
#[derive(Debug, thiserror::Error)]
pub enum HeraldError {
    /// Malformed notification. Never retried, never queued.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No adapter registered for the requested channel type / account.
    #[error("Unsupported channel: {0}")]
    UnsupportedChannel(String),

    #[error("Adapter already registered: {0}")]
    DuplicateRegistration(String),

    /// Adapter-reported delivery failure.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Transport-level failure inside a channel adapter.
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Queue is closed")]
    QueueClosed,

    #[error("Unknown envelope: {0}")]
    UnknownEnvelope(String),

    #[error("Timed out waiting for the queue")]
    Timeout,

    #[error("Notification not found: {0}")]
    NotFound(String),

    /// Operation not legal in the notification's current status.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HeraldError {
    /// The queue can no longer serve the caller: it is closed, or the
    /// envelope being settled is gone.
    pub fn is_queue_fault(&self) -> bool {
        matches!(self, Self::QueueClosed | Self::UnknownEnvelope(_))
    }
}

pub type Result<T> = std::result::Result<T, HeraldError>;
