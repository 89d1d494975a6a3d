//! # Herald Core
//!
//! Shared vocabulary for the Herald notification dispatcher: the notification
//! data model, the error type, the channel adapter capability, and the
//! configuration file layout.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::HeraldConfig;
pub use error::{HeraldError, Result};
pub use traits::ChannelAdapter;
pub use types::{
    ChannelType, ContentKind, DeliveryReport, Notification, NotificationFilter,
    NotificationStats, NotificationStatus, Priority, SendReceipt,
};
