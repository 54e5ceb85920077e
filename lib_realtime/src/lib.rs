//! # lib_realtime
//!
//! Realtime notification and connection management for the REBIL marketplace.
//! A single shared realtime transport is multiplexed into named channels, each
//! channel is fanned out to any number of in-process subscribers, and failed
//! channels are rebuilt with bounded exponential backoff.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

// Declare the modules to re-export
pub mod configs;
pub mod core;
pub mod lifecycle;
pub mod notifications;
pub mod transport;

// Re-export the types most callers need
pub use configs::config_realtime::{ConfigError, RealtimeConfig};
pub use self::core::channel::{ChannelIntent, ChannelName, ConnectionRecord, ConnectionState};
pub use self::core::error::{RealtimeError, TransportError};
pub use self::core::registry::SubscriptionHandle;
pub use lifecycle::adapter::{LifecycleAdapter, MountStatus};
pub use notifications::models::{AdminNotification, CarStatus, CarStatusChange};
pub use notifications::service::{NotificationService, Readiness, ServiceStats};
pub use transport::{ChangeKind, ChannelStatus, RealtimeTransport, RowChange};
