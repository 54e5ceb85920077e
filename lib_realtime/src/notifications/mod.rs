//! # Notifications Module
//!
//! The application-facing side of the realtime layer.
//!
//! ## Contained Modules:
//! - **`models`**: Typed payloads (`CarStatusChange`, `AdminNotification`).
//! - **`feeds`**: The `Feed` trait binding a channel intent to a payload
//!   decoder, and the feeds the marketplace uses.
//! - **`service`**: `NotificationService`, which wires transport, pool,
//!   backoff and registry together and exposes the subscribe API.

/// Typed feed decoders.
pub mod feeds;
/// Payload types delivered to subscribers.
pub mod models;
/// The notification service.
pub mod service;

pub use feeds::{AdminNotificationFeed, CarStatusFeed, Feed, RawFeed};
pub use models::{AdminNotification, CarStatus, CarStatusChange};
pub use service::{NotificationService, Readiness, ServiceStats};
