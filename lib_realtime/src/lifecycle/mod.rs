//! # Lifecycle Module
//!
//! Binds a subscription to the lifetime of a consumer (a screen, a request
//! handler, a background job) so it cannot outlive it.

/// Mount/unmount adapter over the notification service.
pub mod adapter;

pub use adapter::{AdapterStats, LifecycleAdapter, MountStatus};
