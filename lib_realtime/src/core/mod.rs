//! # Core Engine Module
//!
//! This module forms the heart of the realtime notification layer. It
//! aggregates the components that decide which transport channels exist, who
//! listens to them and what happens when they fail.
//!
//! ## Core Components:
//!
//! - **`connection_manager`**: Owns the bounded pool of channel connections on
//!   the shared transport. It is the only component that opens or closes a
//!   transport channel, and it sweeps connections that are stuck or errored.
//!
//! - **`registry`**: The subscription manager. It deduplicates subscriptions by
//!   channel name, reference counts the callbacks and tears a channel down the
//!   moment its last subscriber leaves.
//!
//! - **`backoff`**: The reconnection controller. It drives each failed channel
//!   through a bounded number of exponentially spaced reconnect attempts.
//!
//! - **`dispatcher`**: The fan-out step. It delivers one inbound row change to
//!   every callback of a channel and isolates callbacks that panic.
//!
//! `channel` and `error` hold the shared vocabulary (names, intents, records
//! and the error taxonomy).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Per-channel retry bookkeeping with exponential backoff.
pub mod backoff;
/// Channel names, intents and connection records.
pub mod channel;
/// The bounded pool of transport channels.
pub mod connection_manager;
/// Snapshot fan-out with per-callback failure isolation.
pub mod dispatcher;
/// Error taxonomy of the realtime layer.
pub mod error;
/// Reference-counted subscription registry.
pub mod registry;

// --- Public API Re-exports ---
pub use backoff::{BackoffController, ChannelPhase, RetryPolicy, RetryState};
pub use channel::{ChannelIntent, ChannelName, ConnectionRecord, ConnectionState};
pub use connection_manager::{ConnectionEvent, ConnectionManager, PoolConfig, PoolStats};
pub use dispatcher::{DispatchReport, EventCallback};
pub use error::{RealtimeError, TransportError};
pub use registry::{ChannelDetail, RegistryStats, SubscriptionHandle, SubscriptionRegistry};
