//! # Transport Module
//!
//! The seam between the realtime layer and the vendor pub/sub service. A
//! transport multiplexes named channels over one shared connection and
//! reports two things back for every channel it opened: status changes
//! (`SUBSCRIBED`, `CHANNEL_ERROR`, `TIMED_OUT`, `CLOSED`) and row change
//! events.
//!
//! Reports travel through a [`ChannelSink`] into one unbounded queue that the
//! notification service drains on a single task, so all bookkeeping happens
//! in arrival order.
//!
//! ## Contained Modules:
//! - **`memory`**: An in-process transport driven by hand. Used by tests and
//!   local demos.
//! - **`phoenix`** (feature `phoenix`): Supabase Realtime over WebSocket,
//!   speaking the Phoenix channels protocol.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::channel::{ChannelIntent, ChannelName};
use crate::core::error::TransportError;

/// In-process transport for tests and demos.
pub mod memory;
/// Supabase Realtime transport.
#[cfg(feature = "phoenix")]
pub mod phoenix;

pub use memory::MemoryTransport;
#[cfg(feature = "phoenix")]
pub use phoenix::{PhoenixConfig, PhoenixTransport};

/// The four channel statuses a transport reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
            ChannelStatus::Closed => "CLOSED",
        };
        f.write_str(text)
    }
}

/// Kind of row change emitted by the backing data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// # Row Change
///
/// One change event from the data store. The realtime layer treats the
/// records as opaque JSON; typed decoding happens in the feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    #[serde(rename = "type")]
    pub event: ChangeKind,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    /// The row after the change (empty for deletes).
    #[serde(default)]
    pub record: Value,
    /// The row before the change, when the table publishes it.
    #[serde(default)]
    pub old_record: Option<Value>,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

fn default_schema() -> String {
    "public".to_string()
}

impl RowChange {
    /// An `UPDATE` of `public.<table>`.
    pub fn update(table: &str, record: Value, old_record: Option<Value>) -> Self {
        Self {
            event: ChangeKind::Update,
            schema: default_schema(),
            table: table.to_string(),
            record,
            old_record,
            commit_timestamp: None,
        }
    }

    /// An `INSERT` into `public.<table>`.
    pub fn insert(table: &str, record: Value) -> Self {
        Self {
            event: ChangeKind::Insert,
            schema: default_schema(),
            table: table.to_string(),
            record,
            old_record: None,
            commit_timestamp: None,
        }
    }
}

/// What a transport reported for a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    Status(ChannelStatus),
    Event(RowChange),
}

static SIGNAL_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Next value of the process-wide arrival clock. Signals are stamped with it
/// when the transport reports them and registrations when they are made, so
/// the two can be ordered.
pub fn next_sequence() -> u64 {
    SIGNAL_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// A report from the transport, tagged with the physical channel it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSignal {
    pub channel: ChannelName,
    pub generation: u64,
    /// Arrival stamp taken from [`next_sequence`] when the report was made.
    pub sequence: u64,
    pub kind: SignalKind,
}

/// # Channel Sink
///
/// Handed to the transport when a channel is opened; the transport pushes
/// status changes and events for that channel through it. Sending never
/// blocks and silently stops once the service has shut down.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    channel: ChannelName,
    generation: u64,
    tx: mpsc::UnboundedSender<ChannelSignal>,
}

impl ChannelSink {
    pub fn new(channel: ChannelName, generation: u64, tx: mpsc::UnboundedSender<ChannelSignal>) -> Self {
        Self { channel, generation, tx }
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports a status change.
    pub fn status(&self, status: ChannelStatus) {
        self.send(SignalKind::Status(status));
    }

    /// Reports a row change.
    pub fn event(&self, change: RowChange) {
        self.send(SignalKind::Event(change));
    }

    fn send(&self, kind: SignalKind) {
        let signal = ChannelSignal {
            channel: self.channel.clone(),
            generation: self.generation,
            sequence: next_sequence(),
            kind,
        };
        if self.tx.send(signal).is_err() {
            log::trace!("Signal for {} dropped, receiver is gone.", self.channel);
        }
    }
}

/// A channel opened on a transport.
pub trait TransportChannel: Send + Sync {
    /// Leaves the channel. Idempotent; no signal is reported afterwards.
    fn unsubscribe(&self);
}

/// # Realtime Transport
///
/// The vendor pub/sub connection. `open` must not block: it starts the join
/// and the transport later reports `SUBSCRIBED` (or a failure) through the
/// sink.
pub trait RealtimeTransport: Send + Sync {
    /// Establishes the shared connection. Completes once the transport can
    /// accept channels.
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Opens a channel for the given intent.
    fn open(&self, intent: &ChannelIntent, sink: ChannelSink) -> Result<Box<dyn TransportChannel>, TransportError>;

    /// Tears the shared connection down.
    fn disconnect(&self) -> BoxFuture<'_, ()>;
}
