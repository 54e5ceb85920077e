//! # Memory Transport
//!
//! A transport that lives entirely in process. Channels are acknowledged
//! automatically (or by hand with [`MemoryTransport::manual_ack`]) and events
//! or failures are injected by the test or demo driving it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{self, BoxFuture, FutureExt};

use crate::core::channel::{ChannelIntent, ChannelName};
use crate::core::error::TransportError;
use crate::transport::{ChannelSink, ChannelStatus, RealtimeTransport, RowChange, TransportChannel};

struct Slot {
    id: u64,
    intent: ChannelIntent,
    sink: ChannelSink,
}

#[derive(Default)]
struct MemoryState {
    channels: HashMap<ChannelName, Slot>,
    next_id: u64,
    opened: u64,
    connected: bool,
    fail_connect: Option<String>,
    reject_open: bool,
}

/// # Memory Transport
///
/// Cloning yields another handle to the same transport.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    auto_ack: bool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// A transport that acknowledges every join right away.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            auto_ack: true,
        }
    }

    /// A transport that leaves joins pending until [`MemoryTransport::ack`].
    pub fn manual_ack() -> Self {
        Self { auto_ack: false, ..Self::new() }
    }

    /// A transport whose `connect` always fails.
    pub fn failing(reason: &str) -> Self {
        let transport = Self::new();
        transport.lock().fail_connect = Some(reason.to_string());
        transport
    }

    /// Makes subsequent `open` calls fail (or succeed again).
    pub fn set_reject_open(&self, reject: bool) {
        self.lock().reject_open = reject;
    }

    /// Delivers a row change on the channel. Returns `false` when the channel
    /// is not open on this transport.
    pub fn emit(&self, channel: &ChannelName, change: RowChange) -> bool {
        match self.lock().channels.get(channel) {
            Some(slot) => {
                slot.sink.event(change);
                true
            }
            None => false,
        }
    }

    /// Reports a status for the channel, as the vendor service would.
    pub fn report(&self, channel: &ChannelName, status: ChannelStatus) -> bool {
        match self.lock().channels.get(channel) {
            Some(slot) => {
                slot.sink.status(status);
                true
            }
            None => false,
        }
    }

    /// Acknowledges a pending join.
    pub fn ack(&self, channel: &ChannelName) -> bool {
        self.report(channel, ChannelStatus::Subscribed)
    }

    /// Whether the channel is currently open on the transport.
    pub fn is_open(&self, channel: &ChannelName) -> bool {
        self.lock().channels.contains_key(channel)
    }

    /// Number of channels currently open.
    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Total number of `open` calls that succeeded.
    pub fn open_count(&self) -> u64 {
        self.lock().opened
    }

    /// The intent a channel was last opened with.
    pub fn intent_of(&self, channel: &ChannelName) -> Option<ChannelIntent> {
        self.lock().channels.get(channel).map(|slot| slot.intent.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RealtimeTransport for MemoryTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        let mut state = self.lock();
        let result = match &state.fail_connect {
            Some(reason) => Err(TransportError::Connect(reason.clone())),
            None => {
                state.connected = true;
                Ok(())
            }
        };
        future::ready(result).boxed()
    }

    fn open(&self, intent: &ChannelIntent, sink: ChannelSink) -> Result<Box<dyn TransportChannel>, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.reject_open {
            return Err(TransportError::Rejected(format!("open of {} refused", intent.channel_name())));
        }

        state.next_id += 1;
        state.opened += 1;
        let id = state.next_id;
        let channel = intent.channel_name();
        if self.auto_ack {
            sink.status(ChannelStatus::Subscribed);
        }
        state.channels.insert(channel.clone(), Slot { id, intent: intent.clone(), sink });

        Ok(Box::new(MemoryChannel {
            state: Arc::clone(&self.state),
            channel,
            id,
        }))
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        let mut state = self.lock();
        state.connected = false;
        state.channels.clear();
        future::ready(()).boxed()
    }
}

struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
    channel: ChannelName,
    id: u64,
}

impl TransportChannel for MemoryChannel {
    fn unsubscribe(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer channel under the same name is not ours to close.
        if state.channels.get(&self.channel).map(|slot| slot.id) == Some(self.id) {
            state.channels.remove(&self.channel);
        }
    }
}
