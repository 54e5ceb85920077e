//! # Subscription Registry
//!
//! Deduplicates subscription intent by channel name and reference counts the
//! callbacks of every channel:
//!
//! - the first subscriber of a name acquires a connection and arms the
//!   backoff controller;
//! - later subscribers join the existing entry, including while the channel
//!   is connecting or backing off;
//! - the last unsubscribe tears the entry down and releases the connection
//!   while still holding the registry lock, so a concurrent subscribe sees
//!   either the live entry or nothing at all.
//!
//! Transport signals enter through [`SubscriptionRegistry::handle_signal`].
//! Connection-level failures are never retried here; they are handed to the
//! backoff controller, whose timer calls back into the registry to rebuild the
//! channel from its stored intent with the callback set left as it was.
//!
//! Lock order is registry, then backoff, then pool. Callbacks never run under
//! a lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::backoff::{BackoffController, BackoffDecision, ChannelPhase};
use crate::core::channel::{ChannelIntent, ChannelName, ConnectionState};
use crate::core::connection_manager::ConnectionManager;
use crate::core::dispatcher::{self, EventCallback};
use crate::core::error::RealtimeError;
use crate::transport::{self, ChannelSignal, ChannelSink, ChannelStatus, SignalKind};

struct Registration {
    id: u64,
    /// Arrival stamp at registration; only signals stamped later reach it.
    since: u64,
    callback: EventCallback,
}

struct SubscriptionEntry {
    intent: ChannelIntent,
    callbacks: Vec<Registration>,
    is_active: bool,
    /// Generation of the physical channel currently serving this entry.
    generation: u64,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<ChannelName, SubscriptionEntry>,
    next_generation: u64,
    next_callback_id: u64,
    shut_down: bool,
}

impl RegistryState {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn callback_id(&mut self) -> u64 {
        self.next_callback_id += 1;
        self.next_callback_id
    }
}

struct RegistryShared {
    state: Mutex<RegistryState>,
    connections: ConnectionManager,
    backoff: BackoffController,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    callback_failures: AtomicU64,
    events_dispatched: AtomicU64,
}

/// Subscription counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Channels with at least one subscriber.
    pub active_subscriptions: usize,
    /// Subscriber registrations across all channels.
    pub total_subscriptions: usize,
    pub callback_failures: u64,
    pub events_dispatched: u64,
}

/// Per-channel view for debugging surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelDetail {
    pub channel: ChannelName,
    pub subscribers: usize,
    pub is_active: bool,
    pub phase: ChannelPhase,
    pub attempts: u32,
    pub next_delay_ms: Option<u64>,
    pub connection: Option<ConnectionState>,
}

/// # Subscription Registry
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    shared: Arc<RegistryShared>,
}

impl SubscriptionRegistry {
    /// Builds a registry over the given pool and controller. The returned
    /// receiver carries every transport signal and must be drained into
    /// [`SubscriptionRegistry::handle_signal`].
    pub fn new(
        connections: ConnectionManager,
        backoff: BackoffController,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let shared = RegistryShared {
            state: Mutex::new(RegistryState::default()),
            connections,
            backoff,
            signals,
            callback_failures: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
        };
        (Self { shared: Arc::new(shared) }, rx)
    }

    /// # Subscribe
    ///
    /// Registers `callback` on the intent's channel, opening the channel when
    /// it is the first subscriber. Registering the same callback `Arc` twice
    /// on one channel does not add a second registration.
    pub fn subscribe(&self, intent: ChannelIntent, callback: EventCallback) -> Result<SubscriptionHandle, RealtimeError> {
        let shared = &self.shared;
        let name = intent.channel_name();
        let mut guard = shared.lock();
        let state = &mut *guard;

        if state.shut_down {
            return Err(RealtimeError::ShutDown);
        }

        let id = state.callback_id();
        let since = transport::next_sequence();
        if let Some(entry) = state.entries.get_mut(&name) {
            if entry.is_active {
                if let Some(existing) = entry.callbacks.iter().find(|r| Arc::ptr_eq(&r.callback, &callback)) {
                    return Ok(SubscriptionHandle::bound(shared, name, existing.id));
                }
                entry.callbacks.push(Registration { id, since, callback });
                if shared.backoff.phase(&name) == ChannelPhase::Failed {
                    log::warn!("Subscriber joined channel {} which has given up reconnecting.", name);
                }
                log::debug!("Channel {} now has {} subscriber(s).", name, entry.callbacks.len());
                return Ok(SubscriptionHandle::bound(shared, name, id));
            }
        }

        let generation = state.generation();
        let sink = ChannelSink::new(name.clone(), generation, shared.signals.clone());
        let record = shared.connections.acquire(&intent, sink)?;
        shared.backoff.arm(&name);

        state.entries.insert(
            name.clone(),
            SubscriptionEntry {
                intent,
                callbacks: vec![Registration { id, since, callback }],
                is_active: true,
                generation: record.generation,
            },
        );
        log::info!("Subscribed to channel {}.", name);
        Ok(SubscriptionHandle::bound(shared, name, id))
    }

    /// Processes one transport signal: status changes drive the pool and the
    /// backoff controller, events are fanned out to a snapshot of the
    /// callbacks that were registered when the event arrived.
    pub fn handle_signal(&self, signal: ChannelSignal) {
        let ChannelSignal {
            channel,
            generation,
            sequence,
            kind,
        } = signal;
        match kind {
            SignalKind::Status(status) => self.shared.on_status(&channel, generation, status),
            SignalKind::Event(change) => {
                let callbacks: Vec<EventCallback> = {
                    let state = self.shared.lock();
                    match state.entries.get(&channel) {
                        Some(entry) if entry.is_active && entry.generation == generation => {
                            self.shared.connections.touch(&channel, generation);
                            entry
                                .callbacks
                                .iter()
                                .filter(|r| r.since < sequence)
                                .map(|r| Arc::clone(&r.callback))
                                .collect()
                        }
                        _ => {
                            log::trace!("Dropping event for inactive channel {}.", channel);
                            return;
                        }
                    }
                };

                let report = dispatcher::fan_out(&channel, &callbacks, &change);
                self.shared.events_dispatched.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .callback_failures
                    .fetch_add(report.failed as u64, Ordering::Relaxed);
            }
        }
    }

    /// Runs one health sweep of the pool. Swept channels that still have
    /// subscribers are treated as failed and handed to backoff.
    pub fn run_health_sweep(&self) -> usize {
        let state = self.shared.lock();
        let swept = self.shared.connections.health_sweep();
        for record in &swept {
            if let Some(entry) = state.entries.get(&record.channel) {
                if entry.is_active && entry.generation == record.generation {
                    self.shared.fail_channel(&record.channel, record.generation);
                }
            }
        }
        swept.len()
    }

    /// # Reconnect
    ///
    /// Restarts a channel that is `Failed` (or waiting in `Backoff`) right
    /// away, with a fresh retry budget. Channels that are connecting or open
    /// are left alone.
    pub fn reconnect(&self, channel: &ChannelName) -> Result<(), RealtimeError> {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(RealtimeError::ShutDown);
        }

        let generation = state.generation();
        let entry = state
            .entries
            .get_mut(channel)
            .ok_or_else(|| RealtimeError::UnknownChannel(channel.clone()))?;

        match shared.backoff.phase(channel) {
            ChannelPhase::Failed | ChannelPhase::Backoff => {}
            _ => return Ok(()),
        }

        shared.backoff.reset(channel);
        let sink = ChannelSink::new(channel.clone(), generation, shared.signals.clone());
        match shared.connections.acquire(&entry.intent, sink) {
            Ok(record) => {
                entry.generation = record.generation;
                log::info!("Manual reconnect of channel {} started.", channel);
                Ok(())
            }
            Err(e) => {
                shared.backoff.mark_failed(channel);
                log::error!("Manual reconnect of channel {} failed: {}", channel, e);
                Err(e)
            }
        }
    }

    /// Reconnects every `Failed` channel. Returns how many were restarted.
    pub fn reconnect_failed(&self) -> usize {
        self.shared
            .backoff
            .failed_channels()
            .iter()
            .filter(|channel| self.reconnect(channel).is_ok())
            .count()
    }

    /// Drops every subscription, releases every connection and cancels every
    /// retry timer. Later subscribes fail with `ShutDown`.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        state.shut_down = true;
        for (name, mut entry) in state.entries.drain() {
            entry.is_active = false;
            self.shared.backoff.release(&name);
        }
        let released = self.shared.connections.release_all();
        self.shared.backoff.shutdown();
        log::info!("Registry shut down, {} connection(s) released.", released);
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.shared.lock();
        RegistryStats {
            active_subscriptions: state.entries.values().filter(|e| e.is_active).count(),
            total_subscriptions: state.entries.values().map(|e| e.callbacks.len()).sum(),
            callback_failures: self.shared.callback_failures.load(Ordering::Relaxed),
            events_dispatched: self.shared.events_dispatched.load(Ordering::Relaxed),
        }
    }

    /// Details of every channel with subscribers, ordered by name.
    pub fn channel_details(&self) -> Vec<ChannelDetail> {
        let state = self.shared.lock();
        let mut details: Vec<ChannelDetail> = state
            .entries
            .iter()
            .map(|(name, entry)| {
                let retry = self.shared.backoff.state(name);
                ChannelDetail {
                    channel: name.clone(),
                    subscribers: entry.callbacks.len(),
                    is_active: entry.is_active,
                    phase: retry.as_ref().map_or(ChannelPhase::Closed, |r| r.phase),
                    attempts: retry.as_ref().map_or(0, |r| r.attempts),
                    next_delay_ms: retry
                        .as_ref()
                        .and_then(|r| r.next_delay)
                        .map(|d| d.as_millis() as u64),
                    connection: self.shared.connections.record(name).map(|r| r.state),
                }
            })
            .collect();
        details.sort_by(|a, b| a.channel.cmp(&b.channel));
        details
    }

    pub fn subscriber_count(&self, channel: &ChannelName) -> usize {
        self.shared
            .lock()
            .entries
            .get(channel)
            .map_or(0, |entry| entry.callbacks.len())
    }

    pub fn phase(&self, channel: &ChannelName) -> ChannelPhase {
        self.shared.backoff.phase(channel)
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.shared.connections
    }

    pub fn backoff(&self) -> &BackoffController {
        &self.shared.backoff
    }
}

impl RegistryShared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, channel: &ChannelName, id: u64) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(channel) else {
            return;
        };

        let before = entry.callbacks.len();
        entry.callbacks.retain(|r| r.id != id);
        if entry.callbacks.len() == before {
            return;
        }

        if entry.callbacks.is_empty() {
            entry.is_active = false;
            state.entries.remove(channel);
            self.backoff.release(channel);
            self.connections.release(channel);
            log::info!("Last subscriber left channel {}, torn down.", channel);
        }
    }

    fn on_status(self: &Arc<Self>, channel: &ChannelName, generation: u64, status: ChannelStatus) {
        let state = self.lock();
        match state.entries.get(channel) {
            Some(entry) if entry.is_active && entry.generation == generation => {}
            _ => {
                log::debug!("Ignoring stale {} for channel {} (generation {}).", status, channel, generation);
                return;
            }
        }

        match status {
            ChannelStatus::Subscribed => {
                // Acknowledgements only count for a channel still connecting.
                if !self.connections.mark_open(channel, generation) {
                    log::debug!("Ignoring late {} for channel {} (generation {}).", status, channel, generation);
                    return;
                }
                match self.backoff.on_open(channel) {
                    Some(attempts) if attempts > 0 => {
                        log::info!("Channel {} recovered after {} attempt(s).", channel, attempts)
                    }
                    _ => log::info!("Channel {} is open.", channel),
                }
            }
            ChannelStatus::ChannelError | ChannelStatus::TimedOut | ChannelStatus::Closed => {
                if !self.connections.is_live(channel, generation) {
                    log::debug!("Channel {} already failed, ignoring {}.", channel, status);
                    return;
                }
                log::warn!("Channel {} reported {}.", channel, status);
                self.fail_channel(channel, generation);
            }
        }
    }

    /// Marks the connection errored and lets the backoff controller decide.
    /// Must be called with the registry lock held.
    fn fail_channel(self: &Arc<Self>, channel: &ChannelName, generation: u64) {
        self.connections.mark_error(channel, generation);

        let weak = Arc::downgrade(self);
        let target = channel.clone();
        let decision = self.backoff.on_failure(channel, move |ticket| {
            if let Some(shared) = weak.upgrade() {
                shared.retry(&target, ticket);
            }
        });

        match decision {
            BackoffDecision::Scheduled(delay) => {
                log::warn!("Reconnecting channel {} in {} ms.", channel, delay.as_millis())
            }
            BackoffDecision::AlreadyPending => log::debug!("Retry for channel {} already pending.", channel),
            BackoffDecision::Exhausted => {
                self.connections.release(channel);
                log::error!(
                    "Channel {} exhausted its reconnect attempts; an explicit reconnect is required.",
                    channel
                );
            }
            BackoffDecision::Untracked => {}
        }
    }

    /// Timer callback: rebuild the channel from its intent.
    fn retry(self: &Arc<Self>, channel: &ChannelName, ticket: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.shut_down {
            return;
        }
        let generation = state.generation();
        let Some(entry) = state.entries.get_mut(channel) else {
            return;
        };
        if !entry.is_active || !self.backoff.begin_attempt(channel, ticket) {
            return;
        }

        let sink = ChannelSink::new(channel.clone(), generation, self.signals.clone());
        match self.connections.acquire(&entry.intent, sink) {
            Ok(record) => {
                entry.generation = record.generation;
                log::info!("Reopening channel {} (generation {}).", channel, record.generation);
            }
            Err(e) => {
                log::warn!("Reopening channel {} failed: {}", channel, e);
                entry.generation = generation;
                self.fail_channel(channel, generation);
            }
        }
    }
}

/// # Subscription Handle
///
/// One subscriber's registration. `unsubscribe` is idempotent, and dropping
/// the handle unsubscribes.
#[must_use = "dropping a SubscriptionHandle unsubscribes immediately"]
pub struct SubscriptionHandle {
    binding: Option<Binding>,
}

struct Binding {
    registry: Weak<RegistryShared>,
    channel: ChannelName,
    id: u64,
    released: AtomicBool,
}

impl SubscriptionHandle {
    fn bound(shared: &Arc<RegistryShared>, channel: ChannelName, id: u64) -> Self {
        Self {
            binding: Some(Binding {
                registry: Arc::downgrade(shared),
                channel,
                id,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// A handle bound to nothing. Unsubscribing it does nothing.
    pub fn inert() -> Self {
        Self { binding: None }
    }

    pub fn channel(&self) -> Option<&ChannelName> {
        self.binding.as_ref().map(|b| &b.channel)
    }

    /// `true` until the handle unsubscribes; always `false` for inert handles.
    pub fn is_active(&self) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|b| !b.released.load(Ordering::Acquire))
    }

    pub fn unsubscribe(&self) {
        let Some(binding) = &self.binding else {
            return;
        };
        if binding.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = binding.registry.upgrade() {
            shared.unsubscribe(&binding.channel, binding.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("channel", &self.channel())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backoff::RetryPolicy;
    use crate::core::connection_manager::PoolConfig;
    use crate::transport::{MemoryTransport, RealtimeTransport, RowChange};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Harness {
        transport: MemoryTransport,
        registry: SubscriptionRegistry,
        rx: mpsc::UnboundedReceiver<ChannelSignal>,
    }

    impl Harness {
        async fn new(transport: MemoryTransport, max_connections: usize) -> Self {
            transport.connect().await.unwrap();
            let pool = PoolConfig { max_connections, ..PoolConfig::default() };
            let connections = ConnectionManager::new(Arc::new(transport.clone()), pool);
            let backoff = BackoffController::new(RetryPolicy::default());
            let (registry, rx) = SubscriptionRegistry::new(connections, backoff);
            Self { transport, registry, rx }
        }

        /// Drains every queued signal into the registry.
        fn pump(&mut self) {
            while let Ok(signal) = self.rx.try_recv() {
                self.registry.handle_signal(signal);
            }
        }
    }

    fn counter() -> (Arc<AtomicUsize>, EventCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&hits);
        let callback: EventCallback = Arc::new(move |_: &RowChange| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (hits, callback)
    }

    fn status_change() -> RowChange {
        RowChange::update(
            "cars",
            json!({"id": "car1", "status": "ACTIVE"}),
            Some(json!({"id": "car1", "status": "PENDING_APPROVAL"})),
        )
    }

    fn cars() -> ChannelName {
        ChannelName::from("car_status_changes")
    }

    #[tokio::test]
    async fn test_no_duplicate_connections() {
        let mut h = Harness::new(MemoryTransport::new(), 5).await;
        let handles: Vec<SubscriptionHandle> = (0..10)
            .map(|_| h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap())
            .collect();
        h.pump();

        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.registry.connections().len(), 1);
        assert_eq!(h.registry.subscriber_count(&cars()), 10);
        assert_eq!(h.registry.stats().active_subscriptions, 1);
        drop(handles);
        assert!(h.registry.connections().is_empty());
    }

    #[tokio::test]
    async fn test_reference_counting() {
        let mut h = Harness::new(MemoryTransport::new(), 5).await;
        let mut handles: Vec<SubscriptionHandle> = (0..4)
            .map(|_| h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap())
            .collect();
        h.pump();

        let last = handles.pop().unwrap();
        for handle in &handles {
            handle.unsubscribe();
        }
        assert!(h.transport.is_open(&cars()));
        assert_eq!(h.registry.connections().len(), 1);

        last.unsubscribe();
        assert!(!h.transport.is_open(&cars()));
        assert!(h.registry.connections().is_empty());
        assert_eq!(h.registry.stats(), RegistryStats::default());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let h = Harness::new(MemoryTransport::new(), 5).await;
        let a = h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap();
        let _b = h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap();

        a.unsubscribe();
        a.unsubscribe();
        assert!(!a.is_active());
        assert_eq!(h.registry.subscriber_count(&cars()), 1);
        assert!(h.transport.is_open(&cars()));
    }

    #[tokio::test]
    async fn test_same_callback_registers_once() {
        let h = Harness::new(MemoryTransport::new(), 5).await;
        let (_, callback) = counter();
        let first = h.registry.subscribe(ChannelIntent::CarStatusChanges, Arc::clone(&callback)).unwrap();
        let second = h.registry.subscribe(ChannelIntent::CarStatusChanges, callback).unwrap();

        assert_eq!(h.registry.subscriber_count(&cars()), 1);
        second.unsubscribe();
        first.unsubscribe();
        assert!(h.registry.connections().is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_and_partial_unsubscribe() {
        let mut h = Harness::new(MemoryTransport::new(), 5).await;
        let (hits_a, cb_a) = counter();
        let (hits_b, cb_b) = counter();
        let a = h.registry.subscribe(ChannelIntent::CarStatusChanges, cb_a).unwrap();
        let b = h.registry.subscribe(ChannelIntent::CarStatusChanges, cb_b).unwrap();
        h.pump();
        assert_eq!(h.registry.connections().record(&cars()).unwrap().state, ConnectionState::Open);

        h.transport.emit(&cars(), status_change());
        h.pump();
        assert_eq!((hits_a.load(Ordering::SeqCst), hits_b.load(Ordering::SeqCst)), (1, 1));

        b.unsubscribe();
        h.transport.emit(&cars(), status_change());
        h.pump();
        assert_eq!((hits_a.load(Ordering::SeqCst), hits_b.load(Ordering::SeqCst)), (2, 1));

        a.unsubscribe();
        assert_eq!(h.registry.connections().len(), 0);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_scenario() {
        let h = Harness::new(MemoryTransport::new(), 1).await;
        let x = h.registry.subscribe(ChannelIntent::custom("X", "cars"), counter().1).unwrap();

        let err = h.registry.subscribe(ChannelIntent::custom("Y", "cars"), counter().1).unwrap_err();
        assert!(matches!(err, RealtimeError::PoolExhausted { max: 1, .. }));

        x.unsubscribe();
        assert_eq!(h.registry.connections().len(), 0);
        let _y = h.registry.subscribe(ChannelIntent::custom("Y", "cars"), counter().1).unwrap();
        assert_eq!(h.registry.connections().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_preserves_callbacks() {
        let mut h = Harness::new(MemoryTransport::new(), 5).await;
        let (hits, callback) = counter();
        let _handle = h.registry.subscribe(ChannelIntent::CarStatusChanges, callback).unwrap();
        h.pump();

        h.transport.report(&cars(), ChannelStatus::ChannelError);
        h.pump();
        assert_eq!(h.registry.phase(&cars()), ChannelPhase::Backoff);
        assert_eq!(h.registry.connections().record(&cars()).unwrap().state, ConnectionState::Error);
        assert!(!h.transport.is_open(&cars()));

        tokio::time::sleep(Duration::from_millis(1001)).await;
        h.pump();
        assert_eq!(h.transport.open_count(), 2);
        assert_eq!(h.registry.phase(&cars()), ChannelPhase::Open);
        assert_eq!(h.registry.backoff().state(&cars()).unwrap().attempts, 0);
        assert_eq!(h.registry.backoff().reconnect_attempts(), 1);

        h.transport.emit(&cars(), status_change());
        h.pump();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_during_backoff_attaches() {
        let mut h = Harness::new(MemoryTransport::new(), 5).await;
        let _a = h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap();
        h.pump();
        h.transport.report(&cars(), ChannelStatus::TimedOut);
        h.pump();

        let _b = h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap();
        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.registry.subscriber_count(&cars()), 2);
        assert_eq!(h.registry.phase(&cars()), ChannelPhase::Backoff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_during_backoff_cancels_retry() {
        let mut h = Harness::new(MemoryTransport::new(), 5).await;
        let handle = h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap();
        h.pump();
        h.transport.report(&cars(), ChannelStatus::ChannelError);
        h.pump();

        handle.unsubscribe();
        tokio::time::sleep(Duration::from_secs(60)).await;
        h.pump();
        assert_eq!(h.transport.open_count(), 1);
        assert!(h.registry.connections().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_then_manual_reconnect() {
        let mut h = Harness::new(MemoryTransport::manual_ack(), 5).await;
        let _handle = h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap();

        // Every join fails: initial open plus three retries.
        for _ in 0..4 {
            h.transport.report(&cars(), ChannelStatus::ChannelError);
            h.pump();
            tokio::time::sleep(Duration::from_secs(31)).await;
        }

        assert_eq!(h.registry.phase(&cars()), ChannelPhase::Failed);
        assert_eq!(h.transport.open_count(), 4);
        assert!(h.registry.connections().is_empty());
        assert_eq!(h.registry.subscriber_count(&cars()), 1);

        assert_eq!(h.registry.reconnect_failed(), 1);
        assert_eq!(h.registry.phase(&cars()), ChannelPhase::Connecting);
        h.transport.ack(&cars());
        h.pump();
        assert_eq!(h.registry.phase(&cars()), ChannelPhase::Open);
    }

    #[tokio::test]
    async fn test_reconnect_unknown_channel() {
        let h = Harness::new(MemoryTransport::new(), 5).await;
        let err = h.registry.reconnect(&ChannelName::from("nope")).unwrap_err();
        assert_eq!(err, RealtimeError::UnknownChannel(ChannelName::from("nope")));
    }

    #[tokio::test]
    async fn test_callback_may_unsubscribe_itself() {
        let mut h = Harness::new(MemoryTransport::new(), 5).await;
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let callback: EventCallback = Arc::new(move |_: &RowChange| {
            if let Some(handle) = inner.lock().unwrap().take() {
                handle.unsubscribe();
            }
        });
        let handle = h.registry.subscribe(ChannelIntent::CarStatusChanges, callback).unwrap();
        *slot.lock().unwrap() = Some(handle);
        h.pump();

        h.transport.emit(&cars(), status_change());
        h.pump();
        assert!(h.registry.connections().is_empty());
    }

    #[tokio::test]
    async fn test_stale_generation_signal_is_ignored() {
        let mut h = Harness::new(MemoryTransport::manual_ack(), 5).await;
        let _handle = h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap();

        h.registry.handle_signal(ChannelSignal {
            channel: cars(),
            generation: 999,
            sequence: transport::next_sequence(),
            kind: SignalKind::Status(ChannelStatus::ChannelError),
        });
        h.pump();
        assert_eq!(h.registry.phase(&cars()), ChannelPhase::Connecting);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_in_flight_event() {
        let mut h = Harness::new(MemoryTransport::new(), 5).await;
        let (hits_a, cb_a) = counter();
        let (hits_b, cb_b) = counter();
        let _a = h.registry.subscribe(ChannelIntent::CarStatusChanges, cb_a).unwrap();
        h.pump();

        // The event is queued before B registers and dispatched after.
        h.transport.emit(&cars(), status_change());
        let _b = h.registry.subscribe(ChannelIntent::CarStatusChanges, cb_b).unwrap();
        h.pump();
        assert_eq!((hits_a.load(Ordering::SeqCst), hits_b.load(Ordering::SeqCst)), (1, 0));

        h.transport.emit(&cars(), status_change());
        h.pump();
        assert_eq!((hits_a.load(Ordering::SeqCst), hits_b.load(Ordering::SeqCst)), (2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_after_channel_error_is_ignored() {
        let mut h = Harness::new(MemoryTransport::manual_ack(), 5).await;
        let _handle = h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap();
        let generation = h.registry.connections().record(&cars()).unwrap().generation;

        h.transport.report(&cars(), ChannelStatus::ChannelError);
        h.pump();
        h.registry.handle_signal(ChannelSignal {
            channel: cars(),
            generation,
            sequence: transport::next_sequence(),
            kind: SignalKind::Status(ChannelStatus::Subscribed),
        });

        assert_eq!(h.registry.phase(&cars()), ChannelPhase::Backoff);
        assert_eq!(h.registry.connections().record(&cars()).unwrap().state, ConnectionState::Error);
        assert_eq!(h.registry.connections().stats().count(ConnectionState::Open), 0);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        h.pump();
        assert_eq!(h.transport.open_count(), 2);
        assert_eq!(h.registry.phase(&cars()), ChannelPhase::Connecting);
        assert_eq!(h.registry.connections().record(&cars()).unwrap().state, ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_after_health_sweep_is_ignored() {
        let mut h = Harness::new(MemoryTransport::manual_ack(), 5).await;
        let _handle = h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap();
        let generation = h.registry.connections().record(&cars()).unwrap().generation;

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.registry.run_health_sweep(), 1);
        h.registry.handle_signal(ChannelSignal {
            channel: cars(),
            generation,
            sequence: transport::next_sequence(),
            kind: SignalKind::Status(ChannelStatus::Subscribed),
        });

        assert_eq!(h.registry.phase(&cars()), ChannelPhase::Backoff);
        assert!(h.registry.connections().record(&cars()).is_none());

        tokio::time::sleep(Duration::from_millis(1001)).await;
        h.pump();
        assert_eq!(h.transport.open_count(), 2);
        assert_eq!(h.registry.phase(&cars()), ChannelPhase::Connecting);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let h = Harness::new(MemoryTransport::new(), 5).await;
        let handle = h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap();
        h.registry.shutdown();

        assert!(h.registry.connections().is_empty());
        assert_eq!(h.transport.open_channels(), 0);
        handle.unsubscribe();
        assert_eq!(
            h.registry.subscribe(ChannelIntent::CarStatusChanges, counter().1).unwrap_err(),
            RealtimeError::ShutDown
        );
    }
}
