//! # Connection Manager
//!
//! Owns the bounded pool of channel connections on the shared transport and is
//! the only component that opens or closes a transport channel.
//!
//! ## Rules:
//!
//! - **One live connection per name**: `acquire` hands back the existing
//!   record while it is `Connecting` or `Open`.
//! - **Bounded pool**: a new name is refused with `PoolExhausted` once
//!   `max_connections` records are held. Unrelated channels are never evicted
//!   to make room. `Error` records keep their slot until a retry replaces them
//!   or the health sweep removes them, so a channel in backoff cannot lose its
//!   slot to a newcomer.
//! - **Health sweep**: `Error` records older than the grace period and
//!   `Connecting` records older than the connection timeout are closed and
//!   returned to the caller, which routes them to the backoff controller.
//!
//! Lifecycle changes are published as [`ConnectionEvent`]s on a broadcast
//! channel for status indicators and monitors.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::core::channel::{ChannelIntent, ChannelName, ConnectionRecord, ConnectionState};
use crate::core::error::RealtimeError;
use crate::transport::{ChannelSink, RealtimeTransport, TransportChannel};

/// Pool size used when none is configured.
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;
/// Hard upper bound on the pool size.
pub const MAX_POOL_SIZE: usize = 10;

/// # Pool Configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// How long a channel may stay `Connecting` before the sweep drops it.
    pub connection_timeout: Duration,
    /// How long an `Error` record may hold its slot.
    pub error_grace_period: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout: Duration::from_secs(10),
            error_grace_period: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opening { channel: ChannelName, generation: u64 },
    Opened { channel: ChannelName },
    Errored { channel: ChannelName },
    Closed { channel: ChannelName },
    Swept { channel: ChannelName, state: ConnectionState },
}

/// Read-only snapshot of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub by_state: BTreeMap<ConnectionState, usize>,
}

impl PoolStats {
    pub fn count(&self, state: ConnectionState) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }
}

struct PooledConnection {
    record: ConnectionRecord,
    channel: Box<dyn TransportChannel>,
}

/// # Connection Manager
pub struct ConnectionManager {
    transport: Arc<dyn RealtimeTransport>,
    config: PoolConfig,
    pool: Mutex<HashMap<ChannelName, PooledConnection>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn RealtimeTransport>, mut config: PoolConfig) -> Self {
        if config.max_connections == 0 || config.max_connections > MAX_POOL_SIZE {
            let clamped = config.max_connections.clamp(1, MAX_POOL_SIZE);
            log::warn!(
                "Pool size {} is out of range, using {}.",
                config.max_connections,
                clamped
            );
            config.max_connections = clamped;
        }
        let (events, _) = broadcast::channel(64);
        Self {
            transport,
            config,
            pool: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// # Acquire
    ///
    /// Returns the live record for the intent's channel, or opens a new
    /// channel on the transport in `Connecting` state. The sink's generation
    /// becomes the record's generation.
    pub fn acquire(&self, intent: &ChannelIntent, sink: ChannelSink) -> Result<ConnectionRecord, RealtimeError> {
        let name = intent.channel_name();
        let mut pool = self.lock();

        let mut retry_count = 0;
        if let Some(existing) = pool.get(&name) {
            if existing.record.state.is_live() {
                return Ok(existing.record.clone());
            }
            retry_count = existing.record.retry_count + 1;
        }

        let occupied = pool.len() - usize::from(pool.contains_key(&name));
        if occupied >= self.config.max_connections {
            log::warn!(
                "Pool exhausted ({}/{}), refusing channel {}.",
                occupied,
                self.config.max_connections,
                name
            );
            return Err(RealtimeError::PoolExhausted {
                channel: name,
                max: self.config.max_connections,
            });
        }

        // A failed open leaves the errored record holding its slot.
        let generation = sink.generation();
        let channel = self.transport.open(intent, sink)?;
        let record = ConnectionRecord::connecting(name.clone(), generation, retry_count);
        let replaced = pool.insert(
            name.clone(),
            PooledConnection {
                record: record.clone(),
                channel,
            },
        );
        if let Some(stale) = replaced {
            stale.channel.unsubscribe();
        }

        log::info!("Opening channel {} (generation {}, pool {}/{}).", name, generation, pool.len(), self.config.max_connections);
        self.emit(ConnectionEvent::Opening { channel: name, generation });
        Ok(record)
    }

    /// The transport acknowledged the channel. Only a `Connecting` record
    /// moves to `Open`; an acknowledgement for a record that already failed
    /// or was swept is refused.
    pub fn mark_open(&self, channel: &ChannelName, generation: u64) -> bool {
        let mut pool = self.lock();
        let Some(conn) = Self::current(&mut pool, channel, generation) else {
            return false;
        };
        if conn.record.state != ConnectionState::Connecting {
            return false;
        }
        conn.record.state = ConnectionState::Open;
        conn.record.retry_count = 0;
        conn.record.last_activity_at = Instant::now();
        self.emit(ConnectionEvent::Opened { channel: channel.clone() });
        true
    }

    /// The transport reported a failure. The transport channel is left at
    /// once; the record keeps its slot in `Error`.
    pub fn mark_error(&self, channel: &ChannelName, generation: u64) -> bool {
        let mut pool = self.lock();
        let Some(conn) = Self::current(&mut pool, channel, generation) else {
            return false;
        };
        conn.channel.unsubscribe();
        conn.record.state = ConnectionState::Error;
        conn.record.last_activity_at = Instant::now();
        self.emit(ConnectionEvent::Errored { channel: channel.clone() });
        true
    }

    /// Whether the given generation of the channel is `Connecting` or `Open`.
    pub fn is_live(&self, channel: &ChannelName, generation: u64) -> bool {
        let mut pool = self.lock();
        Self::current(&mut pool, channel, generation).is_some_and(|conn| conn.record.state.is_live())
    }

    /// Records inbound traffic on the channel.
    pub fn touch(&self, channel: &ChannelName, generation: u64) -> bool {
        let mut pool = self.lock();
        match Self::current(&mut pool, channel, generation) {
            Some(conn) => {
                conn.record.last_activity_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// # Release
    ///
    /// Closes the named connection whatever its state. Idempotent.
    pub fn release(&self, channel: &ChannelName) -> bool {
        let removed = self.lock().remove(channel);
        match removed {
            Some(conn) => {
                conn.channel.unsubscribe();
                log::info!("Released channel {}.", channel);
                self.emit(ConnectionEvent::Closed { channel: channel.clone() });
                true
            }
            None => false,
        }
    }

    /// Closes every connection.
    pub fn release_all(&self) -> usize {
        let drained: Vec<(ChannelName, PooledConnection)> = self.lock().drain().collect();
        for (name, conn) in &drained {
            conn.channel.unsubscribe();
            self.emit(ConnectionEvent::Closed { channel: name.clone() });
        }
        drained.len()
    }

    /// # Health Sweep
    ///
    /// Removes `Error` records past the grace period and `Connecting`
    /// records past the connection timeout. Returns the removed records.
    pub fn health_sweep(&self) -> Vec<ConnectionRecord> {
        let now = Instant::now();
        let mut pool = self.lock();

        let expired: Vec<ChannelName> = pool
            .iter()
            .filter(|(_, conn)| match conn.record.state {
                ConnectionState::Error => {
                    now.duration_since(conn.record.last_activity_at) >= self.config.error_grace_period
                }
                ConnectionState::Connecting => {
                    now.duration_since(conn.record.opened_at) >= self.config.connection_timeout
                }
                _ => false,
            })
            .map(|(name, _)| name.clone())
            .collect();

        let mut swept = Vec::with_capacity(expired.len());
        for name in expired {
            if let Some(conn) = pool.remove(&name) {
                conn.channel.unsubscribe();
                log::warn!("Health sweep closed channel {} stuck in {:?}.", name, conn.record.state);
                self.emit(ConnectionEvent::Swept {
                    channel: name,
                    state: conn.record.state,
                });
                swept.push(conn.record);
            }
        }
        swept
    }

    pub fn stats(&self) -> PoolStats {
        let pool = self.lock();
        let mut stats = PoolStats {
            total: pool.len(),
            by_state: BTreeMap::new(),
        };
        for conn in pool.values() {
            *stats.by_state.entry(conn.record.state).or_insert(0) += 1;
        }
        stats
    }

    pub fn record(&self, channel: &ChannelName) -> Option<ConnectionRecord> {
        self.lock().get(channel).map(|conn| conn.record.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn current<'a>(
        pool: &'a mut HashMap<ChannelName, PooledConnection>,
        channel: &ChannelName,
        generation: u64,
    ) -> Option<&'a mut PooledConnection> {
        pool.get_mut(channel).filter(|conn| conn.record.generation == generation)
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is the normal case.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelName, PooledConnection>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
