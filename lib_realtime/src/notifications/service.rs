//! # Notification Service
//!
//! The composition root of the realtime layer. It owns the transport, the
//! connection pool, the backoff controller and the registry, and runs the two
//! background tasks they need:
//!
//! - the **signal pump**, which drains every transport report into the
//!   registry on one task, so bookkeeping and dispatch happen in arrival
//!   order;
//! - the **health sweep**, which asks the pool for stuck or long-errored
//!   connections on a fixed interval.
//!
//! Construction does no I/O. [`NotificationService::init`] connects the
//! transport; until it succeeds, subscribe calls hand back an inert handle
//! rather than failing, and [`NotificationService::ready`] can be awaited by
//! anything that wants to subscribe for real.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::configs::config_realtime::RealtimeConfig;
use crate::core::backoff::{BackoffController, ChannelPhase};
use crate::core::channel::{ChannelIntent, ChannelName, ConnectionState};
use crate::core::connection_manager::{ConnectionEvent, ConnectionManager};
use crate::core::dispatcher::EventCallback;
use crate::core::error::RealtimeError;
use crate::core::registry::{ChannelDetail, SubscriptionHandle, SubscriptionRegistry};
use crate::notifications::feeds::{AdminNotificationFeed, CarStatusFeed, Feed};
use crate::notifications::models::{AdminNotification, CarStatusChange};
use crate::transport::{ChannelSignal, RealtimeTransport, RowChange};

/// Lifecycle of the service as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Initializing,
    Ready,
    Failed(String),
    ShutDown,
}

/// Aggregated counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// Connections in `Open`.
    pub active_connections: usize,
    /// Connections in the pool, any state.
    pub total_connections: usize,
    pub error_connections: usize,
    pub active_subscriptions: usize,
    pub total_subscriptions: usize,
    pub reconnect_attempts: u64,
    pub callback_failures: u64,
}

struct Inner {
    config: RealtimeConfig,
    transport: Arc<dyn RealtimeTransport>,
    registry: SubscriptionRegistry,
    signals: Mutex<Option<mpsc::UnboundedReceiver<ChannelSignal>>>,
    readiness: watch::Sender<Readiness>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sweeping: Mutex<bool>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.registry.shutdown();
    }
}

/// # Notification Service
///
/// Cheap to clone; clones share one service.
#[derive(Clone)]
pub struct NotificationService {
    inner: Arc<Inner>,
}

impl NotificationService {
    pub fn new(config: RealtimeConfig, transport: Arc<dyn RealtimeTransport>) -> Self {
        let connections = ConnectionManager::new(Arc::clone(&transport), config.pool_config());
        let backoff = BackoffController::new(config.retry_policy());
        let (registry, signals) = SubscriptionRegistry::new(connections, backoff);
        let (readiness, _) = watch::channel(Readiness::Initializing);

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                registry,
                signals: Mutex::new(Some(signals)),
                readiness,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                sweeping: Mutex::new(false),
            }),
        }
    }

    /// # Initialize
    ///
    /// Starts the signal pump and connects the transport, bounded by
    /// `initTimeoutMs`. On failure the service reports
    /// `Readiness::Failed`; calling `init` again retries the connection.
    pub async fn init(&self) -> Result<(), RealtimeError> {
        match self.readiness() {
            Readiness::Ready => return Ok(()),
            Readiness::ShutDown => return Err(RealtimeError::ShutDown),
            _ => {}
        }

        self.start_pump();
        self.inner.readiness.send_replace(Readiness::Initializing);
        log::info!("Connecting realtime transport...");

        let timeout = self.inner.config.init_timeout();
        let outcome = match time::timeout(timeout, self.inner.transport.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("transport did not connect within {} ms", timeout.as_millis())),
        };

        match outcome {
            Ok(()) => {
                if self.inner.shutdown.is_cancelled() {
                    return Err(RealtimeError::ShutDown);
                }
                self.start_health_sweep();
                self.inner.readiness.send_replace(Readiness::Ready);
                log::info!("Realtime service ready.");
                Ok(())
            }
            Err(reason) => {
                log::error!("Realtime service failed to initialize: {}", reason);
                self.inner.readiness.send_replace(Readiness::Failed(reason.clone()));
                Err(RealtimeError::InitializationFailure(reason))
            }
        }
    }

    /// Waits until the service is ready, failed or shut down.
    pub async fn ready(&self) -> Result<(), RealtimeError> {
        let mut rx = self.inner.readiness.subscribe();
        loop {
            match &*rx.borrow_and_update() {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(reason) => return Err(RealtimeError::InitializationFailure(reason.clone())),
                Readiness::ShutDown => return Err(RealtimeError::ShutDown),
                Readiness::Initializing => {}
            }
            if rx.changed().await.is_err() {
                return Err(RealtimeError::ShutDown);
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    pub fn readiness(&self) -> Readiness {
        self.inner.readiness.borrow().clone()
    }

    pub fn watch_readiness(&self) -> watch::Receiver<Readiness> {
        self.inner.readiness.subscribe()
    }

    /// # Subscribe
    ///
    /// Registers a typed callback on a feed. Rows the feed cannot decode are
    /// logged and skipped. Before the service is ready an inert handle is
    /// returned and nothing is registered.
    pub fn subscribe<F, C>(&self, feed: F, callback: C) -> Result<SubscriptionHandle, RealtimeError>
    where
        F: Feed,
        C: Fn(F::Payload) + Send + Sync + 'static,
    {
        let intent = feed.intent();
        let channel = intent.channel_name();
        let wrapped: EventCallback = Arc::new(move |change: &RowChange| match feed.decode(change) {
            Ok(Some(payload)) => callback(payload),
            Ok(None) => log::trace!("Change on {} filtered by feed.", channel),
            Err(e) => log::warn!("Undecodable {:?} on {}: {}", change.event, channel, e),
        });
        self.subscribe_raw(intent, wrapped)
    }

    /// Registers an untyped callback on an arbitrary intent.
    pub fn subscribe_raw(&self, intent: ChannelIntent, callback: EventCallback) -> Result<SubscriptionHandle, RealtimeError> {
        match self.readiness() {
            Readiness::Ready => self.inner.registry.subscribe(intent, callback),
            Readiness::ShutDown => Err(RealtimeError::ShutDown),
            state => {
                log::warn!(
                    "Subscribe to {} while service is {:?}; returning an inert handle.",
                    intent.channel_name(),
                    state
                );
                Ok(SubscriptionHandle::inert())
            }
        }
    }

    pub fn subscribe_to_car_status_changes<C>(&self, callback: C) -> Result<SubscriptionHandle, RealtimeError>
    where
        C: Fn(CarStatusChange) + Send + Sync + 'static,
    {
        self.subscribe(CarStatusFeed, callback)
    }

    pub fn subscribe_to_admin_notifications<C>(
        &self,
        admin_user_id: &str,
        callback: C,
    ) -> Result<SubscriptionHandle, RealtimeError>
    where
        C: Fn(AdminNotification) + Send + Sync + 'static,
    {
        self.subscribe(AdminNotificationFeed::new(admin_user_id), callback)
    }

    pub fn get_service_stats(&self) -> ServiceStats {
        let registry = &self.inner.registry;
        let pool = registry.connections().stats();
        let subscriptions = registry.stats();
        ServiceStats {
            active_connections: pool.count(ConnectionState::Open),
            total_connections: pool.total,
            error_connections: pool.count(ConnectionState::Error),
            active_subscriptions: subscriptions.active_subscriptions,
            total_subscriptions: subscriptions.total_subscriptions,
            reconnect_attempts: registry.backoff().reconnect_attempts(),
            callback_failures: subscriptions.callback_failures,
        }
    }

    /// Restarts every channel that gave up reconnecting. Returns how many
    /// were restarted.
    pub fn reconnect(&self) -> usize {
        let restarted = self.inner.registry.reconnect_failed();
        if restarted > 0 {
            log::info!("Manual reconnect restarted {} channel(s).", restarted);
        }
        restarted
    }

    pub fn reconnect_channel(&self, channel: &ChannelName) -> Result<(), RealtimeError> {
        self.inner.registry.reconnect(channel)
    }

    pub fn channel_phase(&self, channel: &ChannelName) -> ChannelPhase {
        self.inner.registry.phase(channel)
    }

    pub fn channel_details(&self) -> Vec<ChannelDetail> {
        self.inner.registry.channel_details()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.registry.connections().subscribe_events()
    }

    /// Runs one health sweep now instead of waiting for the interval.
    pub fn run_health_sweep(&self) -> usize {
        self.inner.registry.run_health_sweep()
    }

    /// # Shutdown
    ///
    /// Releases every subscription and connection, cancels every timer and
    /// background task and disconnects the transport. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.readiness.send_replace(Readiness::ShutDown) == Readiness::ShutDown {
            return;
        }
        log::info!("Shutting down realtime service...");

        self.inner.shutdown.cancel();
        self.inner.registry.shutdown();
        self.inner.transport.disconnect().await;

        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("Background task ended abnormally: {}", e);
            }
        }
        log::info!("Realtime service shut down.");
    }

    fn start_pump(&self) {
        let Some(mut signals) = self.inner.signals.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        let registry = self.inner.registry.clone();
        let token = self.inner.shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    signal = signals.recv() => match signal {
                        Some(signal) => registry.handle_signal(signal),
                        None => break,
                    },
                }
            }
            log::debug!("Signal pump stopped.");
        });
        self.lock_tasks().push(task);
    }

    fn start_health_sweep(&self) {
        {
            let mut sweeping = self.inner.sweeping.lock().unwrap_or_else(PoisonError::into_inner);
            if *sweeping {
                return;
            }
            *sweeping = true;
        }

        let registry = self.inner.registry.clone();
        let token = self.inner.shutdown.clone();
        let period = self.inner.config.pool_config().sweep_interval;

        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = registry.run_health_sweep();
                        if swept > 0 {
                            log::warn!("Health sweep closed {} connection(s).", swept);
                        }
                    }
                }
            }
            log::debug!("Health sweep stopped.");
        });
        self.lock_tasks().push(task);
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn service(transport: &MemoryTransport) -> NotificationService {
        NotificationService::new(RealtimeConfig::default(), Arc::new(transport.clone()))
    }

    #[tokio::test]
    async fn test_subscribe_before_ready_is_inert() {
        let transport = MemoryTransport::new();
        let service = service(&transport);

        let handle = service.subscribe_to_car_status_changes(|_| {}).unwrap();
        assert!(!handle.is_active());
        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_init_is_reported() {
        let transport = MemoryTransport::failing("offline");
        let service = service(&transport);

        let err = service.init().await.unwrap_err();
        assert!(matches!(err, RealtimeError::InitializationFailure(_)));
        assert!(matches!(service.readiness(), Readiness::Failed(_)));
        assert!(service.ready().await.is_err());
        assert!(!service.subscribe_to_car_status_changes(|_| {}).unwrap().is_active());
    }

    #[tokio::test]
    async fn test_ready_wakes_waiters() {
        let transport = MemoryTransport::new();
        let service = service(&transport);

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move { service.ready().await })
        };
        service.init().await.unwrap();
        assert!(waiter.await.unwrap().is_ok());
        assert!(service.is_ready());
    }

    #[tokio::test]
    async fn test_typed_delivery_through_pump() {
        let transport = MemoryTransport::new();
        let service = service(&transport);
        service.init().await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _handle = service
            .subscribe_to_car_status_changes(move |change| {
                assert_eq!(change.id, "car1");
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let channel = ChannelName::from("car_status_changes");
        transport.emit(
            &channel,
            RowChange::update(
                "cars",
                json!({"id": "car1", "status": "ACTIVE"}),
                Some(json!({"id": "car1", "status": "PENDING_APPROVAL"})),
            ),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stats = service.get_service_stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.total_subscriptions, 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let transport = MemoryTransport::new();
        let service = service(&transport);
        service.init().await.unwrap();
        let handle = service.subscribe_to_car_status_changes(|_| {}).unwrap();

        service.shutdown().await;
        service.shutdown().await;

        assert!(!transport.is_connected());
        assert_eq!(service.get_service_stats(), ServiceStats::default());
        assert_eq!(service.init().await.unwrap_err(), RealtimeError::ShutDown);
        drop(handle);
    }
}
