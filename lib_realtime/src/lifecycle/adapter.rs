//! # Lifecycle Adapter
//!
//! Ties one subscription to a consumer's mount/unmount cycle.
//!
//! ## Core Design Principles:
//!
//! 1.  **Silence after unmount**: the consumer's callback is wrapped in a
//!     check of the mount's `unmounted` flag. The flag is raised before the
//!     subscription is released, so an event already in flight is dropped
//!     instead of reaching a consumer that is gone.
//!
//! 2.  **Exactly-once release**: mounting waits for service readiness on a
//!     spawned task. Whichever of that task and `on_unmount` reaches the
//!     handle slot second sees the other's work (the stored handle, or the
//!     raised flag) and performs the single unsubscribe.
//!
//! 3.  **RAII**: dropping the adapter unmounts it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::backoff::ChannelPhase;
use crate::core::channel::ChannelName;
use crate::core::error::RealtimeError;
use crate::core::registry::{ChannelDetail, SubscriptionHandle};
use crate::notifications::feeds::Feed;
use crate::notifications::service::NotificationService;

/// What a consumer should show about its live feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountStatus {
    /// Never mounted.
    Idle,
    WaitingForService,
    Live,
    /// The feed could not be (or is no longer) delivered.
    Unavailable(RealtimeError),
    Unmounted,
}

/// Subscription overview for a consumer's debug panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterStats {
    pub active_subscriptions: usize,
    pub total_subscriptions: usize,
    pub per_channel_detail: Vec<ChannelDetail>,
}

struct Mount {
    channel: ChannelName,
    unmounted: Arc<AtomicBool>,
    handle: Mutex<Option<SubscriptionHandle>>,
}

impl Mount {
    fn slot(&self) -> MutexGuard<'_, Option<SubscriptionHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        self.unmounted.store(true, Ordering::Release);
        let handle = self.slot().take();
        if let Some(handle) = handle {
            handle.unsubscribe();
        }
    }
}

/// # Lifecycle Adapter
pub struct LifecycleAdapter {
    service: NotificationService,
    mount: Option<Arc<Mount>>,
    task: Option<JoinHandle<()>>,
    status: Arc<watch::Sender<MountStatus>>,
}

impl LifecycleAdapter {
    pub fn new(service: NotificationService) -> Self {
        let (status, _) = watch::channel(MountStatus::Idle);
        Self {
            service,
            mount: None,
            task: None,
            status: Arc::new(status),
        }
    }

    /// # On Mount
    ///
    /// Subscribes `callback` to `feed` once the service is ready. A previous
    /// mount of this adapter is unmounted first. Must be called from within a
    /// tokio runtime.
    pub fn on_mount<F, C>(&mut self, feed: F, callback: C)
    where
        F: Feed,
        C: Fn(F::Payload) + Send + Sync + 'static,
    {
        self.release_current();

        let unmounted = Arc::new(AtomicBool::new(false));
        let mount = Arc::new(Mount {
            channel: feed.intent().channel_name(),
            unmounted: Arc::clone(&unmounted),
            handle: Mutex::new(None),
        });
        self.status.send_replace(MountStatus::WaitingForService);

        let guarded = move |payload: F::Payload| {
            if !unmounted.load(Ordering::Acquire) {
                callback(payload);
            }
        };

        let service = self.service.clone();
        let status = Arc::clone(&self.status);
        let pending = Arc::clone(&mount);
        self.task = Some(tokio::spawn(async move {
            let outcome = match service.ready().await {
                Ok(()) => service.subscribe(feed, guarded),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(handle) => {
                    let mut slot = pending.slot();
                    if pending.unmounted.load(Ordering::Acquire) {
                        drop(slot);
                        handle.unsubscribe();
                        return;
                    }
                    *slot = Some(handle);
                    status.send_replace(MountStatus::Live);
                    log::debug!("Mounted feed on channel {}.", pending.channel);
                }
                Err(e) => {
                    if !pending.unmounted.load(Ordering::Acquire) {
                        log::warn!("Feed on channel {} unavailable: {}", pending.channel, e);
                        status.send_replace(MountStatus::Unavailable(e));
                    }
                }
            }
        }));
        self.mount = Some(mount);
    }

    /// # On Unmount
    ///
    /// Stops delivery and releases the subscription. Idempotent.
    pub fn on_unmount(&mut self) {
        if self.mount.is_some() {
            self.release_current();
            self.status.send_replace(MountStatus::Unmounted);
        }
    }

    fn release_current(&mut self) {
        if let Some(mount) = self.mount.take() {
            mount.release();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Current status. A live feed whose channel gave up reconnecting is
    /// reported as `Unavailable(ChannelFailed)`.
    pub fn status(&self) -> MountStatus {
        let current = self.status.borrow().clone();
        if current == MountStatus::Live {
            if let Some(mount) = &self.mount {
                if self.service.channel_phase(&mount.channel) == ChannelPhase::Failed {
                    return MountStatus::Unavailable(RealtimeError::ChannelFailed(mount.channel.clone()));
                }
            }
        }
        current
    }

    pub fn watch_status(&self) -> watch::Receiver<MountStatus> {
        self.status.subscribe()
    }

    pub fn channel(&self) -> Option<&ChannelName> {
        self.mount.as_ref().map(|mount| &mount.channel)
    }

    pub fn is_ready(&self) -> bool {
        self.service.is_ready()
    }

    pub fn get_stats(&self) -> AdapterStats {
        let stats = self.service.get_service_stats();
        AdapterStats {
            active_subscriptions: stats.active_subscriptions,
            total_subscriptions: stats.total_subscriptions,
            per_channel_detail: self.service.channel_details(),
        }
    }

    /// Restarts channels that gave up reconnecting.
    pub fn reconnect(&self) -> usize {
        self.service.reconnect()
    }
}

impl Drop for LifecycleAdapter {
    fn drop(&mut self) {
        self.on_unmount();
    }
}
