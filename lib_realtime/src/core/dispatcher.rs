//! # Snapshot Fan-out Dispatcher
//!
//! Delivers one inbound row change to every callback registered on a channel.
//!
//! ## Core Design Principles:
//!
//! 1.  **Snapshot iteration**: the registry copies the callback list (a few
//!     `Arc` clones) and releases its lock before calling `fan_out`. A callback
//!     may therefore subscribe or unsubscribe from inside its own invocation
//!     without deadlocking or invalidating the iteration.
//!
//! 2.  **Failure isolation**: every callback runs under `catch_unwind`. A
//!     panicking subscriber is logged and counted; the remaining subscribers
//!     still receive the event and the channel stays up.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::core::channel::ChannelName;
use crate::transport::RowChange;

/// A subscriber's handler for raw row changes.
pub type EventCallback = Arc<dyn Fn(&RowChange) + Send + Sync>;

/// Result of delivering one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// # Fan Out
///
/// Invokes each callback once with `change`. Order is not significant.
pub fn fan_out(channel: &ChannelName, callbacks: &[EventCallback], change: &RowChange) -> DispatchReport {
    let mut report = DispatchReport::default();

    for callback in callbacks {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(change))) {
            Ok(()) => report.delivered += 1,
            Err(payload) => {
                report.failed += 1;
                log::error!(
                    "Subscriber callback on channel {} panicked: {}. Other subscribers are unaffected.",
                    channel,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    log::trace!(
        "Dispatched {:?} on {} to {} subscriber(s), {} failed.",
        change.event,
        channel,
        report.delivered,
        report.failed
    );
    report
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        *text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.as_str()
    } else {
        "non-string panic payload"
    }
}
