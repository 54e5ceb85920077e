//! # Reconnection / Backoff Controller
//!
//! Drives every failed channel through a bounded series of reconnect attempts
//! spaced by exponential backoff:
//!
//! ```text
//! Idle -> Connecting -> Open
//! Open -> Backoff -> Connecting          (attempt N + 1)
//! Backoff -> Failed                      (attempts > max_retries)
//! any -> Closed                          (release, timer cancelled)
//! ```
//!
//! The controller only decides *when* to retry. The retry itself is a closure
//! supplied by the registry, which rebuilds the channel from its stored intent
//! and keeps the callback set untouched.
//!
//! At most one timer exists per channel. Every timer is a child of one root
//! `CancellationToken`, so `shutdown` silences all of them at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::channel::ChannelName;

/// # Retry Policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Failures tolerated before a channel is declared `Failed`.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based):
    /// `min(base_delay * 2^(attempt - 1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Where a channel stands in the reconnection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    Idle,
    Connecting,
    Open,
    /// A retry timer is pending.
    Backoff,
    /// Retries exhausted. Only an explicit reconnect leaves this phase.
    Failed,
    Closed,
}

/// Retry bookkeeping of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub phase: ChannelPhase,
    pub attempts: u32,
    pub next_delay: Option<Duration>,
    pub scheduled_at: Option<Instant>,
}

impl RetryState {
    fn idle() -> Self {
        Self {
            phase: ChannelPhase::Idle,
            attempts: 0,
            next_delay: None,
            scheduled_at: None,
        }
    }
}

/// Outcome of reporting a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// A retry timer was started with this delay.
    Scheduled(Duration),
    /// A retry is already pending; nothing new was scheduled.
    AlreadyPending,
    /// The retry budget is spent; the channel is now `Failed`.
    Exhausted,
    /// The channel is not tracked (released, failed or shut down).
    Untracked,
}

struct RetryEntry {
    state: RetryState,
    timer: Option<CancellationToken>,
    /// Incremented for every scheduled timer; a firing timer must present
    /// the current ticket to start an attempt.
    ticket: u64,
}

impl RetryEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.state.scheduled_at = None;
    }
}

/// # Backoff Controller
pub struct BackoffController {
    policy: RetryPolicy,
    channels: Mutex<HashMap<ChannelName, RetryEntry>>,
    reconnect_attempts: AtomicU64,
    root: CancellationToken,
}

impl BackoffController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            channels: Mutex::new(HashMap::new()),
            reconnect_attempts: AtomicU64::new(0),
            root: CancellationToken::new(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Starts tracking a freshly opened channel (`Idle -> Connecting`).
    pub fn arm(&self, channel: &ChannelName) {
        let mut channels = self.lock();
        let entry = channels.entry(channel.clone()).or_insert_with(|| RetryEntry {
            state: RetryState::idle(),
            timer: None,
            ticket: 0,
        });
        entry.cancel_timer();
        entry.state = RetryState {
            phase: ChannelPhase::Connecting,
            ..RetryState::idle()
        };
    }

    /// The transport acknowledged the channel. Resets the attempt counter and
    /// returns how many attempts the recovery took.
    pub fn on_open(&self, channel: &ChannelName) -> Option<u32> {
        let mut channels = self.lock();
        let entry = channels.get_mut(channel)?;
        let attempts = entry.state.attempts;
        entry.cancel_timer();
        entry.state.phase = ChannelPhase::Open;
        entry.state.attempts = 0;
        entry.state.next_delay = None;
        Some(attempts)
    }

    /// The channel failed. Schedules `retry` after the next backoff delay
    /// unless a retry is already pending or the budget is spent. `retry`
    /// receives the ticket to pass to [`BackoffController::begin_attempt`].
    pub fn on_failure<F>(&self, channel: &ChannelName, retry: F) -> BackoffDecision
    where
        F: FnOnce(u64) + Send + 'static,
    {
        if self.root.is_cancelled() {
            return BackoffDecision::Untracked;
        }

        let mut channels = self.lock();
        let Some(entry) = channels.get_mut(channel) else {
            return BackoffDecision::Untracked;
        };

        match entry.state.phase {
            ChannelPhase::Backoff if entry.timer.is_some() => return BackoffDecision::AlreadyPending,
            ChannelPhase::Failed | ChannelPhase::Closed => return BackoffDecision::Untracked,
            _ => {}
        }

        entry.state.attempts += 1;
        if entry.state.attempts > self.policy.max_retries {
            entry.cancel_timer();
            entry.state.phase = ChannelPhase::Failed;
            entry.state.next_delay = None;
            return BackoffDecision::Exhausted;
        }

        let delay = self.policy.delay_for(entry.state.attempts);
        let timer = self.root.child_token();
        entry.ticket += 1;
        entry.timer = Some(timer.clone());
        entry.state.phase = ChannelPhase::Backoff;
        entry.state.next_delay = Some(delay);
        entry.state.scheduled_at = Some(Instant::now());

        let ticket = entry.ticket;
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(delay) => retry(ticket),
            }
        });

        BackoffDecision::Scheduled(delay)
    }

    /// A retry timer fired (`Backoff -> Connecting`). Returns `false` when
    /// the ticket is stale or the channel left `Backoff` in the meantime;
    /// the caller must then not reconnect.
    pub fn begin_attempt(&self, channel: &ChannelName, ticket: u64) -> bool {
        let mut channels = self.lock();
        let Some(entry) = channels.get_mut(channel) else {
            return false;
        };
        if entry.state.phase != ChannelPhase::Backoff || entry.ticket != ticket {
            return false;
        }
        entry.timer = None;
        entry.state.scheduled_at = None;
        entry.state.phase = ChannelPhase::Connecting;
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Manual reconnect: back to `Connecting` with a fresh budget.
    pub fn reset(&self, channel: &ChannelName) {
        let mut channels = self.lock();
        if let Some(entry) = channels.get_mut(channel) {
            entry.cancel_timer();
            entry.state = RetryState {
                phase: ChannelPhase::Connecting,
                ..RetryState::idle()
            };
            self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Forces the channel into `Failed`.
    pub fn mark_failed(&self, channel: &ChannelName) {
        if let Some(entry) = self.lock().get_mut(channel) {
            entry.cancel_timer();
            entry.state.phase = ChannelPhase::Failed;
            entry.state.next_delay = None;
        }
    }

    /// Stops tracking the channel and cancels its timer.
    pub fn release(&self, channel: &ChannelName) {
        if let Some(mut entry) = self.lock().remove(channel) {
            entry.cancel_timer();
        }
    }

    /// Current phase; `Closed` for channels that are not tracked.
    pub fn phase(&self, channel: &ChannelName) -> ChannelPhase {
        self.lock()
            .get(channel)
            .map_or(ChannelPhase::Closed, |entry| entry.state.phase)
    }

    pub fn state(&self, channel: &ChannelName) -> Option<RetryState> {
        self.lock().get(channel).map(|entry| entry.state.clone())
    }

    /// Channels currently in `Failed`.
    pub fn failed_channels(&self) -> Vec<ChannelName> {
        self.lock()
            .iter()
            .filter(|(_, entry)| entry.state.phase == ChannelPhase::Failed)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Reconnect attempts started since creation, automatic and manual.
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Cancels every timer and forgets every channel. No retry fires after
    /// this returns.
    pub fn shutdown(&self) {
        self.root.cancel();
        for (_, mut entry) in self.lock().drain() {
            entry.cancel_timer();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelName, RetryEntry>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
