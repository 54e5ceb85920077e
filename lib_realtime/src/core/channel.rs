//! # Channels
//!
//! The vocabulary shared by the pool, the registry and the transports: what a
//! channel is called, what it was opened for, and what state its physical
//! connection is in.

use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tokio::time::Instant;

/// Channel carrying status transitions of car listings.
pub const CAR_STATUS_CHANNEL: &str = "car_status_changes";
/// Prefix of the per-admin notification channel.
pub const ADMIN_NOTIFICATIONS_PREFIX: &str = "admin_notifications_";

/// # Channel Name
///
/// Opaque, immutable identifier of one logical feed. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName(Arc<str>);

impl ChannelName {
    /// Wraps an arbitrary name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for ChannelName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// The Postgres change stream a channel listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PostgresChanges {
    /// `INSERT`, `UPDATE`, `DELETE` or `*`.
    pub event: String,
    pub schema: String,
    pub table: String,
    /// Row filter in PostgREST syntax, e.g. `admin_id=eq.42`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl PostgresChanges {
    /// Changes of `public.<table>` for the given event type.
    pub fn public(event: &str, table: &str) -> Self {
        Self {
            event: event.to_string(),
            schema: "public".to_string(),
            table: table.to_string(),
            filter: None,
        }
    }

    /// Restricts the stream with a row filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// # Channel Intent
///
/// Everything needed to (re)build a channel: its kind and the parameters it
/// was opened with. Reconnection rebuilds a channel from its intent, so no
/// parameter is lost on the way.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelIntent {
    /// Status transitions of car listings (`UPDATE` on `public.cars`).
    CarStatusChanges,
    /// Notifications addressed to one admin (`INSERT` on
    /// `public.admin_notifications`).
    AdminNotifications {
        /// The admin the feed belongs to.
        admin_user_id: String,
    },
    /// Any other table feed under an explicit channel name.
    Custom {
        channel: ChannelName,
        changes: PostgresChanges,
    },
}

impl ChannelIntent {
    /// Feed of every change of `public.<table>` under the given channel name.
    pub fn custom(channel: impl AsRef<str>, table: &str) -> Self {
        ChannelIntent::Custom {
            channel: ChannelName::new(channel),
            changes: PostgresChanges::public("*", table),
        }
    }

    /// The channel name this intent is keyed by.
    pub fn channel_name(&self) -> ChannelName {
        match self {
            ChannelIntent::CarStatusChanges => ChannelName::new(CAR_STATUS_CHANNEL),
            ChannelIntent::AdminNotifications { admin_user_id } => {
                ChannelName::new(format!("{}{}", ADMIN_NOTIFICATIONS_PREFIX, admin_user_id))
            }
            ChannelIntent::Custom { channel, .. } => channel.clone(),
        }
    }

    /// The change stream the transport has to join for this intent.
    pub fn changes(&self) -> PostgresChanges {
        match self {
            ChannelIntent::CarStatusChanges => PostgresChanges::public("UPDATE", "cars"),
            ChannelIntent::AdminNotifications { admin_user_id } => {
                PostgresChanges::public("INSERT", "admin_notifications")
                    .with_filter(format!("admin_id=eq.{}", admin_user_id))
            }
            ChannelIntent::Custom { changes, .. } => changes.clone(),
        }
    }
}

/// State of one physical channel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Join sent, acknowledgement pending.
    Connecting,
    /// Acknowledged by the transport; events flow.
    Open,
    /// The transport reported a failure; the slot is held until a retry
    /// replaces it or the health sweep removes it.
    Error,
    Closed,
}

impl ConnectionState {
    /// `Connecting` and `Open` count as live: at most one live record may
    /// exist per channel name.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

/// # Connection Record
///
/// Bookkeeping for one pooled channel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub channel: ChannelName,
    pub state: ConnectionState,
    pub opened_at: Instant,
    pub last_activity_at: Instant,
    /// How many times this channel has been reopened since it was last open.
    pub retry_count: u32,
    /// Identifies the physical channel; signals carrying another generation
    /// belong to a connection that no longer exists.
    pub generation: u64,
}

impl ConnectionRecord {
    /// A fresh record in `Connecting`.
    pub fn connecting(channel: ChannelName, generation: u64, retry_count: u32) -> Self {
        let now = Instant::now();
        Self {
            channel,
            state: ConnectionState::Connecting,
            opened_at: now,
            last_activity_at: now,
            retry_count,
            generation,
        }
    }
}
