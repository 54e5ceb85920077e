//! # Typed Feeds
//!
//! A feed pairs a channel intent with the decoder that turns its raw row
//! changes into a typed payload. Changes a feed is not interested in decode
//! to `Ok(None)` and never reach the subscriber.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::core::channel::ChannelIntent;
use crate::notifications::models::{AdminNotification, CarStatus, CarStatusChange};
use crate::transport::{ChangeKind, RowChange};

pub trait Feed: Send + Sync + 'static {
    type Payload: Send + 'static;

    fn intent(&self) -> ChannelIntent;

    fn decode(&self, change: &RowChange) -> Result<Option<Self::Payload>, serde_json::Error>;
}

/// Status transitions of `public.cars`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CarStatusFeed;

#[derive(Deserialize)]
struct CarRow {
    id: String,
    status: CarStatus,
    #[serde(default)]
    host_id: Option<String>,
    #[serde(default)]
    make: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Without full replica identity the old image may only carry the key.
#[derive(Deserialize)]
struct OldCarRow {
    #[serde(default)]
    status: Option<CarStatus>,
}

impl Feed for CarStatusFeed {
    type Payload = CarStatusChange;

    fn intent(&self) -> ChannelIntent {
        ChannelIntent::CarStatusChanges
    }

    fn decode(&self, change: &RowChange) -> Result<Option<CarStatusChange>, serde_json::Error> {
        if change.event != ChangeKind::Update || change.table != "cars" {
            return Ok(None);
        }

        let row = CarRow::deserialize(&change.record)?;
        let old_status = match &change.old_record {
            Some(old) if !old.is_null() => OldCarRow::deserialize(old)?.status,
            _ => None,
        };
        if old_status.as_ref() == Some(&row.status) {
            return Ok(None);
        }

        Ok(Some(CarStatusChange {
            id: row.id,
            old_status,
            new_status: row.status,
            host_id: row.host_id,
            make: row.make,
            model: row.model,
            year: row.year,
            updated_at: row.updated_at.or(change.commit_timestamp),
        }))
    }
}

/// New notifications addressed to one admin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminNotificationFeed {
    pub admin_user_id: String,
}

impl AdminNotificationFeed {
    pub fn new(admin_user_id: impl Into<String>) -> Self {
        Self { admin_user_id: admin_user_id.into() }
    }
}

impl Feed for AdminNotificationFeed {
    type Payload = AdminNotification;

    fn intent(&self) -> ChannelIntent {
        ChannelIntent::AdminNotifications {
            admin_user_id: self.admin_user_id.clone(),
        }
    }

    fn decode(&self, change: &RowChange) -> Result<Option<AdminNotification>, serde_json::Error> {
        if change.event != ChangeKind::Insert || change.table != "admin_notifications" {
            return Ok(None);
        }
        let notification = AdminNotification::deserialize(&change.record)?;
        // The server-side filter should already guarantee this.
        if notification.admin_id != self.admin_user_id {
            return Ok(None);
        }
        Ok(Some(notification))
    }
}

/// Undecoded row changes of an arbitrary intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFeed {
    intent: ChannelIntent,
}

impl RawFeed {
    pub fn new(intent: ChannelIntent) -> Self {
        Self { intent }
    }
}

impl Feed for RawFeed {
    type Payload = RowChange;

    fn intent(&self) -> ChannelIntent {
        self.intent.clone()
    }

    fn decode(&self, change: &RowChange) -> Result<Option<RowChange>, serde_json::Error> {
        Ok(Some(change.clone()))
    }
}
