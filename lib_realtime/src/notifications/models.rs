use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Listing status of a car.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CarStatus {
    PendingApproval,
    Active,
    Inactive,
    Rejected,
    /// A status this build does not know about, kept verbatim.
    Other(String),
}

impl CarStatus {
    pub fn as_str(&self) -> &str {
        match self {
            CarStatus::PendingApproval => "PENDING_APPROVAL",
            CarStatus::Active => "ACTIVE",
            CarStatus::Inactive => "INACTIVE",
            CarStatus::Rejected => "REJECTED",
            CarStatus::Other(raw) => raw,
        }
    }
}

impl From<String> for CarStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "PENDING_APPROVAL" => CarStatus::PendingApproval,
            "ACTIVE" => CarStatus::Active,
            "INACTIVE" => CarStatus::Inactive,
            "REJECTED" => CarStatus::Rejected,
            _ => CarStatus::Other(raw),
        }
    }
}

impl From<CarStatus> for String {
    fn from(status: CarStatus) -> Self {
        match status {
            CarStatus::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for CarStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A car whose listing status changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarStatusChange {
    pub id: String,
    /// `None` when the database did not ship the previous row image.
    pub old_status: Option<CarStatus>,
    pub new_status: CarStatus,
    pub host_id: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Row of `public.admin_notifications`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminNotification {
    pub id: String,
    pub admin_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub car_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_car_status_wire_names() {
        let status: CarStatus = serde_json::from_value(json!("PENDING_APPROVAL")).unwrap();
        assert_eq!(status, CarStatus::PendingApproval);
        assert_eq!(serde_json::to_value(CarStatus::Active).unwrap(), json!("ACTIVE"));

        let unknown: CarStatus = serde_json::from_value(json!("SUSPENDED")).unwrap();
        assert_eq!(unknown, CarStatus::Other("SUSPENDED".into()));
        assert_eq!(unknown.to_string(), "SUSPENDED");
    }

    #[test]
    fn test_admin_notification_from_row() {
        let row = json!({
            "id": "n1",
            "admin_id": "admin-7",
            "type": "car_submitted",
            "title": "New car",
            "message": "A host submitted a car for review",
            "car_id": "car1",
            "created_at": "2024-05-01T10:00:00Z",
            "is_read": false
        });
        let notification: AdminNotification = serde_json::from_value(row).unwrap();
        assert_eq!(notification.kind, "car_submitted");
        assert_eq!(notification.car_id.as_deref(), Some("car1"));
        assert!(notification.created_at.is_some());
    }
}
