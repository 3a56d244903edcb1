use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    InProgress,
    Cancelled,
    Finished,
    Failure,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::Pending,
        OrderStatus::InProgress,
        OrderStatus::Cancelled,
        OrderStatus::Finished,
        OrderStatus::Failure,
    ];

    /// Statuses that count against the one-active-order-per-user policy.
    pub const ACTIVE: [OrderStatus; 2] = [OrderStatus::Pending, OrderStatus::InProgress];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Finished => "finished",
            OrderStatus::Failure => "failure",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Cancelled | OrderStatus::Finished | OrderStatus::Failure
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown order status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceOrder {
    pub order_id: i64,
    pub service_id: i64,
    /// Display name from the service catalog, when the service is listed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub user_id: i64,
    #[serde(
        default,
        serialize_with = "mechanic_id::serialize",
        deserialize_with = "mechanic_id::deserialize"
    )]
    pub mechanic_id: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    pub lat: f64,
    pub lng: f64,
}

/// Fields accepted from a caller when creating an order. The store decides
/// the id, the status and every timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewServiceOrder {
    pub user_id: i64,
    pub service_id: i64,
    pub lat: f64,
    pub lng: f64,
}

impl NewServiceOrder {
    pub fn into_pending(self, order_id: i64, created_at: DateTime<Utc>) -> ServiceOrder {
        ServiceOrder {
            order_id,
            service_id: self.service_id,
            service_name: None,
            user_id: self.user_id,
            mechanic_id: None,
            created_at: Some(created_at),
            started_at: None,
            finished_at: None,
            cancelled_at: None,
            status: OrderStatus::Pending,
            lat: self.lat,
            lng: self.lng,
        }
    }
}

// An unassigned order travels as `mechanic_id: 0` on the wire.
mod mechanic_id {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        let raw = Option::<i64>::deserialize(deserializer)?;
        Ok(raw.filter(|id| *id != 0))
    }
}
