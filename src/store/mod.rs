//! Durable record of service orders.
//!
//! The store is the only component that writes orders. Every mutation is a
//! single conditional write; a write that matches nothing reports
//! [`StoreError::NoRowsAffected`] so callers can tell "unknown id" or
//! "precondition failed" apart from an infrastructure failure.

pub mod memory;
pub mod postgres;
pub mod users;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::order::{NewServiceOrder, OrderStatus, ServiceOrder};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order not found")]
    NotFound,

    #[error("no rows affected")]
    NoRowsAffected,

    #[error("user already has an active order")]
    ActiveOrderExists,

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Which orders a listing may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderScope {
    All,
    User(i64),
    Mechanic(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderFilter {
    pub scope: OrderScope,
    /// Empty means any status.
    pub statuses: Vec<OrderStatus>,
}

impl OrderFilter {
    pub fn new(scope: OrderScope) -> Self {
        Self {
            scope,
            statuses: Vec::new(),
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = OrderStatus>) -> Self {
        self.statuses.extend(statuses);
        self
    }

    pub fn matches(&self, order: &ServiceOrder) -> bool {
        let in_scope = match self.scope {
            OrderScope::All => true,
            OrderScope::User(user_id) => order.user_id == user_id,
            OrderScope::Mechanic(mechanic_id) => order.mechanic_id == Some(mechanic_id),
        };

        in_scope && (self.statuses.is_empty() || self.statuses.contains(&order.status))
    }
}

/// Precondition for [`OrderStore::assign_mechanic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignGuard {
    /// Overwrite whatever is recorded.
    Any,
    /// Only an order nobody holds yet, or one already held by the same
    /// mechanic.
    UnassignedOrSameMechanic,
}

impl AssignGuard {
    pub fn admits(&self, order: &ServiceOrder, mechanic_id: i64) -> bool {
        match self {
            AssignGuard::Any => true,
            AssignGuard::UnassignedOrSameMechanic => match order.status {
                OrderStatus::Pending => true,
                OrderStatus::InProgress => {
                    order.mechanic_id.is_none() || order.mechanic_id == Some(mechanic_id)
                }
                _ => false,
            },
        }
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a pending order. Fails with [`StoreError::ActiveOrderExists`]
    /// when the user already holds a pending or in-progress order.
    async fn create(&self, order: NewServiceOrder) -> Result<ServiceOrder, StoreError>;

    async fn get_by_id(&self, order_id: i64) -> Result<ServiceOrder, StoreError>;

    async fn list_active_by_user(&self, user_id: i64) -> Result<Vec<ServiceOrder>, StoreError>;

    async fn list(&self, filter: &OrderFilter) -> Result<Vec<ServiceOrder>, StoreError>;

    /// Sets `status` when the current status is one of `allowed_from`, and
    /// stamps the lifecycle timestamp that belongs to the new status.
    async fn update_status(
        &self,
        order_id: i64,
        status: OrderStatus,
        allowed_from: &[OrderStatus],
    ) -> Result<(), StoreError>;

    /// Sets `mechanic_id` and forces `in_progress` as one write.
    async fn assign_mechanic(
        &self,
        order_id: i64,
        mechanic_id: i64,
        guard: AssignGuard,
    ) -> Result<(), StoreError>;

    fn backend_name(&self) -> &'static str;
}
