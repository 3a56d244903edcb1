//! Push notifications to mechanics.
//!
//! Delivery to devices and topics is handled by an external push gateway;
//! [`Notifier`] is the seam. Every notification carries an idempotency key
//! so a gateway can collapse the duplicates that at-least-once delivery
//! produces.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::models::order::ServiceOrder;

pub const MECHANIC_TOPIC: &str = "mechanic";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub topic: String,
    pub title: String,
    pub body: String,
    pub order_id: i64,
    pub idempotency_key: String,
}

impl Notification {
    /// Broadcast announcing a new order to every mechanic.
    pub fn new_order(order: &ServiceOrder) -> Self {
        Self {
            topic: MECHANIC_TOPIC.to_string(),
            title: "New order!".to_string(),
            body: "A new service order is available".to_string(),
            order_id: order.order_id,
            idempotency_key: format!("new-order-{}", order.order_id),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of a push gateway.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            topic = %notification.topic,
            order_id = notification.order_id,
            idempotency_key = %notification.idempotency_key,
            title = %notification.title,
            "notification sent"
        );
        Ok(())
    }
}

/// Keeps every notification in memory; can be told to fail the first
/// `n` deliveries.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failures_remaining: AtomicU32,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: u32) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures_remaining: AtomicU32::new(times),
        }
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();

        if should_fail {
            return Err(NotifyError::Delivery("push gateway unavailable".to_string()));
        }

        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}
