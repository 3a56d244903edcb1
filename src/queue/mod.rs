//! Durable message channel between the API and the assignment consumer.
//!
//! Delivery is at-least-once: a claimed message stays invisible to other
//! consumers until it is acknowledged, negatively acknowledged, or its
//! visibility timeout expires. Settling is fenced by the claim: once another
//! consumer has re-claimed a message, the previous holder's
//! `ack`/`nack`/`dead_letter` fails with [`QueueError::UnknownDelivery`].

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Queue carrying freshly created orders to the assignment consumer.
pub const ASSIGN_ORDER_QUEUE: &str = "assign-order";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown delivery {0}")]
    UnknownDelivery(Uuid),

    #[error("queue backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: Uuid,
    pub queue: String,
    pub body: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    /// Consumer holding the claim this delivery belongs to.
    pub consumer: String,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<Uuid, QueueError>;

    /// Claims the next visible message, if any. Never blocks waiting for one.
    async fn receive(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Releases the claim; the message becomes visible again after `retry_in`.
    async fn nack(
        &self,
        delivery: &Delivery,
        retry_in: Duration,
        error: &str,
    ) -> Result<(), QueueError>;

    /// Parks the message permanently; it is never delivered again.
    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError>;
}
