use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::queue::{Delivery, MessageQueue, QueueError};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Visibility {
    Ready { visible_at: Instant },
    InFlight { claim_deadline: Instant },
}

#[derive(Debug)]
struct StoredMessage {
    message_id: Uuid,
    queue: String,
    body: Vec<u8>,
    attempt: u32,
    visibility: Visibility,
    claimed_by: Option<String>,
    last_error: Option<String>,
}

impl StoredMessage {
    fn is_held_by(&self, delivery: &Delivery) -> bool {
        self.message_id == delivery.message_id
            && self.attempt == delivery.attempt
            && self.claimed_by.as_deref() == Some(delivery.consumer.as_str())
            && matches!(self.visibility, Visibility::InFlight { .. })
    }
}

#[derive(Debug)]
struct DeadLetter {
    message_id: Uuid,
    queue: String,
    last_error: Option<String>,
}

/// Only unsettled messages stay in `live`; acknowledged ones are dropped and
/// only counted.
#[derive(Debug, Default)]
struct QueueState {
    live: Vec<StoredMessage>,
    dead: Vec<DeadLetter>,
    acknowledged: HashMap<String, usize>,
}

/// In-process queue with the same claim/visibility semantics as the
/// PostgreSQL queue. Only reachable from within one process.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            visibility_timeout,
        }
    }

    /// Messages not yet acknowledged or dead-lettered.
    pub async fn outstanding(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .live
            .iter()
            .filter(|msg| msg.queue == queue)
            .count()
    }

    pub async fn dead_lettered(&self, queue: &str) -> Vec<(Uuid, Option<String>)> {
        self.state
            .lock()
            .await
            .dead
            .iter()
            .filter(|msg| msg.queue == queue)
            .map(|msg| (msg.message_id, msg.last_error.clone()))
            .collect()
    }

    pub async fn acknowledged(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .acknowledged
            .get(queue)
            .copied()
            .unwrap_or(0)
    }
}

fn claimed_index(state: &QueueState, delivery: &Delivery) -> Result<usize, QueueError> {
    state
        .live
        .iter()
        .position(|msg| msg.is_held_by(delivery))
        .ok_or(QueueError::UnknownDelivery(delivery.message_id))
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<Uuid, QueueError> {
        let message_id = Uuid::new_v4();
        self.state.lock().await.live.push(StoredMessage {
            message_id,
            queue: queue.to_string(),
            body,
            attempt: 0,
            visibility: Visibility::Ready {
                visible_at: Instant::now(),
            },
            claimed_by: None,
            last_error: None,
        });
        Ok(message_id)
    }

    async fn receive(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let claimable = state.live.iter_mut().find(|msg| {
            msg.queue == queue
                && match msg.visibility {
                    Visibility::Ready { visible_at } => visible_at <= now,
                    Visibility::InFlight { claim_deadline } => claim_deadline <= now,
                }
        });

        Ok(claimable.map(|msg| {
            msg.attempt += 1;
            msg.claimed_by = Some(consumer.to_string());
            msg.visibility = Visibility::InFlight {
                claim_deadline: now + self.visibility_timeout,
            };
            Delivery {
                message_id: msg.message_id,
                queue: msg.queue.clone(),
                body: msg.body.clone(),
                attempt: msg.attempt,
                consumer: consumer.to_string(),
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let index = claimed_index(&state, delivery)?;

        let message = state.live.remove(index);
        *state.acknowledged.entry(message.queue).or_insert(0) += 1;
        Ok(())
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        retry_in: Duration,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let index = claimed_index(&state, delivery)?;

        let message = &mut state.live[index];
        message.claimed_by = None;
        message.visibility = Visibility::Ready {
            visible_at: Instant::now() + retry_in,
        };
        message.last_error = Some(error.to_string());
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let index = claimed_index(&state, delivery)?;

        let message = state.live.remove(index);
        state.dead.push(DeadLetter {
            message_id: message.message_id,
            queue: message.queue,
            last_error: Some(error.to_string()),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "assign-order";

    #[tokio::test]
    async fn claimed_message_is_invisible_to_other_consumers() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.publish(QUEUE, b"{}".to_vec()).await.unwrap();

        let first = queue.receive(QUEUE, "a").await.unwrap();
        let second = queue.receive(QUEUE, "b").await.unwrap();

        assert_eq!(first.map(|d| d.attempt), Some(1));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn acknowledged_message_is_never_redelivered() {
        let queue = MemoryQueue::new(Duration::from_millis(1));
        queue.publish(QUEUE, b"{}".to_vec()).await.unwrap();

        let delivery = queue.receive(QUEUE, "a").await.unwrap().unwrap();
        queue.ack(&delivery).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(queue.receive(QUEUE, "a").await.unwrap().is_none());
        assert_eq!(queue.outstanding(QUEUE).await, 0);
        assert_eq!(queue.acknowledged(QUEUE).await, 1);
        assert!(queue.state.lock().await.live.is_empty());
    }

    #[tokio::test]
    async fn previous_holder_cannot_settle_a_reclaimed_message() {
        let queue = MemoryQueue::new(Duration::from_millis(10));
        queue.publish(QUEUE, b"{}".to_vec()).await.unwrap();

        let stale = queue.receive(QUEUE, "a").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let live = queue.receive(QUEUE, "b").await.unwrap().unwrap();
        assert_eq!(live.attempt, 2);

        assert!(matches!(
            queue.nack(&stale, Duration::ZERO, "late").await,
            Err(QueueError::UnknownDelivery(_))
        ));
        assert!(matches!(
            queue.dead_letter(&stale, "late").await,
            Err(QueueError::UnknownDelivery(_))
        ));
        assert!(matches!(
            queue.ack(&stale).await,
            Err(QueueError::UnknownDelivery(_))
        ));

        // The live claim is untouched.
        assert!(queue.receive(QUEUE, "c").await.unwrap().is_none());
        queue.ack(&live).await.unwrap();
        assert_eq!(queue.outstanding(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn expired_claim_is_redelivered_with_next_attempt() {
        let queue = MemoryQueue::new(Duration::from_millis(10));
        queue.publish(QUEUE, b"{}".to_vec()).await.unwrap();

        let first = queue.receive(QUEUE, "crashed").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = queue.receive(QUEUE, "survivor").await.unwrap().unwrap();

        assert_eq!(first.message_id, second.message_id);
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn nacked_message_waits_for_retry_delay() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.publish(QUEUE, b"{}".to_vec()).await.unwrap();

        let delivery = queue.receive(QUEUE, "a").await.unwrap().unwrap();
        queue
            .nack(&delivery, Duration::from_millis(20), "transient")
            .await
            .unwrap();

        assert!(queue.receive(QUEUE, "a").await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(queue.receive(QUEUE, "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dead_lettered_message_is_parked() {
        let queue = MemoryQueue::new(Duration::from_millis(1));
        queue.publish(QUEUE, b"not json".to_vec()).await.unwrap();

        let delivery = queue.receive(QUEUE, "a").await.unwrap().unwrap();
        queue.dead_letter(&delivery, "undecodable").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(queue.receive(QUEUE, "a").await.unwrap().is_none());
        let parked = queue.dead_lettered(QUEUE).await;
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].1.as_deref(), Some("undecodable"));
    }

    #[tokio::test]
    async fn queues_are_isolated_by_name() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.publish("other", b"{}".to_vec()).await.unwrap();

        assert!(queue.receive(QUEUE, "a").await.unwrap().is_none());
    }
}
