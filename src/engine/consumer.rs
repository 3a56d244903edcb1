//! Assignment consumer.
//!
//! Drains the assignment queue and broadcasts each still-pending order to
//! mechanics. A message is acknowledged only after the notification went
//! out; failures are retried with exponential backoff and parked on the
//! dead-letter state once `max_attempts` deliveries have failed.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::{sleep, Instant as Clock};
use tracing::{debug, error, info, warn};

use crate::config::AssignerConfig;
use crate::models::order::{OrderStatus, ServiceOrder};
use crate::notify::{Notification, Notifier, NotifyError};
use crate::observability::metrics::Metrics;
use crate::queue::{Delivery, MessageQueue, ASSIGN_ORDER_QUEUE};
use crate::store::users::UserDirectory;
use crate::store::{OrderStore, StoreError};

#[derive(Debug, Error)]
enum ProcessError {
    #[error("malformed assignment message: {0}")]
    Poison(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Notify(#[from] NotifyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Notified,
    /// This replica already notified for the order; a redelivery.
    Duplicate,
    /// The order is gone or no longer pending.
    Stale,
    Retried,
    DeadLettered,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Notified => "notified",
            Outcome::Duplicate => "duplicate",
            Outcome::Stale => "stale",
            Outcome::Retried => "retried",
            Outcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Orders remembered as notified, before the oldest are forgotten.
const NOTIFIED_CAPACITY: usize = 10_000;
/// How long a notified order is remembered once the set is full.
const NOTIFIED_TTL: Duration = Duration::from_secs(60 * 60);

pub struct ConsumerContext {
    pub queue: Arc<dyn MessageQueue>,
    pub store: Arc<dyn OrderStore>,
    pub users: Arc<dyn UserDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Metrics,
    pub config: AssignerConfig,
    notified: DashMap<i64, Clock>,
    notified_capacity: usize,
}

impl ConsumerContext {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn OrderStore>,
        users: Arc<dyn UserDirectory>,
        notifier: Arc<dyn Notifier>,
        metrics: Metrics,
        config: AssignerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            users,
            notifier,
            metrics,
            config,
            notified: DashMap::new(),
            notified_capacity: NOTIFIED_CAPACITY,
        }
    }

    fn remember_notified(&self, order_id: i64) {
        let now = Clock::now();
        self.notified.insert(order_id, now);
        if self.notified.len() <= self.notified_capacity {
            return;
        }

        self.notified.retain(|_, at| now.duration_since(*at) < NOTIFIED_TTL);
        let excess = self.notified.len().saturating_sub(self.notified_capacity);
        if excess > 0 {
            let mut oldest: Vec<(i64, Clock)> = self
                .notified
                .iter()
                .map(|entry| (*entry.key(), *entry.value()))
                .collect();
            oldest.sort_by_key(|(_, at)| *at);
            for (id, _) in oldest.into_iter().take(excess) {
                self.notified.remove(&id);
            }
        }
    }

    /// Order ids this replica still remembers having notified.
    pub fn notified_len(&self) -> usize {
        self.notified.len()
    }
}

/// Backoff before redelivering a message whose `attempt`-th delivery failed.
pub fn retry_delay(config: &AssignerConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    config
        .retry_base_delay
        .saturating_mul(factor)
        .min(config.retry_max_delay)
}

pub async fn run_assignment_consumer<F>(ctx: Arc<ConsumerContext>, shutdown: F)
where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    info!(consumer_id = %ctx.config.consumer_id, "assignment consumer started");

    loop {
        let received = tokio::select! {
            _ = &mut shutdown => break,
            received = ctx.queue.receive(ASSIGN_ORDER_QUEUE, &ctx.config.consumer_id) => received,
        };

        match received {
            Ok(Some(delivery)) => {
                handle_delivery(&ctx, delivery).await;
                continue;
            }
            Ok(None) => {}
            Err(err) => error!(error = %err, "failed to receive assignment message"),
        }

        tokio::select! {
            _ = &mut shutdown => break,
            _ = sleep(ctx.config.poll_interval) => {}
        }
    }

    info!(consumer_id = %ctx.config.consumer_id, "assignment consumer stopped");
}

/// Processes one delivery and settles it on the queue.
pub async fn handle_delivery(ctx: &ConsumerContext, delivery: Delivery) -> Outcome {
    let start = Instant::now();

    let outcome = match process(ctx, &delivery).await {
        Ok(outcome) => {
            if let Err(err) = ctx.queue.ack(&delivery).await {
                // The claim lapses and the message comes back; the dedupe
                // set turns that redelivery into a no-op.
                error!(message_id = %delivery.message_id, error = %err, "failed to ack assignment message");
            }
            outcome
        }
        Err(ProcessError::Poison(reason)) => {
            warn!(message_id = %delivery.message_id, reason = %reason, "dead-lettering malformed message");
            dead_letter(ctx, &delivery, &reason).await
        }
        Err(err) => {
            let reason = err.to_string();
            if delivery.attempt >= ctx.config.max_attempts {
                error!(
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt,
                    error = %reason,
                    "assignment message exhausted its retries"
                );
                dead_letter(ctx, &delivery, &reason).await
            } else {
                let delay = retry_delay(&ctx.config, delivery.attempt);
                warn!(
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %reason,
                    "assignment message failed; retrying"
                );
                if let Err(err) = ctx.queue.nack(&delivery, delay, &reason).await {
                    error!(message_id = %delivery.message_id, error = %err, "failed to nack assignment message");
                }
                Outcome::Retried
            }
        }
    };

    ctx.metrics
        .consumer_processing_seconds
        .with_label_values(&[outcome.as_str()])
        .observe(start.elapsed().as_secs_f64());
    ctx.metrics
        .consumer_messages_total
        .with_label_values(&[outcome.as_str()])
        .inc();

    outcome
}

async fn dead_letter(ctx: &ConsumerContext, delivery: &Delivery, reason: &str) -> Outcome {
    if let Err(err) = ctx.queue.dead_letter(delivery, reason).await {
        error!(message_id = %delivery.message_id, error = %err, "failed to dead-letter assignment message");
    }
    Outcome::DeadLettered
}

async fn process(ctx: &ConsumerContext, delivery: &Delivery) -> Result<Outcome, ProcessError> {
    let message: ServiceOrder = serde_json::from_slice(&delivery.body)
        .map_err(|err| ProcessError::Poison(err.to_string()))?;
    if message.order_id <= 0 {
        return Err(ProcessError::Poison(format!(
            "invalid order id {}",
            message.order_id
        )));
    }

    // The message is a snapshot; decide on the stored order.
    let order = match ctx.store.get_by_id(message.order_id).await {
        Ok(order) => order,
        Err(StoreError::NotFound) => {
            ctx.notified.remove(&message.order_id);
            debug!(order_id = message.order_id, "order vanished before assignment");
            return Ok(Outcome::Stale);
        }
        Err(err) => return Err(err.into()),
    };

    if order.status != OrderStatus::Pending {
        ctx.notified.remove(&order.order_id);
        debug!(order_id = order.order_id, status = %order.status, "order no longer pending");
        return Ok(Outcome::Stale);
    }

    if ctx.notified.contains_key(&order.order_id) {
        debug!(order_id = order.order_id, "mechanics already notified");
        return Ok(Outcome::Duplicate);
    }

    match ctx.users.find(order.user_id).await {
        Ok(Some(user)) => debug!(
            order_id = order.order_id,
            name = %user.name,
            last_name = %user.last_name,
            "broadcasting order"
        ),
        Ok(None) => debug!(order_id = order.order_id, user_id = order.user_id, "order owner not in directory"),
        Err(err) => warn!(order_id = order.order_id, error = %err, "user lookup failed"),
    }

    ctx.notifier.notify(&Notification::new_order(&order)).await?;
    ctx.remember_notified(order.order_id);

    info!(order_id = order.order_id, "mechanics notified of new order");
    Ok(Outcome::Notified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::order::NewServiceOrder;
    use crate::notify::RecordingNotifier;
    use crate::queue::memory::MemoryQueue;
    use crate::store::memory::MemoryOrderStore;
    use crate::store::users::{MemoryUserDirectory, UserSummary};

    struct Harness {
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryOrderStore>,
        notifier: Arc<RecordingNotifier>,
        ctx: ConsumerContext,
    }

    fn harness(notifier: RecordingNotifier, max_attempts: u32) -> Harness {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
        let store = Arc::new(MemoryOrderStore::new());
        let notifier = Arc::new(notifier);
        let users = MemoryUserDirectory::new();
        users.insert(UserSummary {
            user_id: 7,
            name: "Ana".to_string(),
            last_name: "Lopez".to_string(),
        });

        let config = AssignerConfig {
            max_attempts,
            ..AssignerConfig::default()
        };
        let ctx = ConsumerContext::new(
            queue.clone(),
            store.clone(),
            Arc::new(users),
            notifier.clone(),
            Metrics::new(),
            config,
        );

        Harness {
            queue,
            store,
            notifier,
            ctx,
        }
    }

    async fn pending_order(harness: &Harness) -> ServiceOrder {
        let order = harness
            .store
            .create(NewServiceOrder {
                user_id: 7,
                service_id: 2,
                lat: 19.4,
                lng: -99.1,
            })
            .await
            .unwrap();
        let body = serde_json::to_vec(&order).unwrap();
        harness.queue.publish(ASSIGN_ORDER_QUEUE, body).await.unwrap();
        order
    }

    async fn next(harness: &Harness) -> Delivery {
        harness
            .queue
            .receive(ASSIGN_ORDER_QUEUE, "test")
            .await
            .unwrap()
            .expect("a visible message")
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let config = AssignerConfig {
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(500),
            ..AssignerConfig::default()
        };

        assert_eq!(retry_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(400));
        assert_eq!(retry_delay(&config, 4), Duration::from_millis(500));
        assert_eq!(retry_delay(&config, 40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn notifies_pending_order_and_acks() {
        let h = harness(RecordingNotifier::new(), 3);
        let order = pending_order(&h).await;

        let outcome = handle_delivery(&h.ctx, next(&h).await).await;

        assert_eq!(outcome, Outcome::Notified);
        let sent = h.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].order_id, order.order_id);
        assert_eq!(sent[0].topic, "mechanic");
        assert_eq!(h.queue.acknowledged(ASSIGN_ORDER_QUEUE).await, 1);
    }

    #[tokio::test]
    async fn acks_without_notifying_when_order_moved_on() {
        let h = harness(RecordingNotifier::new(), 3);
        let order = pending_order(&h).await;
        h.store
            .update_status(order.order_id, OrderStatus::Cancelled, &[OrderStatus::Pending])
            .await
            .unwrap();

        let outcome = handle_delivery(&h.ctx, next(&h).await).await;

        assert_eq!(outcome, Outcome::Stale);
        assert!(h.notifier.sent().await.is_empty());
        assert_eq!(h.queue.outstanding(ASSIGN_ORDER_QUEUE).await, 0);
    }

    #[tokio::test]
    async fn redelivery_of_notified_order_is_a_duplicate() {
        let h = harness(RecordingNotifier::new(), 3);
        let order = pending_order(&h).await;
        handle_delivery(&h.ctx, next(&h).await).await;

        let body = serde_json::to_vec(&order).unwrap();
        h.queue.publish(ASSIGN_ORDER_QUEUE, body).await.unwrap();
        let outcome = handle_delivery(&h.ctx, next(&h).await).await;

        assert_eq!(outcome, Outcome::Duplicate);
        assert_eq!(h.notifier.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn settled_order_is_forgotten_on_stale_redelivery() {
        let h = harness(RecordingNotifier::new(), 3);
        let order = pending_order(&h).await;
        handle_delivery(&h.ctx, next(&h).await).await;
        assert_eq!(h.ctx.notified_len(), 1);

        h.store
            .update_status(order.order_id, OrderStatus::Cancelled, &[OrderStatus::Pending])
            .await
            .unwrap();
        let body = serde_json::to_vec(&order).unwrap();
        h.queue.publish(ASSIGN_ORDER_QUEUE, body).await.unwrap();

        assert_eq!(handle_delivery(&h.ctx, next(&h).await).await, Outcome::Stale);
        assert_eq!(h.ctx.notified_len(), 0);
        assert_eq!(h.queue.outstanding(ASSIGN_ORDER_QUEUE).await, 0);
    }

    #[tokio::test]
    async fn notified_set_keeps_only_the_newest_orders_past_capacity() {
        let mut h = harness(RecordingNotifier::new(), 3);
        h.ctx.notified_capacity = 2;

        for order_id in 1..=3 {
            h.ctx.remember_notified(order_id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(h.ctx.notified_len(), 2);
        assert!(!h.ctx.notified.contains_key(&1));
        assert!(h.ctx.notified.contains_key(&3));
    }

    #[tokio::test]
    async fn malformed_message_is_dead_lettered_at_once() {
        let h = harness(RecordingNotifier::new(), 5);
        h.queue
            .publish(ASSIGN_ORDER_QUEUE, b"not json".to_vec())
            .await
            .unwrap();

        let outcome = handle_delivery(&h.ctx, next(&h).await).await;

        assert_eq!(outcome, Outcome::DeadLettered);
        assert_eq!(h.queue.dead_lettered(ASSIGN_ORDER_QUEUE).await.len(), 1);
    }

    #[tokio::test]
    async fn notifier_failure_is_retried_then_dead_lettered() {
        let h = harness(RecordingNotifier::failing(10), 2);
        pending_order(&h).await;

        let first = next(&h).await;
        assert_eq!(first.attempt, 1);
        assert_eq!(handle_delivery(&h.ctx, first).await, Outcome::Retried);
        assert_eq!(h.queue.outstanding(ASSIGN_ORDER_QUEUE).await, 1);

        let second = next_after_backoff(&h).await;
        assert_eq!(second.attempt, 2);
        assert_eq!(handle_delivery(&h.ctx, second).await, Outcome::DeadLettered);

        let parked = h.queue.dead_lettered(ASSIGN_ORDER_QUEUE).await;
        assert_eq!(parked.len(), 1);
        assert!(parked[0].1.as_deref().unwrap_or_default().contains("push gateway"));
        assert!(h.notifier.sent().await.is_empty());
    }

    async fn next_after_backoff(h: &Harness) -> Delivery {
        tokio::time::pause();
        tokio::time::advance(h.ctx.config.retry_max_delay + Duration::from_millis(1)).await;
        next(h).await
    }

    #[tokio::test]
    async fn consumer_loop_stops_on_shutdown() {
        let h = harness(RecordingNotifier::new(), 3);
        pending_order(&h).await;

        let ctx = Arc::new(h.ctx);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(run_assignment_consumer(ctx.clone(), async {
            let _ = rx.await;
        }));

        for _ in 0..50 {
            if !h.notifier.sent().await.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let _ = tx.send(());
        task.await.unwrap();

        assert_eq!(h.notifier.sent().await.len(), 1);
    }
}
