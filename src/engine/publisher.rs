use std::sync::Arc;

use tracing::{debug, error};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::order::ServiceOrder;
use crate::observability::metrics::Metrics;
use crate::queue::{MessageQueue, ASSIGN_ORDER_QUEUE};

/// Hands freshly stored orders to the assignment consumer. Publishing is a
/// separate write from the insert: a failure here leaves the order pending
/// with no message behind it.
pub struct AssignmentPublisher {
    queue: Arc<dyn MessageQueue>,
    metrics: Metrics,
}

impl AssignmentPublisher {
    pub fn new(queue: Arc<dyn MessageQueue>, metrics: Metrics) -> Self {
        Self { queue, metrics }
    }

    pub async fn publish(&self, order: &ServiceOrder) -> Result<Uuid, AppError> {
        let body = serde_json::to_vec(order).map_err(|err| {
            self.metrics
                .order_publish_total
                .with_label_values(&["serialize_error"])
                .inc();
            AppError::Internal(format!("failed to serialize order {}: {err}", order.order_id))
        })?;

        match self.queue.publish(ASSIGN_ORDER_QUEUE, body).await {
            Ok(message_id) => {
                self.metrics
                    .order_publish_total
                    .with_label_values(&["published"])
                    .inc();
                debug!(order_id = order.order_id, %message_id, "assignment message published");
                Ok(message_id)
            }
            Err(err) => {
                self.metrics
                    .order_publish_total
                    .with_label_values(&["error"])
                    .inc();
                error!(
                    order_id = order.order_id,
                    error = %err,
                    "failed to publish assignment message; order stays pending"
                );
                Err(err.into())
            }
        }
    }
}
