use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::queue::{Delivery, MessageQueue, QueueError};

/// Queue backed by the `queue_messages` table. Claims use
/// `FOR UPDATE SKIP LOCKED`, so any number of consumers may poll the same
/// queue without receiving the same message concurrently.
pub struct PgQueue {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }
}

fn backend(context: &str) -> impl Fn(sqlx::Error) -> QueueError + '_ {
    move |err| QueueError::Backend(format!("{context}: {err}"))
}

fn claimed_attempt(delivery: &Delivery) -> i32 {
    i32::try_from(delivery.attempt).unwrap_or(i32::MAX)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl MessageQueue for PgQueue {
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<Uuid, QueueError> {
        let message_id = Uuid::new_v4();

        sqlx::query(
            r#"
            insert into queue_messages (message_id, queue, body)
            values ($1, $2, $3)
            "#,
        )
        .bind(message_id)
        .bind(queue)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(backend("publish failed"))?;

        Ok(message_id)
    }

    async fn receive(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        // An expired claim is treated as visible again: the claimer crashed.
        let row = sqlx::query(
            r#"
            with claimable as (
                select message_id
                from queue_messages
                where queue = $1
                  and processed_at is null
                  and failed_at is null
                  and visible_at <= now()
                  and (claimed_by is null or claim_timeout_at < now())
                order by created_at
                limit 1
                for update skip locked
            )
            update queue_messages m
            set claimed_by = $2,
                claim_timeout_at = now() + ($3::bigint * interval '1 millisecond'),
                attempt_count = attempt_count + 1
            from claimable c
            where m.message_id = c.message_id
            returning m.message_id, m.queue, m.body, m.attempt_count
            "#,
        )
        .bind(queue)
        .bind(consumer)
        .bind(millis(self.visibility_timeout))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend("claim failed"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let attempt: i32 = row.try_get("attempt_count").map_err(backend("decode failed"))?;
        Ok(Some(Delivery {
            message_id: row.try_get("message_id").map_err(backend("decode failed"))?,
            queue: row.try_get("queue").map_err(backend("decode failed"))?,
            body: row.try_get("body").map_err(backend("decode failed"))?,
            attempt: u32::try_from(attempt).unwrap_or(0),
            consumer: consumer.to_string(),
        }))
    }

    // Settling only matches the row while `delivery` still holds its claim;
    // after a re-claim the previous holder affects no rows.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            update queue_messages
            set processed_at = now()
            where message_id = $1
              and claimed_by = $2
              and attempt_count = $3
              and processed_at is null
              and failed_at is null
            "#,
        )
        .bind(delivery.message_id)
        .bind(&delivery.consumer)
        .bind(claimed_attempt(delivery))
        .execute(&self.pool)
        .await
        .map_err(backend("ack failed"))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(delivery.message_id));
        }
        Ok(())
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        retry_in: Duration,
        error: &str,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            update queue_messages
            set claimed_by = null,
                claim_timeout_at = null,
                visible_at = now() + ($4::bigint * interval '1 millisecond'),
                last_error = $5
            where message_id = $1
              and claimed_by = $2
              and attempt_count = $3
              and processed_at is null
              and failed_at is null
            "#,
        )
        .bind(delivery.message_id)
        .bind(&delivery.consumer)
        .bind(claimed_attempt(delivery))
        .bind(millis(retry_in))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(backend("nack failed"))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(delivery.message_id));
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            update queue_messages
            set failed_at = now(),
                last_error = $4
            where message_id = $1
              and claimed_by = $2
              and attempt_count = $3
              and processed_at is null
              and failed_at is null
            "#,
        )
        .bind(delivery.message_id)
        .bind(&delivery.consumer)
        .bind(claimed_attempt(delivery))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(backend("dead-letter failed"))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(delivery.message_id));
        }
        Ok(())
    }
}
