use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::models::order::{NewServiceOrder, OrderStatus, ServiceOrder};
use crate::store::{AssignGuard, OrderFilter, OrderScope, OrderStore, StoreError};

const ACTIVE_USER_CONSTRAINT: &str = "uq_service_orders_active_user";

const ORDER_COLUMNS: &str = r#"
    o.order_id, o.service_id, o.user_id, o.mechanic_id, o.created_at, o.started_at,
    o.finished_at, o.cancelled_at, o.status, o.lat, o.lng,
    s.display_name as service_name
"#;

/// Orders joined with the service catalog; `o` and `s` alias the tables.
const ORDER_SOURCE: &str = "service_orders o left join services s on s.service_id = o.service_id";

pub async fn connect(
    url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(url)
        .await
        .map_err(|err| StoreError::Backend(format!("failed to connect to postgres: {err}")))
}

/// Run the embedded migrations under `./migrations`.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| StoreError::Backend(format!("migration failed: {err}")))
}

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

fn map_write_error(err: sqlx::Error, context: &str) -> StoreError {
    if is_unique_violation(&err, ACTIVE_USER_CONSTRAINT) {
        return StoreError::ActiveOrderExists;
    }
    StoreError::Backend(format!("{context}: {err}"))
}

fn order_from_row(row: &PgRow) -> Result<ServiceOrder, StoreError> {
    let decode = |err: sqlx::Error| StoreError::Backend(format!("failed to decode order row: {err}"));

    let status: String = row.try_get("status").map_err(decode)?;
    let status = status
        .parse::<OrderStatus>()
        .map_err(|err| StoreError::Backend(err.to_string()))?;

    Ok(ServiceOrder {
        order_id: row.try_get("order_id").map_err(decode)?,
        service_id: row.try_get("service_id").map_err(decode)?,
        service_name: row.try_get("service_name").map_err(decode)?,
        user_id: row.try_get("user_id").map_err(decode)?,
        mechanic_id: row.try_get("mechanic_id").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        finished_at: row.try_get("finished_at").map_err(decode)?,
        cancelled_at: row.try_get("cancelled_at").map_err(decode)?,
        status,
        lat: row.try_get("lat").map_err(decode)?,
        lng: row.try_get("lng").map_err(decode)?,
    })
}

fn status_strings(statuses: &[OrderStatus]) -> Vec<String> {
    statuses.iter().map(|status| status.as_str().to_string()).collect()
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn create(&self, order: NewServiceOrder) -> Result<ServiceOrder, StoreError> {
        let query = format!(
            r#"
            with o as (
                insert into service_orders (service_id, user_id, created_at, status, lat, lng)
                values ($1, $2, now(), 'pending', $3, $4)
                returning *
            )
            select {ORDER_COLUMNS}
            from o left join services s on s.service_id = o.service_id
            "#
        );

        let row = sqlx::query(&query)
            .bind(order.service_id)
            .bind(order.user_id)
            .bind(order.lat)
            .bind(order.lng)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_write_error(err, "insert into service_orders failed"))?;

        order_from_row(&row)
    }

    async fn get_by_id(&self, order_id: i64) -> Result<ServiceOrder, StoreError> {
        let query = format!("select {ORDER_COLUMNS} from {ORDER_SOURCE} where o.order_id = $1");

        let row = sqlx::query(&query)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| StoreError::Backend(format!("select service order failed: {err}")))?
            .ok_or(StoreError::NotFound)?;

        order_from_row(&row)
    }

    async fn list_active_by_user(&self, user_id: i64) -> Result<Vec<ServiceOrder>, StoreError> {
        let filter = OrderFilter::new(OrderScope::User(user_id)).with_statuses(OrderStatus::ACTIVE);
        self.list(&filter).await
    }

    async fn list(&self, filter: &OrderFilter) -> Result<Vec<ServiceOrder>, StoreError> {
        let (user_id, mechanic_id) = match filter.scope {
            OrderScope::All => (None, None),
            OrderScope::User(id) => (Some(id), None),
            OrderScope::Mechanic(id) => (None, Some(id)),
        };

        let query = format!(
            r#"
            select {ORDER_COLUMNS}
            from {ORDER_SOURCE}
            where ($1::bigint is null or o.user_id = $1)
              and ($2::bigint is null or o.mechanic_id = $2)
              and (cardinality($3::text[]) = 0 or o.status = any($3))
            order by o.order_id
            "#
        );

        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(mechanic_id)
            .bind(status_strings(&filter.statuses))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::Backend(format!("list service orders failed: {err}")))?;

        rows.iter().map(order_from_row).collect()
    }

    async fn update_status(
        &self,
        order_id: i64,
        status: OrderStatus,
        allowed_from: &[OrderStatus],
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            update service_orders
            set status = $1::text,
                started_at = case when $1::text = 'in_progress'
                    then coalesce(started_at, now()) else started_at end,
                finished_at = case when $1::text in ('finished', 'failure')
                    then coalesce(finished_at, now()) else finished_at end,
                cancelled_at = case when $1::text = 'cancelled'
                    then coalesce(cancelled_at, now()) else cancelled_at end
            where order_id = $2
              and status = any($3::text[])
            "#,
        )
        .bind(status.as_str())
        .bind(order_id)
        .bind(status_strings(allowed_from))
        .execute(&self.pool)
        .await
        .map_err(|err| map_write_error(err, "update service order status failed"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NoRowsAffected);
        }

        Ok(())
    }

    async fn assign_mechanic(
        &self,
        order_id: i64,
        mechanic_id: i64,
        guard: AssignGuard,
    ) -> Result<(), StoreError> {
        let guarded = guard == AssignGuard::UnassignedOrSameMechanic;

        let result = sqlx::query(
            r#"
            update service_orders
            set mechanic_id = $1,
                status = 'in_progress',
                started_at = coalesce(started_at, now())
            where order_id = $2
              and (
                not $3::boolean
                or status = 'pending'
                or (status = 'in_progress' and (mechanic_id is null or mechanic_id = $1))
              )
            "#,
        )
        .bind(mechanic_id)
        .bind(order_id)
        .bind(guarded)
        .execute(&self.pool)
        .await
        .map_err(|err| map_write_error(err, "assigning mechanic to order failed"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NoRowsAffected);
        }

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
