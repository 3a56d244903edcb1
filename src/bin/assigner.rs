//! Standalone assignment consumer. Scales independently of the API; every
//! replica polls the same PostgreSQL-backed queue.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use order_dispatch::config::Config;
use order_dispatch::engine::consumer::{run_assignment_consumer, ConsumerContext};
use order_dispatch::error::AppError;
use order_dispatch::notify::LogNotifier;
use order_dispatch::observability::init_tracing;
use order_dispatch::observability::metrics::{metrics_handler, Metrics};
use order_dispatch::queue::postgres::PgQueue;
use order_dispatch::store::postgres::{self, PgOrderStore};
use order_dispatch::store::users::PgUserDirectory;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level, config.log_format);

    let url = config.database_url.as_deref().ok_or_else(|| {
        AppError::Internal("DATABASE_URL is required to run the assigner".to_string())
    })?;

    let pool = postgres::connect(url, config.db_max_connections, config.db_acquire_timeout).await?;
    postgres::migrate(&pool).await?;

    let metrics = Metrics::new();
    let ctx = Arc::new(ConsumerContext::new(
        Arc::new(PgQueue::new(pool.clone(), config.queue_visibility_timeout)),
        Arc::new(PgOrderStore::new(pool.clone())),
        Arc::new(PgUserDirectory::new(pool)),
        Arc::new(LogNotifier),
        metrics.clone(),
        config.assigner.clone(),
    ));

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(run_assignment_consumer(ctx, async move {
        let _ = shutdown_rx.changed().await;
    }));

    let bind_addr = format!("0.0.0.0:{}", config.assigner.metrics_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    tracing::info!(
        metrics_port = config.assigner.metrics_port,
        consumer_id = %config.assigner.consumer_id,
        "assigner started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await
        .map_err(|err| AppError::Internal(format!("metrics server error: {err}")))?;

    let _ = shutdown_tx.send(true);
    consumer
        .await
        .map_err(|err| AppError::Internal(format!("assignment consumer task failed: {err}")))?;

    Ok(())
}
