use std::net::SocketAddr;
use std::sync::Arc;

use order_dispatch::api;
use order_dispatch::auth::StaticTokenAuthenticator;
use order_dispatch::config::Config;
use order_dispatch::engine::consumer::{run_assignment_consumer, ConsumerContext};
use order_dispatch::error::AppError;
use order_dispatch::notify::LogNotifier;
use order_dispatch::observability::{init_tracing, metrics::Metrics};
use order_dispatch::queue::memory::MemoryQueue;
use order_dispatch::queue::postgres::PgQueue;
use order_dispatch::queue::MessageQueue;
use order_dispatch::ratelimit::RateLimiter;
use order_dispatch::state::AppState;
use order_dispatch::store::memory::MemoryOrderStore;
use order_dispatch::store::postgres::{self, PgOrderStore};
use order_dispatch::store::users::{MemoryUserDirectory, PgUserDirectory, UserDirectory};
use order_dispatch::store::OrderStore;
use tokio::sync::watch;

struct Backends {
    store: Arc<dyn OrderStore>,
    queue: Arc<dyn MessageQueue>,
    users: Arc<dyn UserDirectory>,
}

async fn backends(config: &Config) -> Result<Backends, AppError> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set; orders and queue live in memory");
        return Ok(Backends {
            store: Arc::new(MemoryOrderStore::new()),
            queue: Arc::new(MemoryQueue::new(config.queue_visibility_timeout)),
            users: Arc::new(MemoryUserDirectory::new()),
        });
    };

    let pool = postgres::connect(url, config.db_max_connections, config.db_acquire_timeout).await?;
    postgres::migrate(&pool).await?;
    tracing::info!("connected to postgres");

    Ok(Backends {
        store: Arc::new(PgOrderStore::new(pool.clone())),
        queue: Arc::new(PgQueue::new(pool.clone(), config.queue_visibility_timeout)),
        users: Arc::new(PgUserDirectory::new(pool)),
    })
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level, config.log_format);

    let backends = backends(&config).await?;
    let metrics = Metrics::new();

    let authenticator = StaticTokenAuthenticator::parse(&config.auth_tokens)
        .map_err(|err| AppError::Internal(format!("invalid AUTH_TOKENS: {err}")))?;
    if authenticator.is_empty() {
        tracing::warn!("AUTH_TOKENS is empty; every request will be rejected");
    }

    let app_state = AppState::new(
        backends.store.clone(),
        backends.queue.clone(),
        Arc::new(authenticator),
        RateLimiter::new(config.rate_limit.per_second, config.rate_limit.burst),
        config.transition_policy,
        metrics.clone(),
    );
    let shared_state = Arc::new(app_state);

    let app = api::rest::router(shared_state.clone());

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let consumer = if config.runs_embedded_assigner() {
        let ctx = Arc::new(ConsumerContext::new(
            backends.queue,
            backends.store,
            backends.users,
            Arc::new(LogNotifier),
            metrics,
            config.assigner.clone(),
        ));
        Some(tokio::spawn(run_assignment_consumer(ctx, async move {
            let _ = shutdown_rx.changed().await;
        })))
    } else {
        None
    };

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        embedded_assigner = consumer.is_some(),
        policy = ?config.transition_policy,
        "http server started"
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    let _ = shutdown_tx.send(true);
    if let Some(consumer) = consumer {
        if let Err(err) = consumer.await {
            tracing::error!(error = %err, "assignment consumer task failed");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
