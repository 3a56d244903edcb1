use std::sync::Arc;

use axum::extract::FromRef;

use crate::auth::Authenticator;
use crate::config::TransitionPolicy;
use crate::engine::publisher::AssignmentPublisher;
use crate::observability::metrics::Metrics;
use crate::queue::MessageQueue;
use crate::ratelimit::RateLimiter;
use crate::store::OrderStore;

pub struct AppState {
    pub store: Arc<dyn OrderStore>,
    pub publisher: AssignmentPublisher,
    pub authenticator: Arc<dyn Authenticator>,
    pub rate_limiter: RateLimiter,
    pub transition_policy: TransitionPolicy,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        store: Arc<dyn OrderStore>,
        queue: Arc<dyn MessageQueue>,
        authenticator: Arc<dyn Authenticator>,
        rate_limiter: RateLimiter,
        transition_policy: TransitionPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            publisher: AssignmentPublisher::new(queue, metrics.clone()),
            authenticator,
            rate_limiter,
            transition_policy,
            metrics,
        }
    }
}

impl FromRef<Arc<AppState>> for Metrics {
    fn from_ref(state: &Arc<AppState>) -> Self {
        state.metrics.clone()
    }
}
