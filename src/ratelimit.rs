use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::auth::bearer_token;
use crate::error::AppError;
use crate::models::claims::Claims;
use crate::state::AppState;

const ANONYMOUS: &str = "anonymous";

/// Idle buckets are swept once every this many acquisitions.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket per client key. Built once at startup and owned by
/// [`AppState`].
///
/// A bucket that would be full again is indistinguishable from a fresh one,
/// so such buckets are dropped on the periodic sweep and the map only holds
/// clients that were active within the last refill window.
pub struct RateLimiter {
    per_second: f64,
    burst: f64,
    buckets: DashMap<String, Bucket>,
    acquisitions: AtomicU64,
}

impl RateLimiter {
    pub fn new(per_second: f64, burst: f64) -> Self {
        Self {
            per_second: per_second.max(0.0),
            burst: burst.max(1.0),
            buckets: DashMap::new(),
            acquisitions: AtomicU64::new(0),
        }
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        let allowed = {
            let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
                tokens: self.burst,
                refilled_at: now,
            });

            bucket.tokens = self.refilled(&bucket, now);
            bucket.refilled_at = now;

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                true
            } else {
                false
            }
        };

        // The entry guard is released above; `retain` locks every shard.
        if self.acquisitions.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.evict_idle(now);
        }

        allowed
    }

    fn refilled(&self, bucket: &Bucket, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(bucket.refilled_at).as_secs_f64();
        (bucket.tokens + elapsed * self.per_second).min(self.burst)
    }

    /// Drops every bucket that would be full at `now`.
    pub fn evict_idle(&self, now: Instant) {
        self.buckets.retain(|_, bucket| self.refilled(bucket, now) < self.burst);
    }

    /// Number of clients currently tracked.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Buckets are keyed by the authenticated identity; requests without a
/// valid token share the bucket of their peer address. Resolved claims are
/// stashed in the request extensions for the `Authenticated` extractor.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);

    let claims = match token {
        Some(token) => state.authenticator.authenticate(token).await.ok(),
        None => None,
    };

    let key = match claims {
        Some(claims) => {
            request.extensions_mut().insert::<Claims>(claims);
            format!("{}:{}", claims.client_type, claims.client_id)
        }
        None => peer_key(&request),
    };

    if !state.rate_limiter.try_acquire(&key) {
        state.metrics.rate_limited_total.inc();
        return Err(AppError::RateLimited);
    }

    Ok(next.run(request).await)
}

fn peer_key(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| format!("ip:{}", addr.ip()))
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;

    use super::*;

    #[test]
    fn burst_is_spent_then_refilled() {
        let limiter = RateLimiter::new(2.0, 3.0);
        let start = Instant::now();

        assert!(limiter.try_acquire_at("a", start));
        assert!(limiter.try_acquire_at("a", start));
        assert!(limiter.try_acquire_at("a", start));
        assert!(!limiter.try_acquire_at("a", start));

        assert!(limiter.try_acquire_at("a", start + Duration::from_millis(500)));
        assert!(!limiter.try_acquire_at("a", start + Duration::from_millis(500)));
    }

    #[test]
    fn clients_have_independent_buckets() {
        let limiter = RateLimiter::new(0.0, 1.0);
        let now = Instant::now();

        assert!(limiter.try_acquire_at("a", now));
        assert!(!limiter.try_acquire_at("a", now));
        assert!(limiter.try_acquire_at("b", now));
    }

    #[test]
    fn refilled_buckets_are_evicted() {
        let limiter = RateLimiter::new(1.0, 2.0);
        let start = Instant::now();

        assert!(limiter.try_acquire_at("a", start));
        assert!(limiter.try_acquire_at("b", start + Duration::from_millis(600)));
        assert_eq!(limiter.len(), 2);

        limiter.evict_idle(start + Duration::from_millis(1_200));
        assert_eq!(limiter.len(), 1);

        limiter.evict_idle(start + Duration::from_secs(2));
        assert!(limiter.is_empty());
    }

    #[test]
    fn sweep_runs_while_acquiring() {
        let limiter = RateLimiter::new(1.0, 5.0);
        let start = Instant::now();

        for client in 0..SWEEP_EVERY - 1 {
            assert!(limiter.try_acquire_at(&format!("client-{client}"), start));
        }
        assert_eq!(limiter.len(), (SWEEP_EVERY - 1) as usize);

        assert!(limiter.try_acquire_at("late", start + Duration::from_secs(10)));
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn anonymous_requests_are_keyed_by_peer_address() {
        let mut request = Request::new(Body::empty());
        assert_eq!(peer_key(&request), ANONYMOUS);

        let addr: SocketAddr = "10.0.0.7:51000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        assert_eq!(peer_key(&request), "ip:10.0.0.7");
    }
}
