use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub orders_created_total: IntCounter,
    pub order_publish_total: IntCounterVec,
    pub order_transitions_total: IntCounterVec,
    pub mechanic_assignments_total: IntCounterVec,
    pub consumer_messages_total: IntCounterVec,
    pub consumer_processing_seconds: HistogramVec,
    pub rate_limited_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let orders_created_total =
            IntCounter::new("orders_created_total", "Service orders accepted by intake")
                .expect("valid orders_created_total metric");

        let order_publish_total = IntCounterVec::new(
            Opts::new("order_publish_total", "Assignment messages published by outcome"),
            &["outcome"],
        )
        .expect("valid order_publish_total metric");

        let order_transitions_total = IntCounterVec::new(
            Opts::new("order_transitions_total", "Status patches by outcome"),
            &["outcome"],
        )
        .expect("valid order_transitions_total metric");

        let mechanic_assignments_total = IntCounterVec::new(
            Opts::new(
                "mechanic_assignments_total",
                "Mechanic assignment attempts by outcome",
            ),
            &["outcome"],
        )
        .expect("valid mechanic_assignments_total metric");

        let consumer_messages_total = IntCounterVec::new(
            Opts::new(
                "consumer_messages_total",
                "Assignment messages handled by the consumer, by outcome",
            ),
            &["outcome"],
        )
        .expect("valid consumer_messages_total metric");

        let consumer_processing_seconds = HistogramVec::new(
            HistogramOpts::new(
                "consumer_processing_seconds",
                "Time spent handling one assignment message",
            ),
            &["outcome"],
        )
        .expect("valid consumer_processing_seconds metric");

        let rate_limited_total =
            IntCounter::new("rate_limited_total", "Requests rejected by the rate limiter")
                .expect("valid rate_limited_total metric");

        registry
            .register(Box::new(orders_created_total.clone()))
            .expect("register orders_created_total");
        registry
            .register(Box::new(order_publish_total.clone()))
            .expect("register order_publish_total");
        registry
            .register(Box::new(order_transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(mechanic_assignments_total.clone()))
            .expect("register mechanic_assignments_total");
        registry
            .register(Box::new(consumer_messages_total.clone()))
            .expect("register consumer_messages_total");
        registry
            .register(Box::new(consumer_processing_seconds.clone()))
            .expect("register consumer_processing_seconds");
        registry
            .register(Box::new(rate_limited_total.clone()))
            .expect("register rate_limited_total");

        Self {
            registry,
            orders_created_total,
            order_publish_total,
            order_transitions_total,
            mechanic_assignments_total,
            consumer_messages_total,
            consumer_processing_seconds,
            rate_limited_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

/// `GET /metrics` in the Prometheus text exposition format.
pub async fn metrics_handler(State(metrics): State<Metrics>) -> Response {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
