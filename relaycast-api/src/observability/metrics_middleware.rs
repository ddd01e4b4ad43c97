//! Axum middleware for collecting HTTP request metrics.

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

use relaycast_core::metrics;

/// Middleware that records HTTP request count and duration per matched route.
pub async fn metrics_layer(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |path| path.as_str().to_string());

    let start = Instant::now();
    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&[&endpoint, &method, &status])
        .inc();
    metrics::HTTP_REQUEST_DURATION
        .with_label_values(&[&endpoint, &method, &status])
        .observe(duration);

    response
}
