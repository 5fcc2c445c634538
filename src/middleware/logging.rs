//! Request logging middleware: method, path, status, latency.

use axum::{
    body::Body,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{info, warn};

/// Logs every request at INFO, errors at WARN. Health checks are skipped to
/// keep the log usable.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(%method, %path, status, latency_ms, "Request failed");
    } else {
        info!(%method, %path, status, latency_ms, "Request completed");
    }

    response
}
