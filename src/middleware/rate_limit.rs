//! Per-IP sliding-window rate limiting for the HTTP surface.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 300,
            window: Duration::from_secs(60),
        }
    }
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

#[derive(Clone)]
pub struct RateLimitLayer {
    config: RateLimitConfig,
    state: Arc<Mutex<HashMap<IpAddr, WindowEntry>>>,
}

impl RateLimitLayer {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let entry = state.entry(ip).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        if entry.count > self.config.max_requests {
            let reset_at = entry.window_start + self.config.window;
            Err(reset_at.saturating_duration_since(now))
        } else {
            Ok(())
        }
    }

    /// Drop idle windows; called from a background task.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.config.window;
        state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<RateLimitLayer>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match limiter.check(addr.ip()) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            warn!(ip = %addr.ip(), "Rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.as_secs().max(1).to_string())],
                Json(json!({"success": false, "error": "Rate limit exceeded"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_until_limit_then_rejects() {
        let limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: 3,
            window: Duration::from_secs(60),
        });
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        for _ in 0..3 {
            assert!(limiter.check(ip).is_ok());
        }
        assert!(limiter.check(ip).is_err());

        // Another client is unaffected.
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(other).is_ok());
    }

    #[test]
    fn cleanup_drops_idle_entries() {
        let limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: 3,
            window: Duration::from_millis(1),
        });
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        limiter.check(ip).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        limiter.cleanup();
        assert!(limiter.state.lock().is_empty());
    }
}
