use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use fitsave_core::util::fingerprint;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::error::AppError;

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub remaining: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Rate limit exceeded; retry after {retry_after_secs}s")]
pub struct AdmissionRejected {
    pub retry_after_secs: u64,
}

impl From<AdmissionRejected> for AppError {
    fn from(rejected: AdmissionRejected) -> Self {
        Self::too_many_requests(
            "Too many requests, please try again later",
            rejected.retry_after_secs,
        )
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct AdmissionMetricsSnapshot {
    pub allowed: u64,
    pub limited: u64,
    pub tracked_clients: usize,
}

/// Gate in front of mutating endpoints. Swappable for a shared-store limiter.
#[async_trait]
pub trait AdmissionGuard: Send + Sync {
    async fn admit(&self, client_key: &str) -> Result<Admission, AdmissionRejected>;

    async fn metrics_snapshot(&self) -> AdmissionMetricsSnapshot;
}

/// Process-local window counter keyed by client address.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    state: Arc<Mutex<HashMap<String, RateWindow>>>,
    window: Duration,
    limit: u32,
    metrics: Arc<AdmissionMetrics>,
}

#[derive(Default)]
struct AdmissionMetrics {
    allowed: AtomicU64,
    limited: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            window,
            limit,
            metrics: Arc::new(AdmissionMetrics::default()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.rate_limit_window, config.rate_limit_per_window)
    }
}

#[async_trait]
impl AdmissionGuard for SlidingWindowLimiter {
    async fn admit(&self, client_key: &str) -> Result<Admission, AdmissionRejected> {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        guard.retain(|_, entry| now.duration_since(entry.started_at) < self.window);

        let entry = guard.entry(client_key.to_string()).or_insert(RateWindow {
            started_at: now,
            count: 0,
        });
        entry.count = entry.count.saturating_add(1);

        if entry.count > self.limit {
            let left = self
                .window
                .saturating_sub(now.duration_since(entry.started_at));
            let retry_after_secs = (left.as_secs() + u64::from(left.subsec_nanos() > 0)).max(1);
            self.metrics.limited.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                client = fingerprint(client_key),
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(AdmissionRejected { retry_after_secs });
        }

        self.metrics.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(Admission {
            remaining: self.limit - entry.count,
        })
    }

    async fn metrics_snapshot(&self) -> AdmissionMetricsSnapshot {
        AdmissionMetricsSnapshot {
            allowed: self.metrics.allowed.load(Ordering::Relaxed),
            limited: self.metrics.limited.load(Ordering::Relaxed),
            tracked_clients: self.state.lock().await.len(),
        }
    }
}

/// Client address: right-most `X-Forwarded-For` hop, then `X-Real-IP`.
pub fn client_key(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit(',').map(str::trim).find(|hop| !hop.is_empty()));
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_limit_then_rejects_until_window_passes() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60), 10);

        for expected_remaining in (0..10).rev() {
            let admission = limiter.admit("203.0.113.9").await.unwrap();
            assert_eq!(admission.remaining, expected_remaining);
        }

        let rejected = limiter.admit("203.0.113.9").await.unwrap_err();
        assert_eq!(rejected.retry_after_secs, 60);

        tokio::time::advance(Duration::from_secs(45)).await;
        let rejected = limiter.admit("203.0.113.9").await.unwrap_err();
        assert_eq!(rejected.retry_after_secs, 15);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(
            limiter.admit("203.0.113.9").await.unwrap(),
            Admission { remaining: 9 }
        );

        let metrics = limiter.metrics_snapshot().await;
        assert_eq!(metrics.allowed, 11);
        assert_eq!(metrics.limited, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_counted_separately_and_swept() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60), 1);
        limiter.admit("a").await.unwrap();
        limiter.admit("b").await.unwrap();
        assert!(limiter.admit("a").await.is_err());
        assert_eq!(limiter.metrics_snapshot().await.tracked_clients, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.admit("c").await.unwrap();
        assert_eq!(limiter.metrics_snapshot().await.tracked_clients, 1);
    }

    #[test]
    fn client_key_prefers_rightmost_forwarded_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(client_key(&headers), "198.51.100.4");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.1, 203.0.113.9 , "),
        );
        assert_eq!(client_key(&headers), "203.0.113.9");
    }
}
