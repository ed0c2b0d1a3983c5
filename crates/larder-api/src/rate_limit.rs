//! Fixed-window request limits for the privileged and costly endpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::routes::user_fingerprint;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtectedEndpoint {
    Admin,
    Extraction,
}

impl ProtectedEndpoint {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Extraction => "extraction",
        }
    }
}

/// Per-user windows and outcome counters of one endpoint
struct Bucket {
    limit: u32,
    windows: Mutex<Windows>,
    allowed: AtomicU64,
    limited: AtomicU64,
}

struct Windows {
    by_user: HashMap<String, (Instant, u32)>,
    pruned_at: Instant,
}

impl Bucket {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            windows: Mutex::new(Windows {
                by_user: HashMap::new(),
                pruned_at: Instant::now(),
            }),
            allowed: AtomicU64::new(0),
            limited: AtomicU64::new(0),
        }
    }

    /// Count one request; `Err(retry_after_secs)` once the window is full.
    async fn admit(&self, user_id: &str, window: Duration) -> Result<(), u64> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        // at most one sweep per window keeps the map to recently active users
        if now.duration_since(windows.pruned_at) >= window {
            windows
                .by_user
                .retain(|_, (started, _)| now.duration_since(*started) < window);
            windows.pruned_at = now;
        }

        let (started, count) = windows
            .by_user
            .entry(user_id.to_string())
            .or_insert((now, 0));
        if now.duration_since(*started) >= window {
            *started = now;
            *count = 0;
        }
        if *count >= self.limit {
            self.limited.fetch_add(1, Ordering::Relaxed);
            return Err(window.saturating_sub(now.duration_since(*started)).as_secs());
        }
        *count += 1;
        self.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.windows.lock().await.by_user.len()
    }
}

#[derive(Clone)]
pub struct EndpointRateLimiter {
    window: Duration,
    admin: Arc<Bucket>,
    extraction: Arc<Bucket>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub admin_allowed: u64,
    pub admin_limited: u64,
    pub extraction_allowed: u64,
    pub extraction_limited: u64,
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.admin_rate_limit_per_window,
            config.extraction_rate_limit_per_window,
        )
    }

    fn new(window: Duration, admin_limit: u32, extraction_limit: u32) -> Self {
        Self {
            window,
            admin: Arc::new(Bucket::new(admin_limit)),
            extraction: Arc::new(Bucket::new(extraction_limit)),
        }
    }

    fn bucket(&self, endpoint: ProtectedEndpoint) -> &Bucket {
        match endpoint {
            ProtectedEndpoint::Admin => &self.admin,
            ProtectedEndpoint::Extraction => &self.extraction,
        }
    }

    pub async fn check(&self, endpoint: ProtectedEndpoint, user_id: &str) -> Result<(), AppError> {
        self.bucket(endpoint)
            .admit(user_id, self.window)
            .await
            .map_err(|retry_after_secs| {
                tracing::warn!(
                    endpoint = endpoint.label(),
                    user = user_fingerprint(user_id),
                    retry_after_secs,
                    "Rate limit exceeded"
                );
                AppError::too_many_requests(
                    format!("Too many {} requests, slow down", endpoint.label()),
                    retry_after_secs,
                )
            })
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            admin_allowed: self.admin.allowed.load(Ordering::Relaxed),
            admin_limited: self.admin.limited.load(Ordering::Relaxed),
            extraction_allowed: self.extraction.allowed.load(Ordering::Relaxed),
            extraction_limited: self.extraction.limited.load(Ordering::Relaxed),
        }
    }
}
