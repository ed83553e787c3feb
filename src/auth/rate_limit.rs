use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use chrono::{DateTime, Utc, Duration};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_size: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // One emailed verification code per minute.
        Self {
            window_size: Duration::seconds(60),
            max_requests: 1,
        }
    }
}

#[derive(Debug)]
struct RequestWindow {
    timestamps: Vec<DateTime<Utc>>,
}

impl RequestWindow {
    fn new() -> Self {
        Self {
            timestamps: Vec::new(),
        }
    }

    fn cleanup_old_requests(&mut self, window_size: Duration) {
        let cutoff = Utc::now() - window_size;
        self.timestamps.retain(|ts| *ts > cutoff);
    }

    fn add_request(&mut self) {
        self.timestamps.push(Utc::now());
    }

    fn request_count(&self) -> usize {
        self.timestamps.len()
    }

    fn retry_after(&self, window_size: Duration) -> i64 {
        self.timestamps
            .first()
            .map(|oldest| (*oldest + window_size - Utc::now()).num_seconds().max(1))
            .unwrap_or(0)
    }
}

/// Sliding-window limiter keyed by an arbitrary string (user id, email).
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<String, RequestWindow>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Records the request when allowed. On rejection returns the seconds
    /// until the next request would be accepted.
    pub async fn check_rate_limit(&self, key: &str) -> Result<(), i64> {
        let mut windows = self.windows.write().await;

        let window = windows.entry(key.to_string()).or_insert_with(RequestWindow::new);
        window.cleanup_old_requests(self.config.window_size);

        if window.request_count() < self.config.max_requests as usize {
            window.add_request();
            Ok(())
        } else {
            Err(window.retry_after(self.config.window_size))
        }
    }

    pub async fn cleanup(&self) {
        let mut windows = self.windows.write().await;

        windows.retain(|_, window| {
            window.cleanup_old_requests(self.config.window_size);
            !window.timestamps.is_empty()
        });
    }
}
