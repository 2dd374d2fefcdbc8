use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Static limiter configuration, immutable after construction.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    pub request_limit: usize,
    pub window_seconds: u64,
}

/// One accepted request inside the sliding window.
#[derive(Debug, Clone)]
struct WindowEntry {
    id: String,
    recorded_at: Instant,
}

/// Health classification derived from utilization.
/// Bands are inclusive on their lower bound: < 70 healthy,
/// 70..90 approaching, >= 90 throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitHealth {
    Healthy,
    Approaching,
    Throttled,
}

impl RateLimitHealth {
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 70.0 {
            RateLimitHealth::Healthy
        } else if utilization < 90.0 {
            RateLimitHealth::Approaching
        } else {
            RateLimitHealth::Throttled
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub current_count: usize,
    pub limit: usize,
    pub window_seconds: u64,
    /// 0-100, one decimal place.
    pub utilization: f64,
    /// Time until the oldest in-window entry ages out, 0 while under the limit.
    pub estimated_wait_ms: u64,
}

impl RateLimitStatus {
    pub fn health(&self) -> RateLimitHealth {
        RateLimitHealth::from_utilization(self.utilization)
    }
}

/// Sliding-window request tracker. The sole authority the dispatcher
/// consults before sending work to the provider.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Arc<Mutex<VecDeque<WindowEntry>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn window_duration(&self) -> Duration {
        Duration::from_secs(self.config.window_seconds)
    }

    /// Record an accepted request and prune entries that fell out of the window.
    pub fn add_request(&self, id: impl Into<String>) {
        let entry = WindowEntry {
            id: id.into(),
            recorded_at: Instant::now(),
        };
        tracing::trace!("rate window recorded request {}", entry.id);

        let mut window = self.window.lock().unwrap();
        window.push_back(entry);
        Self::prune(&mut window, self.window_duration());
    }

    fn prune(window: &mut VecDeque<WindowEntry>, ttl: Duration) {
        while let Some(front) = window.front() {
            if front.recorded_at.elapsed() >= ttl {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn status(&self) -> RateLimitStatus {
        let mut window = self.window.lock().unwrap();
        Self::prune(&mut window, self.window_duration());

        let current_count = window.len();
        let limit = self.config.request_limit;
        let raw = if limit == 0 {
            100.0
        } else {
            (current_count as f64 / limit as f64 * 1000.0).round() / 10.0
        };
        let utilization = raw.min(100.0);

        let estimated_wait_ms = if current_count >= limit {
            window
                .front()
                .map(|oldest| {
                    self.window_duration()
                        .saturating_sub(oldest.recorded_at.elapsed())
                        .as_millis() as u64
                })
                .unwrap_or(0)
        } else {
            0
        };

        RateLimitStatus {
            current_count,
            limit,
            window_seconds: self.config.window_seconds,
            utilization,
            estimated_wait_ms,
        }
    }

    pub fn has_capacity(&self) -> bool {
        let status = self.status();
        status.current_count < status.limit
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }
}
