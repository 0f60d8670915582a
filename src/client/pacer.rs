//! Per-host request pacing with 429 backoff.
//!
//! Epistemic foundation:
//! - K_i: Remote sites tolerate a fixed request interval
//! - K_i: 429 responses require exponential backoff (capped at 60s)
//! - B_i: Tolerated rates differ by host
//! - I^B: Actual limits unknowable until a 429 arrives

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Pacing state for a single host.
#[derive(Debug, Default)]
pub struct HostPaceState {
    /// When the last request was sent
    pub last_request: Option<Instant>,
    /// Consecutive 429 errors (for backoff)
    pub consecutive_429s: u32,
    /// Backoff until this time
    pub backoff_until: Option<Instant>,
}

impl HostPaceState {
    /// Time to wait at `now` before the next request may go out.
    pub fn wait_time(&self, interval: Duration, now: Instant) -> Duration {
        let mut wait = Duration::ZERO;

        if let Some(last) = self.last_request {
            let ready_at = last + interval;
            if ready_at > now {
                wait = wait.max(ready_at - now);
            }
        }

        if let Some(backoff_until) = self.backoff_until.filter(|&t| t > now) {
            wait = wait.max(backoff_until - now);
        }

        wait
    }

    /// Record a 429 error and calculate backoff.
    pub fn record_429(&mut self, now: Instant) {
        self.consecutive_429s += 1;
        let backoff_secs = 2.0_f64.powi(self.consecutive_429s as i32).min(60.0);
        self.backoff_until = Some(now + Duration::from_secs_f64(backoff_secs));
        warn!(
            consecutive_429s = self.consecutive_429s,
            backoff_secs, "Rate limited (429), backing off"
        );
    }

    /// Record a successful request.
    pub fn record_success(&mut self) {
        if self.consecutive_429s > 0 {
            self.consecutive_429s = 0;
            self.backoff_until = None;
        }
    }
}

/// Sequential request pacer shared by all sources.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    states: DashMap<String, HostPaceState>,
    total_requests: AtomicU64,
    total_429s: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            states: DashMap::new(),
            total_requests: AtomicU64::new(0),
            total_429s: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until a request to `host` may be sent, then claim the slot.
    ///
    /// Returns the duration waited.
    pub async fn wait_turn(&self, host: &str) -> Duration {
        let wait = {
            let state = self.states.entry(host.to_string()).or_default();
            state.wait_time(self.interval, Instant::now())
        };

        if wait > Duration::ZERO {
            debug!(host, wait_ms = wait.as_millis() as u64, "Pacing request");
            self.total_wait_ms
                .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait).await;
        }

        self.states
            .entry(host.to_string())
            .or_default()
            .last_request = Some(Instant::now());
        wait
    }

    /// Record the status of a completed request.
    pub fn record_response(&self, host: &str, status: u16) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut state = self.states.entry(host.to_string()).or_default();

        if status == 429 {
            self.total_429s.fetch_add(1, Ordering::Relaxed);
            state.record_429(Instant::now());
        } else if status < 400 {
            state.record_success();
        }
    }

    pub fn stats(&self) -> PacerStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_429s = self.total_429s.load(Ordering::Relaxed);

        PacerStats {
            total_requests,
            total_429s,
            total_wait_secs: self.total_wait_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            rate_limit_ratio: if total_requests > 0 {
                total_429s as f64 / total_requests as f64
            } else {
                0.0
            },
            hosts_tracked: self.states.len(),
        }
    }
}

/// Pacer statistics.
#[derive(Debug, Clone)]
pub struct PacerStats {
    pub total_requests: u64,
    pub total_429s: u64,
    pub total_wait_secs: f64,
    pub rate_limit_ratio: f64,
    pub hosts_tracked: usize,
}
