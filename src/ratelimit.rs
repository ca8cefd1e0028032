// ===============================
// src/ratelimit.rs
// ===============================
//
// Two layers of pacing in front of every signed call:
// - RateLimiter: sliding one-second window with a steady rate and a burst
//   cap, one bucket for placements and one for cancellations.
// - RequestPacer: minimum inter-request spacing (1000 / max_per_second ms)
//   applied by the exchange adapter immediately before the wire call.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const WINDOW: Duration = Duration::from_secs(1);
const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterStats {
    pub requests_in_window: usize,
    pub is_limited: bool,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_per_second: usize,
    burst_size: usize,
    requests: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_per_second: usize, burst_size: usize) -> Self {
        Self {
            max_per_second: max_per_second.max(1),
            burst_size: burst_size.max(1),
            requests: Mutex::new(VecDeque::new()),
        }
    }

    /// Non-blocking admit test.
    pub fn can_request(&self) -> bool {
        let mut requests = self.requests.lock();
        Self::evict_expired(&mut requests);
        requests.len() < self.burst_size && requests.len() < self.max_per_second
    }

    /// Blocking wait for an admit slot. The caller records the request
    /// separately once it actually goes out.
    pub async fn wait_if_needed(&self) {
        while !self.can_request() {
            sleep(WAIT_POLL).await;
        }
    }

    pub fn record_request(&self) {
        self.requests.lock().push_back(Instant::now());
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut requests = self.requests.lock();
        Self::evict_expired(&mut requests);
        let in_window = requests.len();
        RateLimiterStats {
            requests_in_window: in_window,
            is_limited: in_window >= self.max_per_second,
        }
    }

    pub fn reset(&self) {
        self.requests.lock().clear();
    }

    fn evict_expired(requests: &mut VecDeque<Instant>) {
        let Some(cutoff) = Instant::now().checked_sub(WINDOW) else {
            return;
        };
        while requests.front().is_some_and(|t| *t < cutoff) {
            requests.pop_front();
        }
    }
}

/// The two order-flow buckets, owned by the supervisor and handed to the
/// adapter as plain context.
#[derive(Debug)]
pub struct OrderRateLimiters {
    pub place: RateLimiter,
    pub cancel: RateLimiter,
}

impl OrderRateLimiters {
    pub fn new(max_orders_per_second: usize) -> Self {
        Self {
            place: RateLimiter::new(max_orders_per_second, max_orders_per_second * 2),
            cancel: RateLimiter::new(max_orders_per_second * 2, max_orders_per_second * 4),
        }
    }

    pub fn log_status(&self) {
        let p = self.place.stats();
        let c = self.cancel.stats();
        tracing::debug!(
            places_in_window = p.requests_in_window,
            cancels_in_window = c.requests_in_window,
            throttled = p.is_limited || c.is_limited,
            "rate limiter status"
        );
    }
}

/// Minimum spacing between consecutive signed requests. The delay is
/// reserved under the lock and slept outside it so concurrent callers
/// queue up behind each other instead of stampeding.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_allowed: Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(max_requests_per_second: u32) -> Self {
        let per_second = max_requests_per_second.max(1) as u64;
        Self {
            min_interval: Duration::from_millis(1000 / per_second),
            next_allowed: Mutex::new(Instant::now()),
        }
    }

    fn reserve_delay(&self) -> Duration {
        let now = Instant::now();
        let mut next_allowed = self.next_allowed.lock();
        let delay = next_allowed.saturating_duration_since(now);
        let base = if *next_allowed > now { *next_allowed } else { now };
        *next_allowed = base + self.min_interval;
        delay
    }

    pub async fn pace(&self) {
        let delay = self.reserve_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}
