//! Sliding-window rate limiter

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

/// Above this many tracked clients, idle windows are swept on each check
const SWEEP_THRESHOLD: usize = 1024;

/// Per-client list of recent admissions, pruned to a rolling window
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    windows: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: HashMap::new(),
        }
    }

    /// Admit one request for `client_id` at `now`
    ///
    /// Returns false when the client already has `limit` admissions inside
    /// the window. Rejected attempts are not recorded.
    pub fn check(&mut self, client_id: &str, now: Instant) -> bool {
        if self.windows.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }

        let window = self.window;
        let hits = self.windows.entry(client_id.to_string()).or_default();
        while let Some(&oldest) = hits.front() {
            if now.duration_since(oldest) >= window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() >= self.limit {
            return false;
        }

        hits.push_back(now);
        true
    }

    /// Admissions still counted against `client_id`
    pub fn in_window(&self, client_id: &str, now: Instant) -> usize {
        self.windows
            .get(client_id)
            .map(|hits| {
                hits.iter()
                    .filter(|&&t| now.duration_since(t) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    fn sweep(&mut self, now: Instant) {
        let window = self.window;
        self.windows
            .retain(|_, hits| hits.back().is_some_and(|&t| now.duration_since(t) < window));
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_within_window() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.check("c1", now));
        assert!(limiter.check("c1", now + Duration::from_secs(1)));
        assert!(limiter.check("c1", now + Duration::from_secs(2)));
        assert!(!limiter.check("c1", now + Duration::from_secs(3)));

        // Other clients have their own window
        assert!(limiter.check("c2", now + Duration::from_secs(3)));
    }

    #[test]
    fn test_window_slides() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.check("c1", start));
        assert!(limiter.check("c1", start + Duration::from_secs(30)));
        assert!(!limiter.check("c1", start + Duration::from_secs(59)));

        // The first admission has aged out; the second still counts
        assert!(limiter.check("c1", start + Duration::from_secs(60)));
        assert!(!limiter.check("c1", start + Duration::from_secs(61)));
        assert_eq!(limiter.in_window("c1", start + Duration::from_secs(61)), 2);
    }

    #[test]
    fn test_rejections_do_not_extend_window() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.check("c1", start));
        for s in 1..10 {
            assert!(!limiter.check("c1", start + Duration::from_secs(s)));
        }
        assert!(limiter.check("c1", start + Duration::from_secs(10)));
    }

    #[test]
    fn test_sweep_drops_idle_clients() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(1));
        let start = Instant::now();
        for i in 0..=SWEEP_THRESHOLD {
            limiter.check(&format!("c{}", i), start);
        }
        assert_eq!(limiter.tracked_clients(), SWEEP_THRESHOLD + 1);

        limiter.check("late", start + Duration::from_secs(5));
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
