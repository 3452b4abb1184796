//! Sliding-window rate limiter for identity claims.
//!
//! Each key keeps the timestamps of its recent attempts; attempts older than
//! the window fall out on the next check.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A rate limiter with configurable per-key limits and window duration.
#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Record an attempt for `key` if it is allowed. Returns `false` when limited.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        self.check_and_record_at(key, Instant::now())
    }

    fn check_and_record_at(&mut self, key: &str, now: Instant) -> bool {
        let window = self.window;
        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Drop keys with no attempts inside the window.
    pub fn gc(&mut self) {
        self.gc_at(Instant::now());
    }

    fn gc_at(&mut self, now: Instant) {
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Per-IP limiter for `authenticate` requests.
#[derive(Debug)]
pub struct AuthRateLimiter {
    inner: RateLimiter,
}

impl AuthRateLimiter {
    /// `max_per_minute == 0` disables limiting.
    pub fn per_minute(max_per_minute: u32) -> Self {
        let max = if max_per_minute == 0 { u32::MAX } else { max_per_minute };
        Self {
            inner: RateLimiter::new(max, Duration::from_secs(60)),
        }
    }

    pub fn check(&mut self, ip: &IpAddr) -> bool {
        self.inner.check_and_record(&ip.to_string())
    }

    pub fn gc(&mut self) {
        self.inner.gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit() {
        let mut rl = RateLimiter::new(3, Duration::from_secs(60));
        assert!(rl.check_and_record("a"));
        assert!(rl.check_and_record("a"));
        assert!(rl.check_and_record("a"));
        assert!(!rl.check_and_record("a"));
        // Other keys are independent.
        assert!(rl.check_and_record("b"));
    }

    #[test]
    fn window_slides() {
        let mut rl = RateLimiter::new(1, Duration::from_secs(60));
        let start = Instant::now();
        assert!(rl.check_and_record_at("a", start));
        assert!(!rl.check_and_record_at("a", start + Duration::from_secs(30)));
        assert!(rl.check_and_record_at("a", start + Duration::from_secs(61)));
    }

    #[test]
    fn gc_forgets_idle_keys() {
        let mut rl = RateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();
        rl.check_and_record_at("a", start);
        rl.check_and_record_at("b", start + Duration::from_secs(50));
        rl.gc_at(start + Duration::from_secs(90));
        assert_eq!(rl.tracked_keys(), 1);
    }

    #[test]
    fn auth_limiter_per_ip() {
        let mut limiter = AuthRateLimiter::per_minute(2);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(&ip));
        assert!(limiter.check(&ip));
        assert!(!limiter.check(&ip));
        assert!(limiter.check(&other));
    }

    #[test]
    fn zero_disables_limit() {
        let mut limiter = AuthRateLimiter::per_minute(0);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..1000 {
            assert!(limiter.check(&ip));
        }
    }
}
