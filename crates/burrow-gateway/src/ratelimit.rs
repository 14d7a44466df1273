//! Per-subdomain rate limiting.
//!
//! Two independent controls behind one mutex: a sliding 60-second window of
//! request timestamps, and a concurrent-connection counter used at handshake
//! admission. Neither check is ever performed while holding any other lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding window length for the request check.
const WINDOW: Duration = Duration::from_secs(60);

/// Default requests per minute per subdomain.
pub const DEFAULT_REQUESTS_PER_MIN: usize = 60;
/// Default concurrent connections per subdomain.
pub const DEFAULT_MAX_CONNS: usize = 5;

#[derive(Debug, Default)]
struct Inner {
    /// Subdomain → timestamps of requests within the last window.
    windows: HashMap<String, Vec<Instant>>,
    /// Subdomain → live connection count.
    conn_counts: HashMap<String, usize>,
}

/// Rate limiter keyed by subdomain.
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_min: usize,
    max_conns: usize,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(requests_per_min: usize, max_conns: usize) -> Self {
        Self {
            requests_per_min,
            max_conns,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Check the sliding window for `subdomain` and record the request when
    /// admitted. Denials return the `Retry-After` value in whole seconds,
    /// always at least 1.
    pub fn allow_request(&self, subdomain: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let window = inner.windows.entry(subdomain.to_string()).or_default();
        window.retain(|t| now.duration_since(*t) < WINDOW);

        if window.len() >= self.requests_per_min {
            let oldest = window[0];
            let remaining = (oldest + WINDOW).saturating_duration_since(now);
            let mut retry_after = remaining.as_secs();
            if remaining.subsec_nanos() > 0 {
                retry_after += 1;
            }
            return Err(retry_after.max(1));
        }

        window.push(now);
        Ok(())
    }

    /// Reserve a connection slot. Returns `false` when the subdomain already
    /// holds `max_conns` live connections.
    pub fn acquire_connection(&self, subdomain: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let count = inner.conn_counts.entry(subdomain.to_string()).or_insert(0);
        if *count >= self.max_conns {
            return false;
        }
        *count += 1;
        true
    }

    /// Release a connection slot. Never goes below zero; the entry is
    /// removed once it reaches zero.
    pub fn release_connection(&self, subdomain: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = inner.conn_counts.get_mut(subdomain) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.conn_counts.remove(subdomain);
            }
        }
    }

    /// Drop all state for a subdomain (called on session termination).
    pub fn cleanup_subdomain(&self, subdomain: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.windows.remove(subdomain);
        inner.conn_counts.remove(subdomain);
    }

    /// Configured `(requests_per_min, max_conns)`.
    pub fn limits(&self) -> (usize, usize) {
        (self.requests_per_min, self.max_conns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_denies() {
        let limiter = RateLimiter::new(3, 5);
        for _ in 0..3 {
            assert!(limiter.allow_request("abcd1234").is_ok());
        }
        let retry_after = limiter.allow_request("abcd1234").unwrap_err();
        assert!(retry_after >= 1);
        assert!(retry_after <= 60);
    }

    #[test]
    fn request_windows_isolate_subdomains() {
        let limiter = RateLimiter::new(1, 5);
        assert!(limiter.allow_request("aaaa0000").is_ok());
        assert!(limiter.allow_request("bbbb1111").is_ok());
        assert!(limiter.allow_request("aaaa0000").is_err());
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let limiter = RateLimiter::new(1, 5);
        assert!(limiter.allow_request("abcd1234").is_ok());
        // The oldest sample is fresh, so the window has nearly 60s left.
        let retry_after = limiter.allow_request("abcd1234").unwrap_err();
        assert!(retry_after >= 1);
    }

    #[test]
    fn connection_limit_enforced() {
        let limiter = RateLimiter::new(60, 2);
        assert!(limiter.acquire_connection("abcd1234"));
        assert!(limiter.acquire_connection("abcd1234"));
        assert!(!limiter.acquire_connection("abcd1234"));

        limiter.release_connection("abcd1234");
        assert!(limiter.acquire_connection("abcd1234"));
    }

    #[test]
    fn connection_counts_isolate_subdomains() {
        let limiter = RateLimiter::new(60, 1);
        assert!(limiter.acquire_connection("aaaa0000"));
        assert!(limiter.acquire_connection("bbbb1111"));
        assert!(!limiter.acquire_connection("aaaa0000"));
    }

    #[test]
    fn release_never_goes_negative() {
        let limiter = RateLimiter::new(60, 1);
        limiter.release_connection("abcd1234");
        limiter.release_connection("abcd1234");
        assert!(limiter.acquire_connection("abcd1234"));
    }

    #[test]
    fn cleanup_resets_subdomain_state() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.allow_request("abcd1234").is_ok());
        assert!(limiter.acquire_connection("abcd1234"));

        limiter.cleanup_subdomain("abcd1234");

        assert!(limiter.allow_request("abcd1234").is_ok());
        assert!(limiter.acquire_connection("abcd1234"));
    }

    #[test]
    fn limits_accessor() {
        let limiter = RateLimiter::new(10, 3);
        assert_eq!(limiter.limits(), (10, 3));
    }
}
