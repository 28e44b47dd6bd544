//! Per-client fixed-window rate limiting for login attempts

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<IpAddr, Window>,
    interval: Duration,
    limit: u32,
}

impl RateLimiter {
    pub fn new(interval: Duration, limit: u32) -> Self {
        Self {
            windows: DashMap::new(),
            interval,
            limit,
        }
    }

    /// Count an attempt from `client`; false once the window's budget is spent.
    pub fn check_and_record(&self, client: IpAddr) -> bool {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: IpAddr, now: Instant) -> bool {
        let mut window = self.windows.entry(client).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= self.interval {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.limit {
            return false;
        }
        window.count += 1;
        true
    }

    /// Drop windows that have already expired.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.windows
            .retain(|_, window| now.duration_since(window.started) < self.interval);
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// Periodically prune expired windows.
pub fn spawn_cleanup_task(limiter: Arc<RateLimiter>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            limiter.cleanup();
            debug!(clients = limiter.tracked_clients(), "Rate limiter pruned");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const OTHER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn test_limit_within_window() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        let now = Instant::now();

        assert!(limiter.check_at(CLIENT, now));
        assert!(limiter.check_at(CLIENT, now));
        assert!(limiter.check_at(CLIENT, now));
        assert!(!limiter.check_at(CLIENT, now));

        assert!(limiter.check_at(OTHER, now));
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 1);
        let now = Instant::now();

        assert!(limiter.check_at(CLIENT, now));
        assert!(!limiter.check_at(CLIENT, now + Duration::from_millis(500)));
        assert!(limiter.check_at(CLIENT, now + Duration::from_secs(1)));
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let limiter = RateLimiter::new(Duration::from_millis(1), 5);
        limiter.check_at(CLIENT, Instant::now() - Duration::from_secs(1));
        limiter.cleanup();
        assert_eq!(limiter.tracked_clients(), 0);
    }
}
