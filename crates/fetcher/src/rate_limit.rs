//! Per-host request spacing.
//!
//! The limiter is an explicit component owned by the fetcher rather than
//! process-wide state, and reads time through [`Clock`] so tests can drive it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use url::Url;

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Keeps at least `min_interval` between two requests to the same host.
pub struct HostRateLimiter {
    min_interval: Duration,
    clock: Arc<dyn Clock>,
    /// Earliest instant the next request to each host may start.
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_clock(min_interval, Arc::new(SystemClock))
    }

    pub fn with_clock(min_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_interval,
            clock,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the next slot for the URL's host and return how long to wait for it.
    ///
    /// Claiming is atomic, so concurrent callers for one host line up one
    /// interval apart instead of all waking at the same instant. URLs without
    /// a host are never delayed.
    pub fn reserve(&self, url: &str) -> Duration {
        let Some(host) = host_of(url) else {
            return Duration::ZERO;
        };

        let now = self.clock.now();
        let mut slots = self
            .next_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let start = match slots.get(&host) {
            Some(&next) if next > now => next,
            _ => now,
        };
        slots.insert(host, start + self.min_interval);

        start - now
    }

    /// Wait until a request to the URL's host is allowed.
    pub async fn wait(&self, url: &str) {
        let delay = self.reserve(url);
        if !delay.is_zero() {
            tracing::debug!(url, delay_ms = delay.as_millis() as u64, "Rate limiting request");
            tokio::time::sleep(delay).await;
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .host_str()
        .map(|host| host.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Instant::now()),
            })
        }

        fn advance(&self, by: Duration) {
            *self.now.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    fn limiter(clock: &Arc<ManualClock>) -> HostRateLimiter {
        HostRateLimiter::with_clock(Duration::from_millis(1000), clock.clone())
    }

    #[test]
    fn test_first_request_is_not_delayed() {
        let clock = ManualClock::new();
        let limiter = limiter(&clock);
        assert_eq!(limiter.reserve("https://example.com/feed"), Duration::ZERO);
    }

    #[test]
    fn test_same_host_is_spaced() {
        let clock = ManualClock::new();
        let limiter = limiter(&clock);

        limiter.reserve("https://example.com/a");
        clock.advance(Duration::from_millis(300));
        assert_eq!(
            limiter.reserve("https://EXAMPLE.com/b"),
            Duration::from_millis(700)
        );
    }

    #[test]
    fn test_back_to_back_reservations_queue_up() {
        let clock = ManualClock::new();
        let limiter = limiter(&clock);

        assert_eq!(limiter.reserve("https://example.com/1"), Duration::ZERO);
        assert_eq!(limiter.reserve("https://example.com/2"), Duration::from_millis(1000));
        assert_eq!(limiter.reserve("https://example.com/3"), Duration::from_millis(2000));
    }

    #[test]
    fn test_hosts_are_independent_and_slots_expire() {
        let clock = ManualClock::new();
        let limiter = limiter(&clock);

        limiter.reserve("https://a.example/feed");
        assert_eq!(limiter.reserve("https://b.example/feed"), Duration::ZERO);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(limiter.reserve("https://a.example/feed"), Duration::ZERO);
    }

    #[test]
    fn test_unparseable_url_is_not_limited() {
        let clock = ManualClock::new();
        let limiter = limiter(&clock);
        assert_eq!(limiter.reserve("not a url"), Duration::ZERO);
        assert_eq!(limiter.reserve("not a url"), Duration::ZERO);
    }
}
