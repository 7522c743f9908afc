use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as QuotaLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Per-domain spacing plus an optional global requests-per-minute quota
pub struct RateLimiter {
    domain_limits: Arc<RwLock<HashMap<String, DomainLimiter>>>,
    default_delay: Duration,
    global: Option<DefaultDirectRateLimiter>,
}

/// Per-domain state; `next_slot` is the earliest instant the next request may start
struct DomainLimiter {
    next_slot: Instant,
    request_count: usize,
    delay: Duration,
}

impl RateLimiter {
    pub fn new(default_delay: Duration, requests_per_minute: u32) -> Self {
        let global = NonZeroU32::new(requests_per_minute)
            .map(|rpm| QuotaLimiter::direct(Quota::per_minute(rpm)));

        Self {
            domain_limits: Arc::new(RwLock::new(HashMap::new())),
            default_delay,
            global,
        }
    }

    /// Wait until a request to `domain` may be sent
    pub async fn wait_for_domain(&self, domain: &str) {
        let now = Instant::now();
        let required_delay = {
            let mut limits = self.domain_limits.write().await;
            let limiter = limits.entry(domain.to_string()).or_insert_with(|| DomainLimiter {
                next_slot: now,
                request_count: 0,
                delay: self.default_delay,
            });

            // Reserve a slot so concurrent callers queue behind each other
            let slot = limiter.next_slot.max(now);
            limiter.next_slot = slot + limiter.delay;
            limiter.request_count += 1;

            slot.saturating_duration_since(now)
        };

        if !required_delay.is_zero() {
            debug!("Rate limiting: waiting {}ms for domain {}", required_delay.as_millis(), domain);
            tokio::time::sleep(required_delay).await;
        }

        if let Some(global) = &self.global {
            global.until_ready().await;
        }
    }

    /// Raise the interval for a domain; never lowers it below the current value
    pub async fn raise_domain_delay(&self, domain: &str, delay: Duration) {
        let mut limits = self.domain_limits.write().await;
        let default_delay = self.default_delay;
        let limiter = limits.entry(domain.to_string()).or_insert_with(|| DomainLimiter {
            next_slot: Instant::now(),
            request_count: 0,
            delay: default_delay,
        });

        if delay > limiter.delay {
            debug!("Raising delay for {} to {}ms", domain, delay.as_millis());
            limiter.delay = delay;
        }
    }

    pub async fn domain_delay(&self, domain: &str) -> Duration {
        let limits = self.domain_limits.read().await;
        limits.get(domain).map(|l| l.delay).unwrap_or(self.default_delay)
    }

    pub async fn get_domain_request_count(&self, domain: &str) -> usize {
        let limits = self.domain_limits.read().await;
        limits.get(domain).map(|l| l.request_count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spacing_between_same_domain_requests() {
        let limiter = RateLimiter::new(Duration::from_millis(60), 0);

        let start = Instant::now();
        limiter.wait_for_domain("a.example").await;
        limiter.wait_for_domain("a.example").await;
        limiter.wait_for_domain("a.example").await;

        assert!(start.elapsed() >= Duration::from_millis(120));
        assert_eq!(limiter.get_domain_request_count("a.example").await, 3);
    }

    #[tokio::test]
    async fn test_domains_are_independent() {
        let limiter = RateLimiter::new(Duration::from_millis(200), 0);

        let start = Instant::now();
        limiter.wait_for_domain("a.example").await;
        limiter.wait_for_domain("b.example").await;

        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_crawl_delay_only_raises() {
        let limiter = RateLimiter::new(Duration::from_millis(500), 0);

        limiter.raise_domain_delay("a.example", Duration::from_millis(100)).await;
        assert_eq!(limiter.domain_delay("a.example").await, Duration::from_millis(500));

        limiter.raise_domain_delay("a.example", Duration::from_secs(2)).await;
        assert_eq!(limiter.domain_delay("a.example").await, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_global_quota_allows_burst() {
        let limiter = RateLimiter::new(Duration::ZERO, 60);

        let start = Instant::now();
        for i in 0..5 {
            limiter.wait_for_domain(&format!("d{}.example", i)).await;
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
