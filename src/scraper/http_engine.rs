use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::http_client::{HttpClient, RedirectGuard};
use super::rate_limiter::RateLimiter;
use super::robots::RobotsChecker;
use super::user_agent::{RotationStrategy, UserAgentRotator};
use super::{FetchOptions, FetchedDocument, ScraperEngine};
use crate::config::ScrapingConfig;
use crate::error::CollectorError;

/// Plain HTTP(S) engine: robots.txt, per-domain pacing, UA rotation and retries
pub struct HttpEngine {
    http_client: HttpClient,
    robots_checker: RobotsChecker,
    rate_limiter: RateLimiter,
    user_agents: UserAgentRotator,
}

impl HttpEngine {
    pub fn new(config: &ScrapingConfig) -> Result<Self> {
        Self::with_redirect_guard(config, None)
    }

    /// Engine whose redirects are checked by `guard` before they are followed
    pub fn with_redirect_guard(config: &ScrapingConfig, guard: Option<RedirectGuard>) -> Result<Self> {
        let http_client = HttpClient::new(config, guard)?;
        let robots_checker = RobotsChecker::new(
            http_client.inner().clone(),
            Duration::from_secs(config.robots_cache_ttl_seconds),
            Duration::from_secs(config.connect_timeout_seconds.max(1) * 2),
            Duration::from_secs(config.max_crawl_delay_seconds),
        );
        let rate_limiter = RateLimiter::new(
            Duration::from_millis(config.default_delay_ms),
            config.requests_per_minute,
        );
        let strategy = if config.rotate_user_agents {
            RotationStrategy::Random
        } else {
            RotationStrategy::Fixed
        };

        Ok(Self {
            http_client,
            robots_checker,
            rate_limiter,
            user_agents: UserAgentRotator::new(&config.user_agents, strategy),
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}

#[async_trait]
impl ScraperEngine for HttpEngine {
    fn name(&self) -> &str {
        "http"
    }

    fn supports(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    async fn fetch(&self, url: &Url, options: &FetchOptions) -> Result<FetchedDocument> {
        let domain = url
            .host_str()
            .ok_or_else(|| CollectorError::scraping(format!("URL has no host: {}", url)))?
            .to_string();
        let user_agent = self.user_agents.next_user_agent().to_string();

        if options.respect_robots_txt {
            if !self.robots_checker.is_allowed(url, &user_agent).await {
                if let Some(metrics) = &options.metrics {
                    metrics.record_robots_blocked(&domain);
                }
                return Err(CollectorError::RobotsDisallowed { url: url.to_string() }.into());
            }

            if let Some(delay) = self.robots_checker.crawl_delay(url, &user_agent).await {
                self.rate_limiter.raise_domain_delay(&domain, delay).await;
            }
        }

        debug!("Fetching {} via http engine", url);
        let document = self
            .http_client
            .get(url, &user_agent, &options.headers, &self.rate_limiter, options.metrics.as_deref())
            .await?;

        Ok(document)
    }
}
