use anyhow::Result;
use futures::StreamExt;
use rand::Rng;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER},
    Client, StatusCode,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

use super::rate_limiter::RateLimiter;
use super::{DocumentKind, FetchedDocument};
use crate::config::ScrapingConfig;
use crate::error::{CollectorError, CollectorResult};
use crate::metrics::MetricsCollector;

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the computed delay
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &ScrapingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter_ratio: 0.2,
        }
    }

    /// `base * 2^(attempt-1)`, capped at `max_delay`, without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Delay before retry number `attempt`; a server hint replaces the computed backoff
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }

        let delay = self.backoff(attempt);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }

        let jitter = rand::thread_rng().gen_range(0.0..=self.jitter_ratio);
        delay + delay.mul_f64(jitter)
    }

    pub fn should_retry(&self, error: &CollectorError, attempt: u32) -> bool {
        attempt <= self.max_retries && error.is_recoverable()
    }
}

/// A failed attempt together with any server-provided retry hint
struct AttemptError {
    error: CollectorError,
    retry_after: Option<Duration>,
}

impl From<CollectorError> for AttemptError {
    fn from(error: CollectorError) -> Self {
        Self { error, retry_after: None }
    }
}

/// Checks a redirect target before it is followed; `Err` carries the reason
pub type RedirectGuard = Arc<dyn Fn(&Url) -> std::result::Result<(), String> + Send + Sync>;

/// reqwest wrapper with retry, body size limits and request metrics
pub struct HttpClient {
    client: Client,
    policy: RetryPolicy,
    max_body_bytes: usize,
}

impl HttpClient {
    pub fn new(config: &ScrapingConfig, redirect_guard: Option<RedirectGuard>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Accept",
            HeaderValue::from_static("text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8"),
        );
        headers.insert("Accept-Language", HeaderValue::from_static("en-US,en;q=0.5"));

        let max_redirects = config.max_redirects;
        let redirect_policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                return attempt.error(format!("too many redirects (max {})", max_redirects));
            }
            if let Some(guard) = &redirect_guard {
                if let Err(reason) = guard(attempt.url()) {
                    warn!("Refusing redirect to {}: {}", attempt.url(), reason);
                    return attempt.error(reason);
                }
            }
            attempt.follow()
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .default_headers(headers)
            .cookie_store(true)
            .redirect(redirect_policy)
            .pool_max_idle_per_host(config.max_concurrent_requests)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| CollectorError::network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            policy: RetryPolicy::from_config(config),
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Underlying client, shared with the robots fetcher
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// GET with retry on transient failures; every attempt waits for the rate limiter
    pub async fn get(
        &self,
        url: &Url,
        user_agent: &str,
        custom_headers: &HashMap<String, String>,
        rate_limiter: &RateLimiter,
        metrics: Option<&MetricsCollector>,
    ) -> CollectorResult<FetchedDocument> {
        let domain = url.host_str().unwrap_or("unknown").to_string();
        let mut attempt: u32 = 1;

        loop {
            rate_limiter.wait_for_domain(&domain).await;
            debug!("HTTP GET attempt {} for: {}", attempt, url);
            let started = Instant::now();

            match self.get_once(url, user_agent, custom_headers).await {
                Ok(document) => {
                    if let Some(metrics) = metrics {
                        metrics.record_request(&domain, started.elapsed(), true, document.bytes as u64);
                    }
                    return Ok(document);
                }
                Err(failure) => {
                    if let Some(metrics) = metrics {
                        metrics.record_request(&domain, started.elapsed(), false, 0);
                    }

                    if !self.policy.should_retry(&failure.error, attempt) {
                        return Err(failure.error);
                    }

                    let delay = self.policy.delay_for(attempt, failure.retry_after);
                    warn!(
                        "Attempt {} for {} failed ({}), retrying in {}ms",
                        attempt, url, failure.error, delay.as_millis()
                    );
                    if let Some(metrics) = metrics {
                        metrics.record_retry(&domain);
                    }

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn get_once(
        &self,
        url: &Url,
        user_agent: &str,
        custom_headers: &HashMap<String, String>,
    ) -> Result<FetchedDocument, AttemptError> {
        let started = Instant::now();
        let mut request = self.client.get(url.as_str()).header("User-Agent", user_agent);

        for (name, value) in custom_headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(header_name), Ok(header_value)) => {
                    request = request.header(header_name, header_value);
                }
                _ => warn!("Skipping invalid header: {}", name),
            }
        }

        let response = request.send().await.map_err(CollectorError::from)?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let error = if status == StatusCode::TOO_MANY_REQUESTS {
                CollectorError::RateLimited {
                    url: url.to_string(),
                    retry_after_secs: retry_after.map(|d| d.as_secs()),
                }
            } else {
                CollectorError::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                }
            };
            return Err(AttemptError { error, retry_after });
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.max_body_bytes {
                return Err(CollectorError::scraping(format!(
                    "Response from {} too large: {} bytes (max {})",
                    url, length, self.max_body_bytes
                )).into());
            }
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(CollectorError::from)?;
            if bytes.len() + chunk.len() > self.max_body_bytes {
                return Err(CollectorError::scraping(format!(
                    "Response from {} exceeded {} bytes", url, self.max_body_bytes
                )).into());
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).into_owned();
        let kind = DocumentKind::detect(content_type.as_deref(), &body);

        Ok(FetchedDocument {
            url: url.clone(),
            final_url,
            status: status.as_u16(),
            content_type,
            bytes: bytes.len(),
            body,
            elapsed: started.elapsed(),
            kind,
            engine: "http".to_string(),
        })
    }
}

/// `Retry-After` in delta-seconds or HTTP-date form
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter_ratio: 0.2,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = policy();
        for _ in 0..50 {
            let delay = policy.delay_for(2, None);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(240));
        }
    }

    #[test]
    fn test_retry_after_overrides_and_is_capped() {
        let policy = policy();
        assert_eq!(policy.delay_for(1, Some(Duration::from_millis(300))), Duration::from_millis(300));
        assert_eq!(policy.delay_for(1, Some(Duration::from_secs(120))), Duration::from_millis(1000));
    }

    #[test]
    fn test_should_retry_classification() {
        let policy = policy();
        let server = CollectorError::HttpStatus { url: "u".into(), status: 503 };
        let timeout_status = CollectorError::HttpStatus { url: "u".into(), status: 408 };
        let not_found = CollectorError::HttpStatus { url: "u".into(), status: 404 };
        let throttled = CollectorError::RateLimited { url: "u".into(), retry_after_secs: None };

        assert!(policy.should_retry(&server, 1));
        assert!(policy.should_retry(&timeout_status, 3));
        assert!(policy.should_retry(&throttled, 2));
        assert!(!policy.should_retry(&server, 4));
        assert!(!policy.should_retry(&not_found, 1));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    fn fast_retry_config() -> ScrapingConfig {
        ScrapingConfig {
            max_retries: 2,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            ..ScrapingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_every_attempt_waits_for_rate_limiter() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = HttpClient::new(&fast_retry_config(), None).unwrap();
        let limiter = RateLimiter::new(Duration::from_millis(80), 600);
        let url = Url::parse(&format!("{}/flaky", server.uri())).unwrap();

        let started = Instant::now();
        let document = client.get(&url, "test-agent", &HashMap::new(), &limiter, None).await.unwrap();

        assert_eq!(document.status, 200);
        assert_eq!(limiter.get_domain_request_count("127.0.0.1").await, 3);
        assert!(started.elapsed() >= Duration::from_millis(160));
    }

    #[tokio::test]
    async fn test_redirect_guard_stops_redirect_without_retry() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/start"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "http://blocked.test/secret"))
            .expect(1)
            .mount(&server)
            .await;

        let guard: RedirectGuard = Arc::new(|url: &Url| {
            if url.host_str() == Some("blocked.test") {
                Err("domain is blocked".to_string())
            } else {
                Ok(())
            }
        });
        let client = HttpClient::new(&fast_retry_config(), Some(guard)).unwrap();
        let limiter = RateLimiter::new(Duration::ZERO, 0);
        let url = Url::parse(&format!("{}/start", server.uri())).unwrap();

        let err = client.get(&url, "test-agent", &HashMap::new(), &limiter, None).await.err().unwrap();
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("domain is blocked"), "{}", err);
    }
}
