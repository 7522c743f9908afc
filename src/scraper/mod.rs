use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub mod extractor;
pub mod file_engine;
pub mod http_client;
pub mod http_engine;
pub mod rate_limiter;
pub mod robots;
pub mod user_agent;

pub use file_engine::FileEngine;
pub use http_client::RedirectGuard;
pub use http_engine::HttpEngine;

use crate::config::ScrapingConfig;
use crate::error::CollectorError;
use crate::metrics::MetricsCollector;

/// Shape of a fetched body, used to pick the extraction strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Html,
    Json,
    Text,
}

impl DocumentKind {
    /// Detect from the content type, falling back to sniffing the body
    pub fn detect(content_type: Option<&str>, body: &str) -> Self {
        if let Some(ct) = content_type {
            let ct = ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase();
            if ct.ends_with("json") || ct.ends_with("+json") {
                return Self::Json;
            }
            if ct.contains("html") || ct.ends_with("xml") {
                return Self::Html;
            }
        }

        let trimmed = body.trim_start();
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
        {
            Self::Json
        } else if trimmed.starts_with('<') {
            Self::Html
        } else {
            Self::Text
        }
    }
}

/// A fetched page, independent of the engine that produced it
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub url: Url,
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub elapsed: Duration,
    pub bytes: usize,
    pub kind: DocumentKind,
    pub engine: String,
}

/// Per-request options supplied by the orchestrator
#[derive(Clone, Default)]
pub struct FetchOptions {
    pub headers: HashMap<String, String>,
    pub respect_robots_txt: bool,
    pub session_id: Option<String>,
    pub metrics: Option<Arc<MetricsCollector>>,
}

impl FetchOptions {
    pub fn new(respect_robots_txt: bool) -> Self {
        Self {
            respect_robots_txt,
            ..Default::default()
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// A source of documents for a set of URL schemes
#[async_trait]
pub trait ScraperEngine: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, url: &Url) -> bool;

    async fn fetch(&self, url: &Url, options: &FetchOptions) -> Result<FetchedDocument>;
}

/// Registered engines in priority order
pub struct EngineRegistry {
    engines: Vec<Arc<dyn ScraperEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self { engines: Vec::new() }
    }

    /// HTTP and local file engines built from the scraping config
    pub fn with_defaults(config: &ScrapingConfig, redirect_guard: Option<RedirectGuard>) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpEngine::with_redirect_guard(config, redirect_guard)?));
        registry.register(Arc::new(FileEngine::new(config.max_body_bytes)));
        info!("Engine registry initialized: {:?}", registry.names());
        Ok(registry)
    }

    pub fn register(&mut self, engine: Arc<dyn ScraperEngine>) {
        debug!("Registering scraper engine: {}", engine.name());
        self.engines.push(engine);
    }

    pub fn names(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.name().to_string()).collect()
    }

    /// The named engine when one is preferred, otherwise the first that supports the URL
    pub fn select(&self, url: &Url, preferred: Option<&str>) -> Result<Arc<dyn ScraperEngine>> {
        if let Some(name) = preferred {
            let engine = self
                .engines
                .iter()
                .find(|e| e.name().eq_ignore_ascii_case(name))
                .ok_or_else(|| CollectorError::config(format!("Unknown engine: {}", name)))?;

            if !engine.supports(url) {
                return Err(CollectorError::NoEngine { url: url.to_string() }.into());
            }
            return Ok(engine.clone());
        }

        self.engines
            .iter()
            .find(|e| e.supports(url))
            .cloned()
            .ok_or_else(|| CollectorError::NoEngine { url: url.to_string() }.into())
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubEngine;

    #[async_trait]
    impl ScraperEngine for StubEngine {
        fn name(&self) -> &str {
            "stub"
        }

        fn supports(&self, url: &Url) -> bool {
            url.scheme() == "stub"
        }

        async fn fetch(&self, url: &Url, _options: &FetchOptions) -> Result<FetchedDocument> {
            Ok(FetchedDocument {
                url: url.clone(),
                final_url: url.clone(),
                status: 200,
                content_type: None,
                body: String::new(),
                elapsed: Duration::ZERO,
                bytes: 0,
                kind: DocumentKind::Text,
                engine: "stub".to_string(),
            })
        }
    }

    #[test]
    fn test_document_kind_detection() {
        assert_eq!(DocumentKind::detect(Some("application/json; charset=utf-8"), ""), DocumentKind::Json);
        assert_eq!(DocumentKind::detect(Some("application/ld+json"), ""), DocumentKind::Json);
        assert_eq!(DocumentKind::detect(Some("text/html"), "{}"), DocumentKind::Html);
        assert_eq!(DocumentKind::detect(None, "  [1, 2]"), DocumentKind::Json);
        assert_eq!(DocumentKind::detect(None, "<p>hi</p>"), DocumentKind::Html);
        assert_eq!(DocumentKind::detect(Some("text/plain"), "{ not json"), DocumentKind::Text);
    }

    #[test]
    fn test_registry_selection() {
        let mut registry = EngineRegistry::new();
        registry.register(Arc::new(StubEngine));
        registry.register(Arc::new(FileEngine::new(1024)));

        let stub_url = Url::parse("stub://thing").unwrap();
        let file_url = Url::parse("file:///tmp/x.html").unwrap();

        assert_eq!(registry.select(&stub_url, None).unwrap().name(), "stub");
        assert_eq!(registry.select(&file_url, None).unwrap().name(), "file");
        assert_eq!(registry.select(&file_url, Some("FILE")).unwrap().name(), "file");

        assert!(registry.select(&file_url, Some("stub")).is_err());
        assert!(registry.select(&file_url, Some("browser")).is_err());

        let http_url = Url::parse("https://example.com").unwrap();
        let err = registry.select(&http_url, None).err().unwrap();
        assert!(matches!(err.downcast_ref::<CollectorError>(), Some(CollectorError::NoEngine { .. })));
    }
}
