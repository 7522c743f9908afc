use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ai_data_collector::plan::{
    ExtractMode, ExtractionRules, FieldRule, Limits, OutputSpec, Pagination, ProcessingOptions, TargetSpec,
};
use ai_data_collector::scraper::{FetchOptions, FetchedDocument, HttpEngine, ScraperEngine};
use ai_data_collector::storage::SessionStatus;
use ai_data_collector::{
    AppConfig, CancellationHandle, CollectOptions, CollectionPlan, DataCollector, ExportFormat,
};
use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.path = dir.path().join("collector.db");
    config.export.output_directory = dir.path().join("exports");
    config.scraping.default_delay_ms = 0;
    config.scraping.requests_per_minute = 0;
    config.scraping.retry_base_delay_ms = 1;
    config.scraping.retry_max_delay_ms = 5;
    config.scraping.max_retries = 3;
    config.security.blocked_domains = vec![];
    config.security.allow_private_addresses = true;
    config.metrics.sample_process_memory = false;
    config
}

fn quote_page(quotes: &[(&str, &str)], next: Option<&str>) -> String {
    let mut body = String::from("<html><body>");
    for (text, author) in quotes {
        body.push_str(&format!(
            r#"<div class="quote"><span class="text">{}</span><small class="author">{}</small></div>"#,
            text, author
        ));
    }
    if let Some(next) = next {
        body.push_str(&format!(r#"<ul><li class="next"><a href="{}">Next</a></li></ul>"#, next));
    }
    body.push_str("</body></html>");
    body
}

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/html; charset=utf-8")
}

fn field(name: &str, selector: &str) -> FieldRule {
    FieldRule {
        name: name.to_string(),
        selector: selector.to_string(),
        extract: ExtractMode::Text,
        required: true,
        transforms: vec![],
        default: None,
    }
}

fn quotes_plan(targets: &[String]) -> CollectionPlan {
    CollectionPlan {
        name: "quotes".to_string(),
        version: "1.0".to_string(),
        targets: targets
            .iter()
            .map(|url| TargetSpec {
                url: url.clone(),
                label: None,
            })
            .collect(),
        extraction: ExtractionRules {
            item_selector: Some("div.quote".to_string()),
            fields: vec![field("text", "span.text"), field("author", "small.author")],
        },
        pagination: Some(Pagination {
            next_selector: "li.next a".to_string(),
            max_pages: Some(10),
        }),
        limits: Limits::default(),
        processing: ProcessingOptions::default(),
        output: OutputSpec {
            formats: vec![ExportFormat::Json],
            path: None,
            compress: false,
        },
        headers: None,
        respect_robots_txt: true,
        engine: None,
    }
}

#[tokio::test]
async fn http_collect_retries_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/quotes"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/quotes"))
        .respond_with(html(quote_page(&[("Stay hungry", "Steve Jobs")], None)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let collector = DataCollector::new(test_config(&dir)).await.unwrap();
    let plan = quotes_plan(&[format!("{}/quotes", server.uri())]);

    let report = collector.collect(plan, CollectOptions::default()).await.unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.pages_visited, 1);
    assert_eq!(report.records_collected, 1);
    let metrics = report.metrics.expect("metrics enabled");
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.requests_total, 3);

    let exported = std::fs::read_to_string(&report.exports[0].file_path).unwrap();
    let records: serde_json::Value = serde_json::from_str(&exported).unwrap();
    assert_eq!(records[0]["author"], "Steve Jobs");
    assert!(records[0]["_source_url"].as_str().unwrap().ends_with("/quotes"));
}

#[tokio::test]
async fn http_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let collector = DataCollector::new(test_config(&dir)).await.unwrap();
    let plan = quotes_plan(&[format!("{}/gone", server.uri())]);

    let report = collector.collect(plan, CollectOptions::default()).await.unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(report.pages_failed, 1);

    let failed = collector.sessions().failed_pages(&report.session_id).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.contains("404"));
}

#[tokio::test]
async fn robots_disallowed_pages_are_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private\n"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/private/quotes"))
        .respond_with(html(quote_page(&[("Secret", "Nobody")], None)))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/public/quotes"))
        .respond_with(html(quote_page(&[("Open", "Everyone")], None)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let collector = DataCollector::new(test_config(&dir)).await.unwrap();
    let plan = quotes_plan(&[
        format!("{}/private/quotes", server.uri()),
        format!("{}/public/quotes", server.uri()),
    ]);

    let report = collector.collect(plan, CollectOptions::default()).await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.pages_visited, 1);
    assert_eq!(report.pages_failed, 0);
    assert_eq!(report.records_collected, 1);
    assert_eq!(report.metrics.unwrap().robots_blocked, 1);
}

#[tokio::test]
async fn pagination_is_followed_within_page_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page/1"))
        .respond_with(html(quote_page(&[("One", "A"), ("Two", "B")], Some("/page/2"))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page/2"))
        .respond_with(html(quote_page(&[("Three", "C")], Some("/page/3"))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page/3"))
        .respond_with(html(quote_page(&[("Four", "D")], None)))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let collector = DataCollector::new(test_config(&dir)).await.unwrap();
    let mut plan = quotes_plan(&[format!("{}/page/1", server.uri())]);
    plan.limits.max_pages = Some(2);

    let options = CollectOptions {
        formats: vec![ExportFormat::Csv],
        ..CollectOptions::default()
    };
    let report = collector.collect(plan, options).await.unwrap();

    assert_eq!(report.pages_visited, 2);
    assert_eq!(report.records_collected, 3);

    let csv = std::fs::read_to_string(&report.exports[0].file_path).unwrap();
    let header = csv.lines().next().unwrap();
    assert!(header.contains("author") && header.contains("text"));
    assert_eq!(csv.lines().count(), 4);

    // Pending page 3 is left in the final checkpoint
    let checkpoint = collector
        .sessions()
        .latest_checkpoint(&report.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.pending, vec![format!("{}/page/3", server.uri())]);
}

#[tokio::test]
async fn json_api_items_are_extracted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [
                {"name": "Widget", "price": "$9.99"},
                {"name": "Gadget", "price": "$19.50"},
                {"price": "$1.00"}
            ]
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let collector = DataCollector::new(test_config(&dir)).await.unwrap();
    let mut plan = quotes_plan(&[format!("{}/api/products", server.uri())]);
    plan.pagination = None;
    plan.extraction = ExtractionRules {
        item_selector: Some("/items".to_string()),
        fields: vec![field("name", "/name"), field("price", "/price")],
    };

    let report = collector.collect(plan, CollectOptions::default()).await.unwrap();
    assert_eq!(report.records_collected, 2);
}

/// Delegates to the HTTP engine and cancels the run after a fixed number of fetches
struct CancellingEngine {
    inner: HttpEngine,
    handle: CancellationHandle,
    cancel_after: usize,
    fetches: AtomicUsize,
}

#[async_trait]
impl ScraperEngine for CancellingEngine {
    fn name(&self) -> &str {
        "cancelling"
    }

    fn supports(&self, url: &Url) -> bool {
        self.inner.supports(url)
    }

    async fn fetch(&self, url: &Url, options: &FetchOptions) -> Result<FetchedDocument> {
        let document = self.inner.fetch(url, options).await?;
        if self.fetches.fetch_add(1, Ordering::SeqCst) + 1 >= self.cancel_after {
            self.handle.cancel();
        }
        Ok(document)
    }
}

#[tokio::test]
async fn interrupted_session_resumes_without_refetching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page/1"))
        .respond_with(html(quote_page(&[("One", "A")], Some("/page/2"))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page/2"))
        .respond_with(html(quote_page(&[("Two", "B")], Some("/page/3"))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page/3"))
        .respond_with(html(quote_page(&[("Three", "C")], None)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.scraping.max_concurrent_requests = 1;
    config.session.checkpoint_interval = 1;

    let handle = CancellationHandle::new();
    let mut collector = DataCollector::new(config.clone()).await.unwrap();
    collector.register_engine(Arc::new(CancellingEngine {
        inner: HttpEngine::new(&config.scraping).unwrap(),
        handle: handle.clone(),
        cancel_after: 2,
        fetches: AtomicUsize::new(0),
    }));

    let mut plan = quotes_plan(&[format!("{}/page/1", server.uri())]);
    plan.engine = Some("cancelling".to_string());

    let options = CollectOptions {
        cancellation: Some(handle),
        ..CollectOptions::default()
    };
    let first = collector.collect(plan, options).await.unwrap();
    assert_eq!(first.status, SessionStatus::Interrupted);
    assert_eq!(first.pages_visited, 2);
    assert!(first.exports.is_empty());

    let session = collector.get_session(&first.session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Interrupted);

    let resumed = collector
        .resume(&first.session_id, CollectOptions::default())
        .await
        .unwrap();
    assert!(resumed.resumed);
    assert_eq!(resumed.status, SessionStatus::Completed);
    assert_eq!(resumed.pages_visited, 3);
    assert_eq!(resumed.records_collected, 3);
    assert_eq!(resumed.records_exported, 3);

    let metrics = collector.session_metrics(&first.session_id).await.unwrap().unwrap();
    assert_eq!(metrics.pages_visited, 1);
}

/// Delegates to the HTTP engine but panics on one path, like a process dying mid-run
struct CrashingEngine {
    inner: HttpEngine,
    crash_on: Option<String>,
}

#[async_trait]
impl ScraperEngine for CrashingEngine {
    fn name(&self) -> &str {
        "crashing"
    }

    fn supports(&self, url: &Url) -> bool {
        self.inner.supports(url)
    }

    async fn fetch(&self, url: &Url, options: &FetchOptions) -> Result<FetchedDocument> {
        if self.crash_on.as_deref() == Some(url.path()) {
            panic!("simulated crash while fetching {}", url);
        }
        self.inner.fetch(url, options).await
    }
}

#[tokio::test]
async fn crashed_session_resumes_pagination_without_checkpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page/1"))
        .respond_with(html(quote_page(&[("One", "A")], Some("/page/2"))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page/2"))
        .respond_with(html(quote_page(&[("Two", "B")], Some("/page/3"))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page/3"))
        .respond_with(html(quote_page(&[("Three", "C")], None)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.scraping.max_concurrent_requests = 1;
    config.session.checkpoint_interval = 10;

    let mut plan = quotes_plan(&[format!("{}/page/1", server.uri())]);
    plan.engine = Some("crashing".to_string());

    {
        let mut collector = DataCollector::new(config.clone()).await.unwrap();
        collector.register_engine(Arc::new(CrashingEngine {
            inner: HttpEngine::new(&config.scraping).unwrap(),
            crash_on: Some("/page/2".to_string()),
        }));
        let run = AssertUnwindSafe(collector.collect(plan, CollectOptions::default()))
            .catch_unwind()
            .await;
        assert!(run.is_err());
    }

    // A fresh collector on the same database stands in for a restarted process
    let mut collector = DataCollector::new(config.clone()).await.unwrap();
    collector.register_engine(Arc::new(CrashingEngine {
        inner: HttpEngine::new(&config.scraping).unwrap(),
        crash_on: None,
    }));

    let sessions = collector.list_sessions(1).await.unwrap();
    assert_eq!(sessions[0].status, SessionStatus::Running);
    assert_eq!(sessions[0].pages_visited, 1);
    assert!(collector
        .sessions()
        .latest_checkpoint(&sessions[0].id)
        .await
        .unwrap()
        .is_none());

    let resumed = collector
        .resume(&sessions[0].id, CollectOptions::default())
        .await
        .unwrap();
    assert_eq!(resumed.status, SessionStatus::Completed);
    assert_eq!(resumed.pages_visited, 3);
    assert_eq!(resumed.records_collected, 3);
}

#[tokio::test]
async fn redirects_to_blocked_domains_are_refused() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/moved"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "http://blocked.test/quotes"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.security.blocked_domains = vec!["blocked.test".to_string()];
    let collector = DataCollector::new(config).await.unwrap();
    let plan = quotes_plan(&[format!("{}/moved", server.uri())]);

    let report = collector.collect(plan, CollectOptions::default()).await.unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(report.pages_failed, 1);
    assert_eq!(report.records_collected, 0);

    let failed = collector.sessions().failed_pages(&report.session_id).await.unwrap();
    assert!(failed[0].error.contains("blocked.test"), "{}", failed[0].error);
}
