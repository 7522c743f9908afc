use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use url::Url;

pub mod orchestrator;
pub mod pipeline;

pub use orchestrator::{CancellationHandle, Frontier};

use crate::config::AppConfig;
use crate::export::{ExportManager, ExportStats};
use crate::logging::{LogContext, PerformanceLogger};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::plan::{CollectionPlan, ExportFormat, Record};
use crate::scraper::{EngineRegistry, FetchOptions, RedirectGuard, ScraperEngine};
use crate::security::SecurityManager;
use crate::session::{SessionCounters, SessionManager};
use crate::storage::{Session, SessionStatus, StorageManager};
use crate::utils::sanitize_filename;
use orchestrator::{RunContext, RunStatus};
use pipeline::{ProcessorPipeline, StageInfo};

/// Options for one `collect` or `resume` call
#[derive(Clone, Default)]
pub struct CollectOptions {
    /// Session name; defaults to the plan name
    pub session_name: Option<String>,
    /// Base output path; a known format extension is stripped
    pub output_path: Option<PathBuf>,
    /// Overrides the plan's output formats when non-empty
    pub formats: Vec<ExportFormat>,
    pub cancellation: Option<CancellationHandle>,
    pub skip_export: bool,
}

/// Result of a collection run
#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub session_id: String,
    pub session_name: String,
    pub status: SessionStatus,
    pub pages_visited: u64,
    pub pages_failed: u64,
    pub records_collected: u64,
    pub records_exported: usize,
    pub exports: Vec<ExportStats>,
    pub stage_info: Vec<StageInfo>,
    pub metrics: Option<MetricsSnapshot>,
    pub resumed: bool,
    pub duration: Duration,
}

/// Main collector: validates plans, drives sessions and exports their records
pub struct DataCollector {
    config: AppConfig,
    sessions: SessionManager,
    engines: EngineRegistry,
    security: Arc<SecurityManager>,
}

impl DataCollector {
    /// Initialize storage, security and the default engines
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("Initializing data collector");
        config.validate()?;

        let storage = StorageManager::new(&config.database).await?;
        info!("Storage manager initialized");

        Self::with_storage(config, storage)
    }

    pub fn with_storage(config: AppConfig, storage: StorageManager) -> Result<Self> {
        let sessions = SessionManager::new(Arc::new(storage));

        let security = Arc::new(SecurityManager::new(&config.security)?);
        info!("Security manager initialized");

        let guard_security = security.clone();
        let redirect_guard: RedirectGuard =
            Arc::new(move |url: &Url| guard_security.validate_url(url).map_err(|e| e.to_string()));
        let engines = EngineRegistry::with_defaults(&config.scraping, Some(redirect_guard))?;
        info!("Scraper engines initialized");

        Ok(Self {
            config,
            sessions,
            engines,
            security,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn security(&self) -> &SecurityManager {
        &self.security
    }

    /// Add an engine; it is consulted after the ones already registered
    pub fn register_engine(&mut self, engine: Arc<dyn ScraperEngine>) {
        self.engines.register(engine);
    }

    /// Structural and security validation of a plan
    pub fn validate_plan(&self, plan: &CollectionPlan) -> Result<()> {
        plan.validate_structure()?;
        self.security.validate_plan(plan)?;
        // Fail fast on processing options that cannot compile
        ProcessorPipeline::new(self.config.processing.clone(), &plan.processing)?;
        Ok(())
    }

    /// Start a new session for the plan and run it to completion or cancellation
    pub async fn collect(&self, plan: CollectionPlan, options: CollectOptions) -> Result<CollectionReport> {
        self.validate_plan(&plan)?;

        let name = options
            .session_name
            .clone()
            .unwrap_or_else(|| plan.name.clone());
        let session = self.sessions.create_session(&name, &plan).await?;

        let mut frontier = Frontier::new(HashSet::new());
        for url in plan.target_urls()? {
            frontier.push(url);
        }

        self.run_session(session, plan, frontier, SessionCounters::default(), false, options)
            .await
    }

    /// Continue an interrupted session from its latest checkpoint
    pub async fn resume(&self, session_id: &str, options: CollectOptions) -> Result<CollectionReport> {
        let retry_failed = self.config.session.retry_failed_on_resume;
        let state = self.sessions.resume_state(session_id, retry_failed).await?;
        self.validate_plan(&state.plan)?;

        let mut frontier = Frontier::new(state.visited);
        for pending in &state.pending {
            match Url::parse(pending) {
                Ok(url) => {
                    frontier.push(url);
                }
                Err(e) => warn!("Dropping unparsable checkpoint URL '{}': {}", pending, e),
            }
        }

        let mut counters = state.counters;
        if retry_failed {
            // Failed pages are attempted again and must not eat into the page budget twice
            counters.failures = 0;
        }

        self.run_session(state.session, state.plan, frontier, counters, true, options)
            .await
    }

    async fn run_session(
        &self,
        session: Session,
        plan: CollectionPlan,
        mut frontier: Frontier,
        prior: SessionCounters,
        resumed: bool,
        options: CollectOptions,
    ) -> Result<CollectionReport> {
        let started = Instant::now();
        let perf = PerformanceLogger::new(
            LogContext::new("core", if resumed { "resume" } else { "collect" }).with_session_id(session.id.as_str()),
        );

        self.sessions.mark_running(&session.id).await?;

        let metrics = Arc::new(MetricsCollector::from_config(&self.config.metrics));
        let fetch_options = FetchOptions::new(self.config.scraping.respect_robots_txt && plan.respect_robots_txt)
            .with_headers(plan.headers.clone().unwrap_or_default())
            .with_session_id(session.id.as_str())
            .with_metrics(metrics.clone());

        let context = RunContext {
            session_id: &session.id,
            plan: &plan,
            engines: &self.engines,
            sessions: &self.sessions,
            security: &self.security,
            metrics: metrics.clone(),
            fetch_options,
            concurrency: self.config.scraping.max_concurrent_requests,
            checkpoint_interval: self.config.session.checkpoint_interval,
            cancellation: options.cancellation.as_ref(),
        };

        let outcome = match context.run(&mut frontier, prior).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(mark_err) = self.sessions.mark_failed(&session.id, &e.to_string()).await {
                    warn!("Could not mark session {} failed: {}", session.id, mark_err);
                }
                perf.finish_with_error("Collection run failed", &e);
                return Err(e);
            }
        };

        let totals = self.sessions.require_session(&session.id).await?;
        let mut exports = Vec::new();
        let mut stage_info = Vec::new();
        let mut records_exported = 0;

        let status = if outcome.status == RunStatus::Cancelled {
            self.sessions.mark_interrupted(&session.id).await?;
            SessionStatus::Interrupted
        } else if totals.pages_visited == 0 && totals.records_collected == 0 && totals.failures > 0 {
            self.sessions
                .mark_failed(&session.id, "every target failed")
                .await?;
            SessionStatus::Failed
        } else {
            if !options.skip_export {
                let base_path = self.output_base_path(&totals, &plan, &options);
                let formats = self.resolve_formats(&plan, &options);
                match self
                    .export_records(&session.id, &plan, &base_path, &formats, plan.output.compress)
                    .await
                {
                    Ok((processed, stages, stats)) => {
                        records_exported = processed.len();
                        stage_info = stages;
                        exports = stats;
                    }
                    Err(e) => {
                        self.sessions.mark_failed(&session.id, &e.to_string()).await?;
                        perf.finish_with_error("Export failed", &e);
                        return Err(e);
                    }
                }
            }
            self.sessions.mark_completed(&session.id).await?;
            SessionStatus::Completed
        };

        let snapshot = metrics.snapshot();
        if self.config.metrics.enabled {
            self.sessions.store_metrics(&session.id, &snapshot).await?;
        }

        perf.finish_with_status("Collection run finished", status.to_string());

        Ok(CollectionReport {
            session_id: session.id,
            session_name: totals.name,
            status,
            pages_visited: totals.pages_visited,
            pages_failed: totals.failures,
            records_collected: totals.records_collected,
            records_exported,
            exports,
            stage_info,
            metrics: self.config.metrics.enabled.then_some(snapshot),
            resumed,
            duration: started.elapsed(),
        })
    }

    /// Run the pipeline over a session's stored records and write one file
    pub async fn export_session(&self, session_id: &str, path: &Path, format: ExportFormat) -> Result<ExportStats> {
        let session = self.sessions.require_session(session_id).await?;
        let plan = CollectionPlan::from_yaml(&session.plan_yaml)?;

        let records = self.processed_records(session_id, &plan).await?;
        let manager = ExportManager::new(&self.config.export).with_fallback_columns(field_names(&plan));
        manager.export(&records, path, format, plan.output.compress).await
    }

    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        self.sessions.list_sessions(limit).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.sessions.get_session(session_id).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.sessions.delete_session(session_id).await
    }

    pub async fn session_metrics(&self, session_id: &str) -> Result<Option<MetricsSnapshot>> {
        self.sessions.load_metrics(session_id).await
    }

    async fn processed_records(&self, session_id: &str, plan: &CollectionPlan) -> Result<Vec<Record>> {
        Ok(self.run_pipeline(session_id, plan).await?.0)
    }

    async fn run_pipeline(&self, session_id: &str, plan: &CollectionPlan) -> Result<(Vec<Record>, Vec<StageInfo>)> {
        let records = self.sessions.load_records(session_id).await?;
        let pipeline = ProcessorPipeline::new(self.config.processing.clone(), &plan.processing)?;
        let mut processed = pipeline.process_batched(records).await?;
        self.security.filter_output(&mut processed.items);
        Ok((processed.items, processed.stage_info))
    }

    async fn export_records(
        &self,
        session_id: &str,
        plan: &CollectionPlan,
        base_path: &Path,
        formats: &[ExportFormat],
        compress: bool,
    ) -> Result<(Vec<Record>, Vec<StageInfo>, Vec<ExportStats>)> {
        let (records, stages) = self.run_pipeline(session_id, plan).await?;
        let manager = ExportManager::new(&self.config.export).with_fallback_columns(field_names(plan));
        let stats = manager.export_multiple(&records, base_path, formats, compress).await?;
        Ok((records, stages, stats))
    }

    fn resolve_formats(&self, plan: &CollectionPlan, options: &CollectOptions) -> Vec<ExportFormat> {
        if !options.formats.is_empty() {
            return options.formats.clone();
        }
        if !plan.output.formats.is_empty() {
            return plan.output.formats.clone();
        }
        match self.config.export.default_format.parse::<ExportFormat>() {
            Ok(format) => vec![format],
            Err(e) => {
                warn!("Invalid default export format, using csv: {}", e);
                vec![ExportFormat::Csv]
            }
        }
    }

    /// Explicit path with any format extension stripped, else `<output dir>/<name>_<id prefix>`
    fn output_base_path(&self, session: &Session, plan: &CollectionPlan, options: &CollectOptions) -> PathBuf {
        let explicit = options
            .output_path
            .clone()
            .or_else(|| plan.output.path.as_ref().map(PathBuf::from));

        match explicit {
            Some(path) => strip_format_extension(path),
            None => {
                let id_prefix: String = session.id.chars().take(8).collect();
                self.config
                    .export
                    .output_directory
                    .join(format!("{}_{}", sanitize_filename(&session.name), id_prefix))
            }
        }
    }
}

fn strip_format_extension(path: PathBuf) -> PathBuf {
    let is_format = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.parse::<ExportFormat>().is_ok());
    if is_format {
        path.with_extension("")
    } else {
        path
    }
}

fn field_names(plan: &CollectionPlan) -> Vec<String> {
    plan.extraction.fields.iter().map(|f| f.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectorError;
    use crate::plan::TargetSpec;
    use tempfile::TempDir;

    const PAGE_ONE: &str = r#"<html><body>
        <div class="quote"><span class="text">The world as we have created it</span><small class="author">Albert Einstein</small></div>
        <div class="quote"><span class="text">It is our choices</span><small class="author">J.K. Rowling</small></div>
        <ul class="pager"><li class="next"><a href="page2.html">Next</a></li></ul>
    </body></html>"#;

    const PAGE_TWO: &str = r#"<html><body>
        <div class="quote"><span class="text">It is our choices</span><small class="author">J.K. Rowling</small></div>
        <div class="quote"><span class="text">A day without sunshine</span><small class="author">Steve Martin</small></div>
    </body></html>"#;

    struct Fixture {
        dir: TempDir,
        collector: DataCollector,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("page1.html"), PAGE_ONE).unwrap();
        std::fs::write(dir.path().join("page2.html"), PAGE_TWO).unwrap();

        let mut config = AppConfig::default();
        config.database.path = dir.path().join("db").join("collector.db");
        config.export.output_directory = dir.path().join("out");
        config.metrics.sample_process_memory = false;

        let collector = DataCollector::new(config).await.unwrap();
        Fixture { dir, collector }
    }

    fn file_plan(dir: &Path) -> CollectionPlan {
        let mut plan = CollectionPlan::example();
        let url = Url::from_file_path(dir.join("page1.html")).unwrap();
        plan.targets = vec![TargetSpec {
            url: url.to_string(),
            label: None,
        }];
        plan
    }

    #[tokio::test]
    async fn test_collect_follows_pagination_and_exports() {
        let fx = fixture().await;
        let plan = file_plan(fx.dir.path());

        let report = fx.collector.collect(plan, CollectOptions::default()).await.unwrap();

        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.pages_visited, 2);
        assert_eq!(report.records_collected, 4);
        // duplicate quote removed by the pipeline
        assert_eq!(report.records_exported, 3);
        assert_eq!(report.exports.len(), 2);
        for export in &report.exports {
            assert!(export.file_path.exists());
            assert!(export.file_path.starts_with(fx.dir.path().join("out")));
        }

        let session = fx.collector.get_session(&report.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(fx.collector.session_metrics(&report.session_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancelled_session_resumes() {
        let fx = fixture().await;
        let plan = file_plan(fx.dir.path());

        let handle = CancellationHandle::new();
        handle.cancel();
        let options = CollectOptions {
            cancellation: Some(handle),
            ..CollectOptions::default()
        };
        let report = fx.collector.collect(plan, options).await.unwrap();
        assert_eq!(report.status, SessionStatus::Interrupted);
        assert_eq!(report.pages_visited, 0);
        assert!(report.exports.is_empty());

        let resumed = fx
            .collector
            .resume(&report.session_id, CollectOptions::default())
            .await
            .unwrap();
        assert!(resumed.resumed);
        assert_eq!(resumed.status, SessionStatus::Completed);
        assert_eq!(resumed.pages_visited, 2);

        let err = fx
            .collector
            .resume(&report.session_id, CollectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CollectorError>(),
            Some(CollectorError::SessionNotResumable { .. })
        ));
    }

    #[tokio::test]
    async fn test_all_failed_marks_session_failed() {
        let fx = fixture().await;
        let mut plan = file_plan(fx.dir.path());
        plan.targets[0].url = Url::from_file_path(fx.dir.path().join("missing.html"))
            .unwrap()
            .to_string();

        let report = fx.collector.collect(plan, CollectOptions::default()).await.unwrap();
        assert_eq!(report.status, SessionStatus::Failed);
        assert_eq!(report.pages_failed, 1);
        assert!(report.exports.is_empty());
    }

    #[tokio::test]
    async fn test_export_session_and_explicit_output_path() {
        let fx = fixture().await;
        let plan = file_plan(fx.dir.path());
        let options = CollectOptions {
            output_path: Some(fx.dir.path().join("custom").join("quotes.csv")),
            formats: vec![ExportFormat::Jsonl],
            ..CollectOptions::default()
        };

        let report = fx.collector.collect(plan, options).await.unwrap();
        assert_eq!(report.exports.len(), 1);
        assert_eq!(report.exports[0].file_path, fx.dir.path().join("custom").join("quotes.jsonl"));

        let target = fx.dir.path().join("again.yaml");
        let stats = fx
            .collector
            .export_session(&report.session_id, &target, ExportFormat::Yaml)
            .await
            .unwrap();
        assert_eq!(stats.record_count, 3);
        assert!(target.exists());
    }

    #[tokio::test]
    async fn test_invalid_plan_creates_no_session() {
        let fx = fixture().await;
        let mut plan = file_plan(fx.dir.path());
        plan.targets[0].url = "http://localhost/".to_string();

        assert!(fx.collector.collect(plan, CollectOptions::default()).await.is_err());
        assert!(fx.collector.list_sessions(10).await.unwrap().is_empty());
    }

    #[test]
    fn test_strip_format_extension() {
        assert_eq!(strip_format_extension(PathBuf::from("out/data.json")), PathBuf::from("out/data"));
        assert_eq!(strip_format_extension(PathBuf::from("out/data.v2")), PathBuf::from("out/data.v2"));
        assert_eq!(strip_format_extension(PathBuf::from("out/data")), PathBuf::from("out/data"));
    }
}
