use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::CollectorError;
use crate::logging::LogContext;
use crate::{contextual_error, log_warn};
use crate::metrics::MetricsCollector;
use crate::plan::{CollectionPlan, Record, META_COLLECTED_AT, META_ENGINE, META_SESSION_ID, META_SOURCE_URL};
use crate::scraper::extractor::{extract_records, find_next_links};
use crate::scraper::{EngineRegistry, FetchOptions, FetchedDocument};
use crate::security::SecurityManager;
use crate::session::{SessionCounters, SessionManager};
use crate::storage::PageOutcome;

/// Stops a running collection at the next batch boundary
#[derive(Clone)]
pub struct CancellationHandle {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending URLs plus everything already seen in this session
#[derive(Debug, Default)]
pub struct Frontier {
    queue: VecDeque<Url>,
    seen: HashSet<String>,
}

impl Frontier {
    pub fn new(visited: HashSet<String>) -> Self {
        Self {
            queue: VecDeque::new(),
            seen: visited,
        }
    }

    /// Queue a URL unless it was seen before; fragments are ignored
    pub fn push(&mut self, mut url: Url) -> bool {
        url.set_fragment(None);
        if !self.seen.insert(url.to_string()) {
            return false;
        }
        self.queue.push_back(url);
        true
    }

    pub fn pop_batch(&mut self, size: usize) -> Vec<Url> {
        let take = size.min(self.queue.len());
        self.queue.drain(..take).collect()
    }

    pub fn pending(&self) -> Vec<String> {
        self.queue.iter().map(Url::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Everything a frontier run needs, borrowed from the collector
pub(crate) struct RunContext<'a> {
    pub session_id: &'a str,
    pub plan: &'a CollectionPlan,
    pub engines: &'a EngineRegistry,
    pub sessions: &'a SessionManager,
    pub security: &'a SecurityManager,
    pub metrics: Arc<MetricsCollector>,
    pub fetch_options: FetchOptions,
    pub concurrency: usize,
    pub checkpoint_interval: usize,
    pub cancellation: Option<&'a CancellationHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunStatus {
    Finished,
    Cancelled,
}

/// Page and record counts for one frontier run
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunOutcome {
    pub status: RunStatus,
    pub pages_visited: u64,
    pub pages_failed: u64,
    pub pages_skipped: u64,
    pub records_collected: u64,
    pub checkpoints: u64,
}

struct PageResult {
    http_status: u16,
    records: Vec<Record>,
    next_links: Vec<Url>,
}

impl<'a> RunContext<'a> {
    /// Drive the frontier until it is empty, a limit is reached or the run is cancelled
    pub(crate) async fn run(&self, frontier: &mut Frontier, prior: SessionCounters) -> Result<RunOutcome> {
        let page_budget = self.plan.page_budget().map(|b| b as u64);
        let item_budget = self.plan.limits.max_items.map(|b| b as u64);
        let concurrency = self.concurrency.max(1);

        let mut outcome = RunOutcome {
            status: RunStatus::Finished,
            pages_visited: 0,
            pages_failed: 0,
            pages_skipped: 0,
            records_collected: 0,
            checkpoints: 0,
        };
        let mut since_checkpoint = 0usize;

        info!(
            "Running session {}: {} pending, concurrency {}",
            self.session_id,
            frontier.len(),
            concurrency
        );

        loop {
            if self.cancellation.map_or(false, |c| c.is_cancelled()) {
                info!("Session {} cancelled", self.session_id);
                outcome.status = RunStatus::Cancelled;
                break;
            }

            let pages_done = prior.pages_visited + prior.failures + outcome.pages_visited + outcome.pages_failed
                + outcome.pages_skipped;
            let records_done = prior.records_collected + outcome.records_collected;

            let remaining_pages = page_budget.map(|b| b.saturating_sub(pages_done));
            if remaining_pages == Some(0) {
                info!("Page limit reached for session {}", self.session_id);
                break;
            }
            if item_budget.map_or(false, |b| records_done >= b) {
                info!("Item limit reached for session {}", self.session_id);
                break;
            }
            if frontier.is_empty() {
                break;
            }

            let batch_size = remaining_pages.map_or(concurrency, |r| concurrency.min(r as usize));
            let batch = frontier.pop_batch(batch_size);
            debug!("Fetching batch of {} URLs", batch.len());

            let results: Vec<(Url, Result<PageResult>)> = stream::iter(batch)
                .map(|url| async move {
                    let result = self.fetch_page(&url).await;
                    (url, result)
                })
                .buffered(concurrency)
                .collect()
                .await;

            for (url, result) in results {
                let url_str = url.to_string();
                match result {
                    Ok(page) => {
                        let mut records = page.records;
                        if let Some(budget) = item_budget {
                            let room = budget.saturating_sub(prior.records_collected + outcome.records_collected);
                            records.truncate(room as usize);
                        }

                        let mut next_links = Vec::with_capacity(page.next_links.len());
                        for mut link in page.next_links {
                            match self.security.validate_url(&link) {
                                Ok(()) => {
                                    link.set_fragment(None);
                                    next_links.push(link);
                                }
                                Err(e) => warn!("Skipping pagination link {}: {}", link, e),
                            }
                        }
                        let link_strings: Vec<String> = next_links.iter().map(Url::to_string).collect();

                        // Links are stored with the page so a crash before the next checkpoint loses nothing
                        let outcome_kind = PageOutcome::Fetched { http_status: page.http_status };
                        if self
                            .sessions
                            .record_page(self.session_id, &url_str, &outcome_kind, &records, &link_strings)
                            .await?
                        {
                            outcome.pages_visited += 1;
                            outcome.records_collected += records.len() as u64;
                            self.metrics.record_page(true, records.len());
                        }

                        for link in next_links {
                            if frontier.push(link.clone()) {
                                debug!("Queued pagination link {}", link);
                            }
                        }
                    }
                    Err(error) => {
                        let robots_blocked = matches!(
                            error.downcast_ref::<CollectorError>(),
                            Some(CollectorError::RobotsDisallowed { .. })
                        );
                        let category = error.downcast_ref::<CollectorError>().map_or("internal", |e| e.category());
                        let page_outcome = if robots_blocked {
                            PageOutcome::Skipped { reason: error.to_string() }
                        } else {
                            PageOutcome::Failed { error: error.to_string() }
                        };

                        let detail = match error.downcast::<CollectorError>() {
                            Ok(cause) => {
                                let mut annotated = contextual_error!(
                                    cause, "fetch_page", "orchestrator", "url" => url_str.as_str()
                                );
                                annotated.context = annotated.context.with_session_id(self.session_id);
                                annotated.to_string()
                            }
                            Err(other) => format!("{:#}", other),
                        };

                        let context = LogContext::new("orchestrator", "fetch_page")
                            .with_session_id(self.session_id)
                            .with_url(url_str.as_str())
                            .with_error_category(category);
                        log_warn!(context, format!("Page not collected: {}", detail));

                        if self.sessions.record_page(self.session_id, &url_str, &page_outcome, &[], &[]).await? {
                            if robots_blocked {
                                outcome.pages_skipped += 1;
                            } else {
                                outcome.pages_failed += 1;
                                self.metrics.record_page(false, 0);
                            }
                        }
                    }
                }
                since_checkpoint += 1;
            }

            if since_checkpoint >= self.checkpoint_interval.max(1) {
                self.sessions.save_checkpoint(self.session_id, &frontier.pending()).await?;
                outcome.checkpoints += 1;
                since_checkpoint = 0;
            }
        }

        self.sessions.save_checkpoint(self.session_id, &frontier.pending()).await?;
        outcome.checkpoints += 1;

        info!(
            "Session {} run finished ({:?}): {} visited, {} failed, {} skipped, {} records",
            self.session_id,
            outcome.status,
            outcome.pages_visited,
            outcome.pages_failed,
            outcome.pages_skipped,
            outcome.records_collected
        );
        Ok(outcome)
    }

    async fn fetch_page(&self, url: &Url) -> Result<PageResult> {
        self.security.validate_url(url)?;
        let engine = self.engines.select(url, self.plan.engine.as_deref())?;
        let document = engine.fetch(url, &self.fetch_options).await?;
        // Engines may follow redirects the policy never saw
        if document.final_url != *url {
            self.security.validate_url(&document.final_url)?;
        }
        self.process_document(&document)
    }

    /// Extraction and link discovery; HTML parsing stays inside this synchronous call
    fn process_document(&self, document: &FetchedDocument) -> Result<PageResult> {
        let mut records = extract_records(document, &self.plan.extraction)?;

        let collected_at = Value::String(chrono::Utc::now().to_rfc3339());
        for record in &mut records {
            record.insert(META_SOURCE_URL.to_string(), Value::String(document.url.to_string()));
            record.insert(META_COLLECTED_AT.to_string(), collected_at.clone());
            record.insert(META_ENGINE.to_string(), Value::String(document.engine.clone()));
            record.insert(META_SESSION_ID.to_string(), Value::String(self.session_id.to_string()));
        }

        let next_links = match &self.plan.pagination {
            Some(pagination) => find_next_links(document, pagination)?,
            None => Vec::new(),
        };

        Ok(PageResult {
            http_status: document.status,
            records,
            next_links,
        })
    }
}
