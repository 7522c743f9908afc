use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::CollectorError;
use crate::metrics::MetricsSnapshot;
use crate::plan::{CollectionPlan, Record};
use crate::storage::{Checkpoint, FailedPage, PageOutcome, Session, SessionStatus, StorageManager};
use crate::utils::generate_id;

/// Session lifecycle and checkpoint/resume on top of the storage layer
#[derive(Clone)]
pub struct SessionManager {
    storage: Arc<StorageManager>,
}

/// Counters carried over from a previous run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub pages_visited: u64,
    pub records_collected: u64,
    pub failures: u64,
}

/// Everything needed to continue an interrupted session
#[derive(Debug, Clone)]
pub struct ResumeState {
    pub session: Session,
    pub plan: CollectionPlan,
    pub pending: Vec<String>,
    pub visited: HashSet<String>,
    pub counters: SessionCounters,
    pub checkpoint_sequence: Option<u64>,
}

impl SessionManager {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub async fn create_session(&self, name: &str, plan: &CollectionPlan) -> Result<Session> {
        let id = generate_id();
        let session = self.storage.create_session(&id, name, &plan.to_yaml()?).await?;
        info!("Created session {} ({})", session.id, session.name);
        Ok(session)
    }

    pub async fn mark_running(&self, session_id: &str) -> Result<()> {
        self.storage.update_status(session_id, SessionStatus::Running, None).await
    }

    pub async fn mark_interrupted(&self, session_id: &str) -> Result<()> {
        self.storage.update_status(session_id, SessionStatus::Interrupted, None).await
    }

    pub async fn mark_completed(&self, session_id: &str) -> Result<()> {
        self.storage.update_status(session_id, SessionStatus::Completed, None).await
    }

    pub async fn mark_failed(&self, session_id: &str, error: &str) -> Result<()> {
        warn!("Session {} failed: {}", session_id, error);
        self.storage.update_status(session_id, SessionStatus::Failed, Some(error)).await
    }

    pub async fn save_checkpoint(&self, session_id: &str, pending: &[String]) -> Result<Checkpoint> {
        self.storage.save_checkpoint(session_id, pending).await
    }

    pub async fn latest_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        self.storage.latest_checkpoint(session_id).await
    }

    pub async fn record_page(
        &self,
        session_id: &str,
        url: &str,
        outcome: &PageOutcome,
        records: &[Record],
        next_links: &[String],
    ) -> Result<bool> {
        self.storage.record_page(session_id, url, outcome, records, next_links).await
    }

    pub async fn visited_urls(&self, session_id: &str, include_failed: bool) -> Result<HashSet<String>> {
        Ok(self.storage.visited_urls(session_id, include_failed).await?.into_iter().collect())
    }

    pub async fn failed_pages(&self, session_id: &str) -> Result<Vec<FailedPage>> {
        self.storage.failed_pages(session_id).await
    }

    pub async fn load_records(&self, session_id: &str) -> Result<Vec<Record>> {
        self.storage.load_records(session_id).await
    }

    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        self.storage.list_sessions(limit).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.storage.get_session(session_id).await
    }

    /// Like `get_session` but a missing session is an error
    pub async fn require_session(&self, session_id: &str) -> Result<Session> {
        self.storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| CollectorError::SessionNotFound { session_id: session_id.to_string() }.into())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.storage.delete_session(session_id).await
    }

    pub async fn store_metrics(&self, session_id: &str, snapshot: &MetricsSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        self.storage.store_metrics(session_id, &json).await
    }

    pub async fn load_metrics(&self, session_id: &str) -> Result<Option<MetricsSnapshot>> {
        let session = self.require_session(session_id).await?;
        match session.metrics_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Rebuild the frontier of a session from its latest checkpoint
    ///
    /// Pending URLs already visited are dropped. Without a checkpoint the plan's
    /// targets form the frontier. Pagination links stored with visited pages are
    /// added, so progress made after the last checkpoint is not lost. With `retry_failed` set, failed pages are not
    /// treated as visited and are queued again.
    pub async fn resume_state(&self, session_id: &str, retry_failed: bool) -> Result<ResumeState> {
        let session = self.require_session(session_id).await?;

        if session.status == SessionStatus::Completed {
            return Err(CollectorError::SessionNotResumable {
                session_id: session_id.to_string(),
                reason: "session already completed".to_string(),
            }
            .into());
        }

        let plan = CollectionPlan::from_yaml(&session.plan_yaml)?;
        let visited = self.visited_urls(session_id, !retry_failed).await?;
        let checkpoint = self.storage.latest_checkpoint(session_id).await?;

        let mut candidates: Vec<String> = match &checkpoint {
            Some(cp) => cp.pending.clone(),
            None => plan.target_urls()?.into_iter().map(String::from).collect(),
        };
        // Links found after the last checkpoint
        candidates.extend(self.storage.discovered_links(session_id).await?);

        let mut seen = HashSet::new();
        let mut pending: Vec<String> = candidates
            .into_iter()
            .filter(|url| !visited.contains(url) && seen.insert(url.clone()))
            .collect();

        if retry_failed {
            for page in self.storage.failed_pages(session_id).await? {
                if seen.insert(page.url.clone()) {
                    pending.push(page.url);
                }
            }
        }

        info!(
            "Resuming session {}: {} pending, {} visited",
            session_id,
            pending.len(),
            visited.len()
        );

        Ok(ResumeState {
            counters: SessionCounters {
                pages_visited: session.pages_visited,
                records_collected: session.records_collected,
                failures: session.failures,
            },
            checkpoint_sequence: checkpoint.map(|cp| cp.sequence),
            session,
            plan,
            pending,
            visited,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(StorageManager::in_memory().unwrap()))
    }

    fn plan_with_targets(urls: &[&str]) -> CollectionPlan {
        let mut plan = CollectionPlan::example();
        plan.targets = urls
            .iter()
            .map(|u| crate::plan::TargetSpec { url: u.to_string(), label: None })
            .collect();
        plan
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_uses_targets() {
        let sessions = manager();
        let plan = plan_with_targets(&["https://a.test/1", "https://a.test/2"]);
        let session = sessions.create_session("demo", &plan).await.unwrap();

        sessions
            .record_page(&session.id, "https://a.test/1", &PageOutcome::Fetched { http_status: 200 }, &[], &[])
            .await
            .unwrap();
        sessions.mark_interrupted(&session.id).await.unwrap();

        let state = sessions.resume_state(&session.id, false).await.unwrap();
        assert_eq!(state.pending, vec!["https://a.test/2"]);
        assert!(state.visited.contains("https://a.test/1"));
        assert_eq!(state.plan, plan);
        assert_eq!(state.checkpoint_sequence, None);
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint_skips_visited() {
        let sessions = manager();
        let plan = plan_with_targets(&["https://a.test/1"]);
        let session = sessions.create_session("demo", &plan).await.unwrap();

        let record = json!({"q": "x"}).as_object().cloned().unwrap();
        sessions
            .record_page(&session.id, "https://a.test/1", &PageOutcome::Fetched { http_status: 200 }, &[record], &[])
            .await
            .unwrap();
        sessions
            .save_checkpoint(&session.id, &["https://a.test/1".to_string(), "https://a.test/2".to_string()])
            .await
            .unwrap();

        let state = sessions.resume_state(&session.id, false).await.unwrap();
        assert_eq!(state.pending, vec!["https://a.test/2"]);
        assert_eq!(state.counters.records_collected, 1);
        assert_eq!(state.checkpoint_sequence, Some(1));
    }

    #[tokio::test]
    async fn test_retry_failed_requeues_failures() {
        let sessions = manager();
        let plan = plan_with_targets(&["https://a.test/1"]);
        let session = sessions.create_session("demo", &plan).await.unwrap();

        sessions
            .record_page(&session.id, "https://a.test/1", &PageOutcome::Failed { error: "500".into() }, &[], &[])
            .await
            .unwrap();
        sessions.save_checkpoint(&session.id, &[]).await.unwrap();

        let without = sessions.resume_state(&session.id, false).await.unwrap();
        assert!(without.pending.is_empty());

        let with = sessions.resume_state(&session.id, true).await.unwrap();
        assert_eq!(with.pending, vec!["https://a.test/1"]);
    }

    #[tokio::test]
    async fn test_completed_session_is_not_resumable() {
        let sessions = manager();
        let session = sessions.create_session("demo", &CollectionPlan::example()).await.unwrap();
        sessions.mark_completed(&session.id).await.unwrap();

        let err = sessions.resume_state(&session.id, false).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CollectorError>(),
            Some(CollectorError::SessionNotResumable { .. })
        ));

        let missing = sessions.resume_state("missing", false).await.unwrap_err();
        assert!(matches!(
            missing.downcast_ref::<CollectorError>(),
            Some(CollectorError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_resume_recovers_links_found_after_checkpoint() {
        let sessions = manager();
        let plan = plan_with_targets(&["https://a.test/1"]);
        let session = sessions.create_session("demo", &plan).await.unwrap();

        // No checkpoint was written before the process stopped
        sessions
            .record_page(
                &session.id,
                "https://a.test/1",
                &PageOutcome::Fetched { http_status: 200 },
                &[],
                &["https://a.test/2".to_string(), "https://a.test/1".to_string()],
            )
            .await
            .unwrap();

        let state = sessions.resume_state(&session.id, false).await.unwrap();
        assert_eq!(state.pending, vec!["https://a.test/2"]);

        sessions
            .record_page(
                &session.id,
                "https://a.test/2",
                &PageOutcome::Fetched { http_status: 200 },
                &[],
                &["https://a.test/3".to_string()],
            )
            .await
            .unwrap();
        sessions.save_checkpoint(&session.id, &[]).await.unwrap();

        let state = sessions.resume_state(&session.id, false).await.unwrap();
        assert_eq!(state.pending, vec!["https://a.test/3"]);
    }
}
