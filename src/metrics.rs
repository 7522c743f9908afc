use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tracing::debug;

use crate::config::MetricsConfig;
use crate::utils::{format_duration, format_file_size};

/// Run metrics shared by the engines and the orchestrator
pub struct MetricsCollector {
    requests_total: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    retries: AtomicU64,
    bytes_downloaded: AtomicU64,
    pages_visited: AtomicU64,
    pages_failed: AtomicU64,
    records_extracted: AtomicU64,
    robots_blocked: AtomicU64,
    per_domain: DashMap<String, DomainCounters>,
    response_samples: Mutex<VecDeque<u64>>,
    max_samples: usize,
    sample_process_memory: bool,
    started: Instant,
}

#[derive(Debug, Default, Clone)]
struct DomainCounters {
    requests: u64,
    successes: u64,
    failures: u64,
    retries: u64,
    bytes: u64,
    response_ms_total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub bytes: u64,
    pub avg_response_ms: f64,
}

/// Point-in-time view of a run, persisted as JSON on the session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub bytes_downloaded: u64,
    pub pages_visited: u64,
    pub pages_failed: u64,
    pub records_extracted: u64,
    pub robots_blocked: u64,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub p50_response_ms: u64,
    pub p95_response_ms: u64,
    pub pages_per_second: f64,
    pub elapsed_seconds: f64,
    pub process_memory_mb: Option<f64>,
    pub per_domain: BTreeMap<String, DomainSnapshot>,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

impl MetricsCollector {
    pub fn new(max_samples: usize, sample_process_memory: bool) -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_succeeded: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            pages_visited: AtomicU64::new(0),
            pages_failed: AtomicU64::new(0),
            records_extracted: AtomicU64::new(0),
            robots_blocked: AtomicU64::new(0),
            per_domain: DashMap::new(),
            response_samples: Mutex::new(VecDeque::with_capacity(max_samples.min(1024))),
            max_samples: max_samples.max(1),
            sample_process_memory,
            started: Instant::now(),
        }
    }

    pub fn from_config(config: &MetricsConfig) -> Self {
        Self::new(config.max_response_samples, config.sample_process_memory)
    }

    /// One request attempt, successful or not
    pub fn record_request(&self, domain: &str, duration: Duration, success: bool, bytes: u64) {
        let millis = duration.as_millis() as u64;

        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);

        {
            let mut entry = self.per_domain.entry(domain.to_string()).or_default();
            entry.requests += 1;
            if success {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
            entry.bytes += bytes;
            entry.response_ms_total += millis;
        }

        if let Ok(mut samples) = self.response_samples.lock() {
            if samples.len() >= self.max_samples {
                samples.pop_front();
            }
            samples.push_back(millis);
        }
    }

    pub fn record_retry(&self, domain: &str) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.per_domain.entry(domain.to_string()).or_default().retries += 1;
    }

    pub fn record_robots_blocked(&self, domain: &str) {
        debug!("robots.txt blocked a request to {}", domain);
        self.robots_blocked.fetch_add(1, Ordering::Relaxed);
    }

    /// A page that finished processing, with the number of records it yielded
    pub fn record_page(&self, success: bool, records: usize) {
        if success {
            self.pages_visited.fetch_add(1, Ordering::Relaxed);
            self.records_extracted.fetch_add(records as u64, Ordering::Relaxed);
        } else {
            self.pages_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let requests_succeeded = self.requests_succeeded.load(Ordering::Relaxed);
        let pages_visited = self.pages_visited.load(Ordering::Relaxed);

        let mut samples: Vec<u64> = self
            .response_samples
            .lock()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        samples.sort_unstable();

        let avg_response_ms = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<u64>() as f64 / samples.len() as f64
        };

        let elapsed = self.started.elapsed().as_secs_f64();
        let pages_per_second = if elapsed > 0.0 { pages_visited as f64 / elapsed } else { 0.0 };

        let per_domain = self
            .per_domain
            .iter()
            .map(|entry| {
                let c = entry.value();
                let avg = if c.requests > 0 { c.response_ms_total as f64 / c.requests as f64 } else { 0.0 };
                (
                    entry.key().clone(),
                    DomainSnapshot {
                        requests: c.requests,
                        successes: c.successes,
                        failures: c.failures,
                        retries: c.retries,
                        bytes: c.bytes,
                        avg_response_ms: avg,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            requests_total,
            requests_succeeded,
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            pages_visited,
            pages_failed: self.pages_failed.load(Ordering::Relaxed),
            records_extracted: self.records_extracted.load(Ordering::Relaxed),
            robots_blocked: self.robots_blocked.load(Ordering::Relaxed),
            success_rate: if requests_total > 0 {
                requests_succeeded as f64 / requests_total as f64
            } else {
                0.0
            },
            avg_response_ms,
            p50_response_ms: percentile(&samples, 50.0),
            p95_response_ms: percentile(&samples, 95.0),
            pages_per_second,
            elapsed_seconds: elapsed,
            process_memory_mb: if self.sample_process_memory { process_memory_mb() } else { None },
            per_domain,
            captured_at: chrono::Utc::now(),
        }
    }
}

/// Nearest-rank percentile over sorted samples
fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn process_memory_mb() -> Option<f64> {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return None;
    }
    system
        .process(pid)
        .map(|process| process.memory() as f64 / (1024.0 * 1024.0))
}

impl MetricsSnapshot {
    /// Human-readable lines for the CLI
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!(
                "Requests: {} ({} ok, {} failed, {} retries), success rate {:.1}%",
                self.requests_total,
                self.requests_succeeded,
                self.requests_failed,
                self.retries,
                self.success_rate * 100.0
            ),
            format!(
                "Pages: {} visited, {} failed, {} blocked by robots.txt",
                self.pages_visited, self.pages_failed, self.robots_blocked
            ),
            format!("Records extracted: {}", self.records_extracted),
            format!(
                "Response time: avg {:.0}ms, p50 {}ms, p95 {}ms",
                self.avg_response_ms, self.p50_response_ms, self.p95_response_ms
            ),
            format!(
                "Downloaded {} in {} ({:.2} pages/s)",
                format_file_size(self.bytes_downloaded),
                format_duration(Duration::from_secs_f64(self.elapsed_seconds.max(0.0))),
                self.pages_per_second
            ),
        ];

        if let Some(memory) = self.process_memory_mb {
            lines.push(format!("Process memory: {:.1} MB", memory));
        }

        for (domain, stats) in &self.per_domain {
            lines.push(format!(
                "  {}: {} requests, {} failures, {} retries, avg {:.0}ms",
                domain, stats.requests, stats.failures, stats.retries, stats.avg_response_ms
            ));
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_rates() {
        let metrics = MetricsCollector::new(100, false);
        metrics.record_request("a.com", Duration::from_millis(100), true, 1000);
        metrics.record_request("a.com", Duration::from_millis(300), false, 0);
        metrics.record_retry("a.com");
        metrics.record_request("b.com", Duration::from_millis(200), true, 500);
        metrics.record_page(true, 7);
        metrics.record_page(false, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 3);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.bytes_downloaded, 1500);
        assert_eq!(snapshot.records_extracted, 7);
        assert_eq!(snapshot.pages_visited, 1);
        assert_eq!(snapshot.pages_failed, 1);
        assert!((snapshot.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.avg_response_ms - 200.0).abs() < 1e-9);
        assert_eq!(snapshot.p50_response_ms, 200);
        assert_eq!(snapshot.p95_response_ms, 300);
        assert_eq!(snapshot.per_domain["a.com"].retries, 1);
        assert_eq!(snapshot.per_domain["b.com"].requests, 1);
        assert!(snapshot.process_memory_mb.is_none());
    }

    #[test]
    fn test_response_samples_are_bounded() {
        let metrics = MetricsCollector::new(10, false);
        for i in 0..25u64 {
            metrics.record_request("a.com", Duration::from_millis(i), true, 0);
        }

        assert_eq!(metrics.response_samples.lock().unwrap().len(), 10);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 25);
        assert_eq!(snapshot.p50_response_ms, 19);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = MetricsCollector::new(10, false).snapshot();
        assert_eq!(snapshot.success_rate, 0.0);
        assert_eq!(snapshot.p95_response_ms, 0);
        assert!(snapshot.summary_lines().len() >= 5);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let samples: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&samples, 50.0), 50);
        assert_eq!(percentile(&samples, 95.0), 95);
        assert_eq!(percentile(&[42], 95.0), 42);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = MetricsCollector::new(10, true);
        metrics.record_request("a.com", Duration::from_millis(5), true, 10);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        let back: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.requests_total, 1);
    }
}
