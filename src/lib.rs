//! AI Data Collector - plan-driven web and file data collection
//!
//! This library provides the core functionality for the `adc` tool, including:
//! - YAML collection plans with extraction, pagination and processing rules
//! - Pluggable scraper engines (HTTP and local files) with robots.txt, rate limiting and retry
//! - A processor pipeline for cleaning, validation, filtering and deduplication
//! - CSV, JSON, JSONL and YAML exporters
//! - Persisted sessions with checkpoint/resume
//! - Security validation and run metrics

pub mod config;
pub mod core;
pub mod error;
pub mod export;
pub mod logging;
pub mod metrics;
pub mod plan;
pub mod scraper;
pub mod security;
pub mod session;
pub mod storage;
pub mod utils;

// Re-export main types for convenience
pub use crate::config::AppConfig;
pub use crate::core::{CancellationHandle, CollectOptions, CollectionReport, DataCollector};
pub use crate::error::{CollectorError, CollectorResult, ContextualError};
pub use crate::plan::{CollectionPlan, ExportFormat, Record};
