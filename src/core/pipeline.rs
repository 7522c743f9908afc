use anyhow::Result;
use dashmap::DashSet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::ProcessingConfig;
use crate::error::CollectorError;
use crate::plan::{is_metadata_key, Filter, FilterCondition, ProcessingOptions, Record, SortOrder, META_PROCESSED_AT};
use crate::scraper::extractor::parse_number;
use crate::utils::sha256_hex;

/// Ordered chain of processors applied to collected records
pub struct ProcessorPipeline {
    processors: Vec<Box<dyn Processor>>,
    config: ProcessingConfig,
}

/// A single pipeline stage
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;
    fn is_enabled(&self, config: &ProcessingConfig) -> bool;
    async fn process(&self, data: PipelineData) -> Result<PipelineData>;

    /// Stages that must see every record at once run after batching
    fn requires_full_dataset(&self) -> bool {
        false
    }

    /// Clear state carried between batches
    fn reset(&self) {}
}

/// Data flowing through the pipeline
#[derive(Debug, Clone, Default)]
pub struct PipelineData {
    pub items: Vec<Record>,
    pub metadata: HashMap<String, Value>,
    pub stage_info: Vec<StageInfo>,
}

impl PipelineData {
    pub fn new(items: Vec<Record>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageInfo {
    pub name: String,
    pub processed_at: chrono::DateTime<chrono::Utc>,
    pub items_in: usize,
    pub items_out: usize,
    pub duration_ms: u64,
}

impl ProcessorPipeline {
    /// Pipeline with no stages
    pub fn empty(config: ProcessingConfig) -> Self {
        Self {
            processors: Vec::new(),
            config,
        }
    }

    /// Default stage order: cleaning, validation, filter, deduplication,
    /// normalization, enrichment, sorting
    pub fn new(config: ProcessingConfig, options: &ProcessingOptions) -> Result<Self> {
        let mut pipeline = Self::empty(config);

        pipeline.add_processor(Box::new(CleaningStage));
        pipeline.add_processor(Box::new(ValidationStage::new(options.required_fields.clone())));
        pipeline.add_processor(Box::new(FilterStage::new(&options.filters)?));
        pipeline.add_processor(Box::new(DeduplicationStage::new(options.dedupe_keys.clone())));
        pipeline.add_processor(Box::new(NormalizationStage::new(pipeline.config.normalize_numbers)));
        pipeline.add_processor(Box::new(EnrichmentStage));
        pipeline.add_processor(Box::new(SortingStage::new(options.sort_by.clone(), options.sort_order)));

        Ok(pipeline)
    }

    pub fn add_processor(&mut self, processor: Box<dyn Processor>) {
        self.processors.push(processor);
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Process data through all enabled stages
    pub async fn process(&self, data: PipelineData) -> Result<PipelineData> {
        self.reset();
        info!("Starting pipeline processing with {} items", data.items.len());

        let data = self.run_stages(data, |_| true).await?;

        info!("Pipeline processing completed with {} items", data.items.len());
        Ok(data)
    }

    /// Process records in chunks of `batch_size`
    ///
    /// Deduplication state is shared across chunks. Stages needing the whole
    /// dataset (sorting) run once over the concatenated output.
    pub async fn process_batched(&self, items: Vec<Record>) -> Result<PipelineData> {
        self.reset();
        let batch_size = self.config.batch_size.max(1);
        info!("Starting batched pipeline processing: {} items, batch size {}", items.len(), batch_size);

        let mut all_items = Vec::with_capacity(items.len());
        let mut stage_totals: Vec<StageInfo> = Vec::new();

        let mut remaining = items.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<Record> = remaining.by_ref().take(batch_size).collect();
            let processed = self
                .run_stages(PipelineData::new(chunk), |p| !p.requires_full_dataset())
                .await?;
            merge_stage_info(&mut stage_totals, processed.stage_info);
            all_items.extend(processed.items);
        }

        let finished = self
            .run_stages(PipelineData::new(all_items), |p| p.requires_full_dataset())
            .await?;
        merge_stage_info(&mut stage_totals, finished.stage_info);

        info!("Batched pipeline processing completed with {} items", finished.items.len());
        Ok(PipelineData {
            items: finished.items,
            metadata: finished.metadata,
            stage_info: stage_totals,
        })
    }

    fn reset(&self) {
        for processor in &self.processors {
            processor.reset();
        }
    }

    async fn run_stages<F>(&self, mut data: PipelineData, include: F) -> Result<PipelineData>
    where
        F: Fn(&dyn Processor) -> bool,
    {
        for processor in &self.processors {
            if !include(processor.as_ref()) {
                continue;
            }
            if !processor.is_enabled(&self.config) {
                debug!("Skipping disabled stage: {}", processor.name());
                continue;
            }

            let start_time = std::time::Instant::now();
            let items_in = data.items.len();

            let mut stage_info = std::mem::take(&mut data.stage_info);
            data = processor.process(data).await.map_err(|e| CollectorError::Pipeline {
                stage: processor.name().to_string(),
                message: e.to_string(),
            })?;

            let elapsed = start_time.elapsed();
            let items_out = data.items.len();
            stage_info.push(StageInfo {
                name: processor.name().to_string(),
                processed_at: chrono::Utc::now(),
                items_in,
                items_out,
                duration_ms: elapsed.as_millis() as u64,
            });
            data.stage_info = stage_info;

            debug!(
                "Stage {} completed: {} -> {} items in {}ms",
                processor.name(),
                items_in,
                items_out,
                elapsed.as_millis()
            );
        }

        Ok(data)
    }
}

fn merge_stage_info(totals: &mut Vec<StageInfo>, batch: Vec<StageInfo>) {
    for info in batch {
        match totals.iter_mut().find(|t| t.name == info.name) {
            Some(total) => {
                total.items_in += info.items_in;
                total.items_out += info.items_out;
                total.duration_ms += info.duration_ms;
                total.processed_at = info.processed_at;
            }
            None => totals.push(info),
        }
    }
}

fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        _ => false,
    }
}

/// Cleaning stage - strips markup and normalizes whitespace in string fields
pub struct CleaningStage;

impl CleaningStage {
    fn clean(text: &str) -> String {
        let stripped = crate::scraper::extractor::strip_tags(text);
        let decoded = html_escape::decode_html_entities(&stripped);
        decoded.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

#[async_trait::async_trait]
impl Processor for CleaningStage {
    fn name(&self) -> &str {
        "cleaning"
    }

    fn is_enabled(&self, config: &ProcessingConfig) -> bool {
        config.enable_cleaning
    }

    async fn process(&self, mut data: PipelineData) -> Result<PipelineData> {
        for item in &mut data.items {
            for (key, value) in item.iter_mut() {
                if is_metadata_key(key) {
                    continue;
                }
                if let Value::String(text) = value {
                    *text = Self::clean(text);
                }
            }
        }
        Ok(data)
    }
}

/// Validation stage - drops records missing required fields
pub struct ValidationStage {
    required_fields: Vec<String>,
}

impl ValidationStage {
    pub fn new(required_fields: Vec<String>) -> Self {
        Self { required_fields }
    }
}

#[async_trait::async_trait]
impl Processor for ValidationStage {
    fn name(&self) -> &str {
        "validation"
    }

    fn is_enabled(&self, config: &ProcessingConfig) -> bool {
        config.enable_validation
    }

    async fn process(&self, mut data: PipelineData) -> Result<PipelineData> {
        let original_count = data.items.len();
        data.items
            .retain(|item| self.required_fields.iter().all(|field| !is_blank(item.get(field))));

        let dropped = original_count - data.items.len();
        if dropped > 0 {
            warn!("Validation stage dropped {} records missing required fields", dropped);
        }
        Ok(data)
    }
}

enum CompiledCondition {
    Plain(FilterCondition),
    Regex(Regex),
}

/// Filter stage - keeps records matching every plan filter
pub struct FilterStage {
    filters: Vec<(String, CompiledCondition)>,
}

impl FilterStage {
    pub fn new(filters: &[Filter]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(filters.len());
        for filter in filters {
            let condition = match &filter.condition {
                FilterCondition::Regex { pattern } => CompiledCondition::Regex(Regex::new(pattern).map_err(|e| {
                    CollectorError::plan(format!("Invalid filter regex '{}' on {}: {}", pattern, filter.field, e))
                })?),
                other => CompiledCondition::Plain(other.clone()),
            };
            compiled.push((filter.field.clone(), condition));
        }
        Ok(Self { filters: compiled })
    }

    fn matches(value: Option<&Value>, condition: &CompiledCondition) -> bool {
        let text = value.and_then(field_text).unwrap_or_default();
        let number = || match value {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => parse_number(s).and_then(|v| v.as_f64()),
            _ => None,
        };

        match condition {
            CompiledCondition::Regex(regex) => regex.is_match(&text),
            CompiledCondition::Plain(condition) => match condition {
                FilterCondition::Contains { value } => text.contains(value.as_str()),
                FilterCondition::NotContains { value } => !text.contains(value.as_str()),
                FilterCondition::Equals { value } => text == *value,
                FilterCondition::NotEquals { value } => text != *value,
                FilterCondition::MinLength { min } => text.chars().count() >= *min,
                FilterCondition::MaxLength { max } => text.chars().count() <= *max,
                FilterCondition::NotEmpty => !text.trim().is_empty(),
                FilterCondition::MinValue { min } => number().map_or(false, |n| n >= *min),
                FilterCondition::MaxValue { max } => number().map_or(false, |n| n <= *max),
                FilterCondition::Regex { .. } => true,
            },
        }
    }
}

#[async_trait::async_trait]
impl Processor for FilterStage {
    fn name(&self) -> &str {
        "filter"
    }

    fn is_enabled(&self, config: &ProcessingConfig) -> bool {
        config.enable_filtering && !self.filters.is_empty()
    }

    async fn process(&self, mut data: PipelineData) -> Result<PipelineData> {
        let original_count = data.items.len();
        data.items.retain(|item| {
            self.filters
                .iter()
                .all(|(field, condition)| Self::matches(item.get(field), condition))
        });

        debug!("Filter stage kept {} of {} records", data.items.len(), original_count);
        Ok(data)
    }
}

/// Deduplication stage - removes records whose key hash was already seen
pub struct DeduplicationStage {
    keys: Option<Vec<String>>,
    seen: DashSet<String>,
}

impl DeduplicationStage {
    pub fn new(keys: Option<Vec<String>>) -> Self {
        Self {
            keys: keys.filter(|k| !k.is_empty()),
            seen: DashSet::new(),
        }
    }

    fn calculate_hash(&self, item: &Record) -> String {
        let material = match &self.keys {
            Some(keys) => {
                let values: Vec<&Value> = keys.iter().map(|k| item.get(k).unwrap_or(&Value::Null)).collect();
                serde_json::to_string(&values).unwrap_or_default()
            }
            None => {
                let content: Record = item
                    .iter()
                    .filter(|(k, _)| !is_metadata_key(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Value::Object(content).to_string()
            }
        };
        sha256_hex(material.as_bytes())
    }
}

#[async_trait::async_trait]
impl Processor for DeduplicationStage {
    fn name(&self) -> &str {
        "deduplication"
    }

    fn is_enabled(&self, config: &ProcessingConfig) -> bool {
        config.enable_deduplication
    }

    async fn process(&self, mut data: PipelineData) -> Result<PipelineData> {
        let original_count = data.items.len();
        data.items.retain(|item| self.seen.insert(self.calculate_hash(item)));

        let duplicate_count = original_count - data.items.len();
        if duplicate_count > 0 {
            info!("Deduplication stage removed {} duplicate records", duplicate_count);
        }
        Ok(data)
    }

    fn reset(&self) {
        self.seen.clear();
    }
}

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '¥', '₹', '₩', '₽', '¢'];

/// Normalization stage - canonical URLs and currency amounts as numbers
pub struct NormalizationStage {
    normalize_numbers: bool,
}

impl NormalizationStage {
    pub fn new(normalize_numbers: bool) -> Self {
        Self { normalize_numbers }
    }

    fn normalize_value(&self, value: &mut Value) {
        let Value::String(text) = value else {
            return;
        };
        let trimmed = text.trim();
        let lower = trimmed.to_ascii_lowercase();

        if lower.starts_with("http://") || lower.starts_with("https://") {
            if let Ok(url) = url::Url::parse(trimmed) {
                *value = Value::String(url.to_string());
            }
            return;
        }

        if self.normalize_numbers && trimmed.contains(CURRENCY_SYMBOLS) {
            let amount: String = trimmed
                .chars()
                .filter(|c| !CURRENCY_SYMBOLS.contains(c) && *c != ',' && !c.is_whitespace())
                .collect();
            if amount.parse::<f64>().is_ok() {
                if let Some(number) = parse_number(&amount) {
                    *value = number;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Processor for NormalizationStage {
    fn name(&self) -> &str {
        "normalization"
    }

    fn is_enabled(&self, config: &ProcessingConfig) -> bool {
        config.enable_normalization
    }

    async fn process(&self, mut data: PipelineData) -> Result<PipelineData> {
        for item in &mut data.items {
            for (key, value) in item.iter_mut() {
                if !is_metadata_key(key) {
                    self.normalize_value(value);
                }
            }
        }
        Ok(data)
    }
}

/// Enrichment stage - stamps processing time
pub struct EnrichmentStage;

#[async_trait::async_trait]
impl Processor for EnrichmentStage {
    fn name(&self) -> &str {
        "enrichment"
    }

    fn is_enabled(&self, config: &ProcessingConfig) -> bool {
        config.enable_enrichment
    }

    async fn process(&self, mut data: PipelineData) -> Result<PipelineData> {
        let now = Value::String(chrono::Utc::now().to_rfc3339());
        for item in &mut data.items {
            item.entry(META_PROCESSED_AT).or_insert_with(|| now.clone());
        }
        Ok(data)
    }
}

/// Sorting stage - orders records by one field; missing values go last
pub struct SortingStage {
    field: Option<String>,
    order: SortOrder,
}

impl SortingStage {
    pub fn new(field: Option<String>, order: SortOrder) -> Self {
        Self { field, order }
    }

    fn rank(value: &Value) -> u8 {
        match value {
            Value::Number(_) => 0,
            Value::String(_) => 1,
            Value::Bool(_) => 2,
            _ => 3,
        }
    }

    fn compare(a: &Value, b: &Value) -> Ordering {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => Self::rank(a).cmp(&Self::rank(b)),
        }
    }
}

#[async_trait::async_trait]
impl Processor for SortingStage {
    fn name(&self) -> &str {
        "sorting"
    }

    fn is_enabled(&self, _config: &ProcessingConfig) -> bool {
        self.field.is_some()
    }

    fn requires_full_dataset(&self) -> bool {
        true
    }

    async fn process(&self, mut data: PipelineData) -> Result<PipelineData> {
        let Some(field) = &self.field else {
            return Ok(data);
        };

        data.items.sort_by(|a, b| {
            let left = a.get(field).filter(|v| !v.is_null());
            let right = b.get(field).filter(|v| !v.is_null());
            match (left, right) {
                (Some(x), Some(y)) => {
                    let ordering = Self::compare(x, y);
                    match self.order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
        Ok(data)
    }
}
