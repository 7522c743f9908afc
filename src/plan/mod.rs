use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use url::Url;

use crate::error::CollectorError;

/// A collected record: field name to value, plus `_`-prefixed metadata
pub type Record = serde_json::Map<String, serde_json::Value>;

pub const META_SOURCE_URL: &str = "_source_url";
pub const META_COLLECTED_AT: &str = "_collected_at";
pub const META_ENGINE: &str = "_engine";
pub const META_SESSION_ID: &str = "_session_id";
pub const META_PROCESSED_AT: &str = "_processed_at";

/// Metadata keys are excluded from deduplication and sensitive-field checks
pub fn is_metadata_key(key: &str) -> bool {
    key.starts_with('_')
}

/// Collection plan: what to fetch, what to extract and where to write it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionPlan {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub targets: Vec<TargetSpec>,
    pub extraction: ExtractionRules,
    #[serde(default)]
    pub pagination: Option<Pagination>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub processing: ProcessingOptions,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default = "default_true")]
    pub respect_robots_txt: bool,
    /// Preferred engine name; chosen by URL scheme when absent
    #[serde(default)]
    pub engine: Option<String>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetSpec {
    pub url: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionRules {
    /// CSS selector (HTML) or JSON pointer (JSON) selecting the items of a page
    #[serde(default)]
    pub item_selector: Option<String>,
    pub fields: Vec<FieldRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldRule {
    pub name: String,
    pub selector: String,
    #[serde(default)]
    pub extract: ExtractMode,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub transforms: Vec<Transform>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// What to take from a matched element
///
/// Written in plans as `text`, `html`, `href`, `src`, `attr(name)` or `{attr: name}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(try_from = "ExtractModeRepr", into = "String")]
pub enum ExtractMode {
    #[default]
    Text,
    Html,
    Attr(String),
    Href,
    Src,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExtractModeRepr {
    Name(String),
    Attr { attr: String },
}

impl TryFrom<ExtractModeRepr> for ExtractMode {
    type Error = CollectorError;

    fn try_from(repr: ExtractModeRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            ExtractModeRepr::Name(name) => name.parse(),
            ExtractModeRepr::Attr { attr } => ExtractMode::attr(attr),
        }
    }
}

impl ExtractMode {
    fn attr(name: impl Into<String>) -> std::result::Result<Self, CollectorError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(CollectorError::plan("attribute name must not be empty"));
        }
        Ok(ExtractMode::Attr(name))
    }
}

impl FromStr for ExtractMode {
    type Err = CollectorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(inner) = trimmed
            .strip_prefix("attr(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return ExtractMode::attr(inner);
        }

        match trimmed.to_lowercase().as_str() {
            "text" => Ok(ExtractMode::Text),
            "html" => Ok(ExtractMode::Html),
            "href" => Ok(ExtractMode::Href),
            "src" => Ok(ExtractMode::Src),
            other => Err(CollectorError::plan(format!(
                "unknown extract mode '{}' (expected text, html, href, src or attr(name))",
                other
            ))),
        }
    }
}

impl fmt::Display for ExtractMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractMode::Text => f.write_str("text"),
            ExtractMode::Html => f.write_str("html"),
            ExtractMode::Attr(name) => write!(f, "attr({})", name),
            ExtractMode::Href => f.write_str("href"),
            ExtractMode::Src => f.write_str("src"),
        }
    }
}

impl From<ExtractMode> for String {
    fn from(mode: ExtractMode) -> Self {
        mode.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    Trim,
    Lowercase,
    Uppercase,
    CollapseWhitespace,
    StripHtml,
    ParseNumber,
    Regex { pattern: String, replacement: String },
    ExtractDomain,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pagination {
    pub next_selector: String,
    #[serde(default)]
    pub max_pages: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Limits {
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub max_items: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProcessingOptions {
    #[serde(default)]
    pub dedupe_keys: Option<Vec<String>>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    pub field: String,
    pub condition: FilterCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterCondition {
    Contains { value: String },
    NotContains { value: String },
    Equals { value: String },
    NotEquals { value: String },
    Regex { pattern: String },
    MinLength { min: usize },
    MaxLength { max: usize },
    NotEmpty,
    MinValue { min: f64 },
    MaxValue { max: f64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputSpec {
    #[serde(default = "default_formats")]
    pub formats: Vec<ExportFormat>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub compress: bool,
}

fn default_formats() -> Vec<ExportFormat> {
    vec![ExportFormat::Csv]
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            formats: default_formats(),
            path: None,
            compress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
    Jsonl,
    Yaml,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Jsonl => "jsonl",
            Self::Yaml => "yaml",
        }
    }

    pub fn all() -> [ExportFormat; 4] {
        [Self::Csv, Self::Json, Self::Jsonl, Self::Yaml]
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => Err(CollectorError::UnsupportedFormat { format: other.to_string() }),
        }
    }
}

impl CollectionPlan {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let plan: CollectionPlan = serde_yaml::from_str(yaml)
            .map_err(|e| CollectorError::plan(format!("Invalid plan YAML: {}", e)))?;
        Ok(plan)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CollectorError::plan(format!("Cannot read plan {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Parse every target URL
    pub fn target_urls(&self) -> Result<Vec<Url>> {
        self.targets
            .iter()
            .map(|t| {
                Url::parse(t.url.trim())
                    .map_err(|e| anyhow::Error::from(CollectorError::plan(format!("Invalid target URL '{}': {}", t.url, e))))
            })
            .collect()
    }

    /// Upper bound on pages fetched in one session
    pub fn page_budget(&self) -> Option<usize> {
        let pagination_budget = self.pagination.as_ref().and_then(|p| p.max_pages).map(|per_target| {
            per_target.saturating_mul(self.targets.len().max(1))
        });

        match (self.limits.max_pages, pagination_budget) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Structural checks; URL policy is enforced separately by the security layer
    pub fn validate_structure(&self) -> Result<()> {
        debug!("Validating plan structure: {}", self.name);

        if self.name.trim().is_empty() {
            return Err(CollectorError::plan("Plan name cannot be empty").into());
        }

        if self.targets.is_empty() {
            return Err(CollectorError::plan("At least one target is required").into());
        }
        self.target_urls()?;

        if self.extraction.fields.is_empty() {
            return Err(CollectorError::plan("At least one extraction field is required").into());
        }

        let mut seen = HashSet::new();
        for field in &self.extraction.fields {
            if field.name.trim().is_empty() {
                return Err(CollectorError::plan("Field name cannot be empty").into());
            }
            if is_metadata_key(&field.name) {
                return Err(CollectorError::plan(format!(
                    "Field name '{}' uses the reserved '_' prefix", field.name
                )).into());
            }
            if !seen.insert(field.name.as_str()) {
                return Err(CollectorError::plan(format!("Duplicate field name: {}", field.name)).into());
            }
            if field.selector.trim().is_empty() {
                return Err(CollectorError::plan(format!("Field '{}' has an empty selector", field.name)).into());
            }
            for transform in &field.transforms {
                if let Transform::Regex { pattern, .. } = transform {
                    regex::Regex::new(pattern).map_err(|e| {
                        CollectorError::plan(format!("Invalid regex in field '{}': {}", field.name, e))
                    })?;
                }
            }
        }

        if let Some(pagination) = &self.pagination {
            if pagination.next_selector.trim().is_empty() {
                return Err(CollectorError::plan("Pagination next_selector cannot be empty").into());
            }
            if pagination.max_pages == Some(0) {
                return Err(CollectorError::plan("Pagination max_pages must be greater than 0").into());
            }
        }

        if self.limits.max_pages == Some(0) {
            return Err(CollectorError::plan("limits.max_pages must be greater than 0").into());
        }
        if self.limits.max_items == Some(0) {
            return Err(CollectorError::plan("limits.max_items must be greater than 0").into());
        }

        for filter in &self.processing.filters {
            if let FilterCondition::Regex { pattern } = &filter.condition {
                regex::Regex::new(pattern).map_err(|e| {
                    CollectorError::plan(format!("Invalid filter regex on '{}': {}", filter.field, e))
                })?;
            }
        }

        if self.output.formats.is_empty() {
            return Err(CollectorError::plan("At least one output format is required").into());
        }

        Ok(())
    }

    /// Example plan written by `adc init-plan`
    pub fn example() -> Self {
        Self {
            name: "quotes".to_string(),
            version: default_version(),
            targets: vec![TargetSpec {
                url: "https://quotes.toscrape.com/".to_string(),
                label: Some("front page".to_string()),
            }],
            extraction: ExtractionRules {
                item_selector: Some("div.quote".to_string()),
                fields: vec![
                    FieldRule {
                        name: "text".to_string(),
                        selector: "span.text".to_string(),
                        extract: ExtractMode::Text,
                        required: true,
                        transforms: vec![Transform::Trim, Transform::CollapseWhitespace],
                        default: None,
                    },
                    FieldRule {
                        name: "author".to_string(),
                        selector: "small.author".to_string(),
                        extract: ExtractMode::Text,
                        required: true,
                        transforms: vec![Transform::Trim],
                        default: None,
                    },
                    FieldRule {
                        name: "author_url".to_string(),
                        selector: "a[href*='/author/']".to_string(),
                        extract: ExtractMode::Href,
                        required: false,
                        transforms: vec![],
                        default: None,
                    },
                ],
            },
            pagination: Some(Pagination {
                next_selector: "li.next a".to_string(),
                max_pages: Some(5),
            }),
            limits: Limits {
                max_pages: Some(10),
                max_items: Some(500),
            },
            processing: ProcessingOptions {
                dedupe_keys: Some(vec!["text".to_string()]),
                required_fields: vec!["text".to_string()],
                filters: vec![Filter {
                    field: "text".to_string(),
                    condition: FilterCondition::MinLength { min: 3 },
                }],
                sort_by: Some("author".to_string()),
                sort_order: SortOrder::Asc,
            },
            output: OutputSpec {
                formats: vec![ExportFormat::Csv, ExportFormat::Json],
                path: None,
                compress: false,
            },
            headers: None,
            respect_robots_txt: true,
            engine: None,
        }
    }
}
