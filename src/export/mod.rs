use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub mod csv_exporter;
pub mod json_exporter;
pub mod yaml_exporter;

pub use csv_exporter::CsvExporter;
pub use json_exporter::{JsonExporter, JsonlExporter};
pub use yaml_exporter::YamlExporter;

use crate::config::ExportConfig;
use crate::error::CollectorError;
use crate::plan::{ExportFormat, Record};
use crate::utils::sanitize_filename;

/// Writes records to a file in one format
#[async_trait::async_trait]
pub trait Exporter: Send + Sync {
    fn format(&self) -> ExportFormat;
    async fn export(&self, data: &[Record], output_path: &Path) -> Result<InternalExportStats>;
}

/// Result of a single exporter run
#[derive(Debug, Clone, Copy)]
pub struct InternalExportStats {
    pub file_size_bytes: u64,
}

/// Builds exporters by format
pub struct ExporterFactory;

impl ExporterFactory {
    pub fn create(format: ExportFormat, config: &ExportConfig) -> Box<dyn Exporter> {
        match format {
            ExportFormat::Csv => Box::new(CsvExporter::new()),
            ExportFormat::Json => Box::new(JsonExporter::new(config.pretty_json)),
            ExportFormat::Jsonl => Box::new(JsonlExporter),
            ExportFormat::Yaml => Box::new(YamlExporter),
        }
    }

    /// Look up an exporter by format name (`csv`, `json`, `jsonl`, `yaml`)
    pub fn create_by_name(name: &str, config: &ExportConfig) -> Result<Box<dyn Exporter>> {
        let format: ExportFormat = name.parse()?;
        Ok(Self::create(format, config))
    }
}

/// Export statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportStats {
    pub format: ExportFormat,
    pub file_path: PathBuf,
    pub record_count: usize,
    pub file_size_bytes: u64,
    pub export_duration_ms: u64,
    pub compressed: bool,
}

/// Export manager for handling different output formats
pub struct ExportManager {
    config: ExportConfig,
    fallback_columns: Vec<String>,
}

impl ExportManager {
    pub fn new(config: &ExportConfig) -> Self {
        Self {
            config: config.clone(),
            fallback_columns: Vec::new(),
        }
    }

    /// Header used by tabular formats when there are no records
    pub fn with_fallback_columns(mut self, columns: Vec<String>) -> Self {
        self.fallback_columns = columns;
        self
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    fn exporter_for(&self, format: ExportFormat) -> Box<dyn Exporter> {
        match format {
            ExportFormat::Csv => Box::new(CsvExporter::new().with_fallback_columns(self.fallback_columns.clone())),
            other => ExporterFactory::create(other, &self.config),
        }
    }

    /// Export data to one file, gzip-compressing it when asked or configured
    pub async fn export(
        &self,
        data: &[Record],
        output_path: &Path,
        format: ExportFormat,
        compress: bool,
    ) -> Result<ExportStats> {
        info!("Exporting {} records to {} as {}", data.len(), output_path.display(), format);
        let start_time = std::time::Instant::now();

        self.validate_export_size(data)?;

        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let exporter = self.exporter_for(format);
        let mut stats = exporter.export(data, output_path).await.map_err(|e| {
            CollectorError::export(format!("{} export to {} failed: {}", format, output_path.display(), e))
        })?;

        let compressed = compress || self.config.compression_enabled;
        let file_path = if compressed {
            let path = compress_file(output_path).await?;
            stats.file_size_bytes = tokio::fs::metadata(&path).await?.len();
            path
        } else {
            output_path.to_path_buf()
        };

        let final_stats = ExportStats {
            format,
            file_path,
            record_count: data.len(),
            file_size_bytes: stats.file_size_bytes,
            export_duration_ms: start_time.elapsed().as_millis() as u64,
            compressed,
        };

        info!(
            "Export completed: {} records in {}ms, file size: {} bytes",
            final_stats.record_count, final_stats.export_duration_ms, final_stats.file_size_bytes
        );
        Ok(final_stats)
    }

    /// Export to `<base_path>.<ext>` for each format, continuing past failures
    ///
    /// Fails only when every format failed.
    pub async fn export_multiple(
        &self,
        data: &[Record],
        base_path: &Path,
        formats: &[ExportFormat],
        compress: bool,
    ) -> Result<Vec<ExportStats>> {
        let mut all_stats = Vec::new();
        let mut last_error = None;

        for format in formats {
            let output_path = path_with_extension(base_path, format.extension());
            match self.export(data, &output_path, *format, compress).await {
                Ok(stats) => all_stats.push(stats),
                Err(e) => {
                    error!("Failed to export to {}: {}", format, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if all_stats.is_empty() => Err(e),
            _ => Ok(all_stats),
        }
    }

    fn validate_export_size(&self, data: &[Record]) -> Result<()> {
        if self.config.max_records > 0 && data.len() > self.config.max_records {
            return Err(CollectorError::export(format!(
                "Export data too large: {} records, max allowed {}",
                data.len(),
                self.config.max_records
            ))
            .into());
        }
        Ok(())
    }

    /// `<sanitized session name>_<timestamp>.<ext>`
    pub fn generate_filename(session_name: &str, format: ExportFormat) -> String {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        format!("{}_{}.{}", sanitize_filename(session_name), timestamp, format.extension())
    }
}

fn path_with_extension(base: &Path, extension: &str) -> PathBuf {
    let mut name: OsString = base.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Gzip a file to `<path>.gz` and remove the original
async fn compress_file(file_path: &Path) -> Result<PathBuf> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let compressed_path = path_with_extension(file_path, "gz");
    let data = tokio::fs::read(file_path).await?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&data)?;
    let compressed = encoder.finish()?;

    tokio::fs::write(&compressed_path, compressed).await?;
    tokio::fs::remove_file(file_path).await?;

    info!("File compressed: {} -> {}", file_path.display(), compressed_path.display());
    Ok(compressed_path)
}

/// Flattening of nested records for tabular formats
pub struct DataTransformer;

impl DataTransformer {
    /// Flatten nested objects (`a_b`) and arrays (`a_0`) into string cells
    pub fn flatten_record(record: &Record) -> BTreeMap<String, String> {
        let mut flat = BTreeMap::new();
        for (key, value) in record {
            Self::flatten_value(value, key, &mut flat);
        }
        flat
    }

    fn flatten_value(value: &Value, prefix: &str, result: &mut BTreeMap<String, String>) {
        match value {
            Value::Object(obj) => {
                for (key, val) in obj {
                    Self::flatten_value(val, &format!("{}_{}", prefix, key), result);
                }
            }
            Value::Array(arr) => {
                for (i, val) in arr.iter().enumerate() {
                    Self::flatten_value(val, &format!("{}_{}", prefix, i), result);
                }
            }
            _ => {
                result.insert(prefix.to_string(), Self::value_to_string(value));
            }
        }
    }

    fn value_to_string(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}
