use anyhow::Result;
use csv::WriterBuilder;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use super::{DataTransformer, Exporter, InternalExportStats};
use crate::plan::{ExportFormat, Record};

/// CSV with flattened, alphabetically sorted columns
#[derive(Debug, Clone, Default)]
pub struct CsvExporter {
    fallback_columns: Vec<String>,
}

impl CsvExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback_columns(mut self, columns: Vec<String>) -> Self {
        self.fallback_columns = columns;
        self
    }

    fn render(&self, data: &[Record]) -> Result<Vec<u8>> {
        let flattened: Vec<_> = data.iter().map(DataTransformer::flatten_record).collect();

        let columns: Vec<String> = if flattened.is_empty() {
            self.fallback_columns.clone()
        } else {
            flattened
                .iter()
                .flat_map(|row| row.keys().cloned())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };

        let mut writer = WriterBuilder::new().has_headers(true).from_writer(Vec::new());
        if !columns.is_empty() {
            writer.write_record(&columns)?;
        }

        for row in &flattened {
            let record: Vec<&str> = columns
                .iter()
                .map(|col| row.get(col).map(String::as_str).unwrap_or_default())
                .collect();
            writer.write_record(&record)?;
        }

        writer.flush()?;
        Ok(writer.into_inner().map_err(|e| anyhow::anyhow!("CSV buffer error: {}", e))?)
    }
}

#[async_trait::async_trait]
impl Exporter for CsvExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    async fn export(&self, data: &[Record], output_path: &Path) -> Result<InternalExportStats> {
        debug!("Exporting {} records to CSV: {}", data.len(), output_path.display());

        let bytes = self.render(data)?;
        tokio::fs::write(output_path, &bytes).await?;

        info!("CSV export completed: {} records, {} bytes", data.len(), bytes.len());
        Ok(InternalExportStats {
            file_size_bytes: bytes.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_csv_union_of_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        let data: Vec<Record> = vec![
            json!({"b": "x, y", "a": 1}).as_object().cloned().unwrap(),
            json!({"c": {"d": true}}).as_object().cloned().unwrap(),
        ];

        CsvExporter::new().export(&data, &path).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["a,b,c_d", "1,\"x, y\",", ",,true"]);
    }

    #[tokio::test]
    async fn test_empty_csv_is_header_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.csv");

        CsvExporter::new()
            .with_fallback_columns(vec!["quote".to_string(), "author".to_string()])
            .export(&[], &path)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "quote,author\n");
    }
}
