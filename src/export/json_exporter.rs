use anyhow::Result;
use std::path::Path;
use tracing::{debug, info};

use super::{Exporter, InternalExportStats};
use crate::plan::{ExportFormat, Record};

/// Records as one JSON array
#[derive(Debug, Clone, Copy)]
pub struct JsonExporter {
    pretty: bool,
}

impl JsonExporter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }
}

#[async_trait::async_trait]
impl Exporter for JsonExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Json
    }

    async fn export(&self, data: &[Record], output_path: &Path) -> Result<InternalExportStats> {
        debug!("Exporting {} records to JSON: {}", data.len(), output_path.display());

        let bytes = if self.pretty {
            serde_json::to_vec_pretty(data)?
        } else {
            serde_json::to_vec(data)?
        };
        tokio::fs::write(output_path, &bytes).await?;

        info!("JSON export completed: {} records, {} bytes", data.len(), bytes.len());
        Ok(InternalExportStats {
            file_size_bytes: bytes.len() as u64,
        })
    }
}

/// One JSON object per line
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonlExporter;

#[async_trait::async_trait]
impl Exporter for JsonlExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Jsonl
    }

    async fn export(&self, data: &[Record], output_path: &Path) -> Result<InternalExportStats> {
        debug!("Exporting {} records to JSONL: {}", data.len(), output_path.display());

        let mut output = String::new();
        for item in data {
            output.push_str(&serde_json::to_string(item)?);
            output.push('\n');
        }
        tokio::fs::write(output_path, &output).await?;

        info!("JSONL export completed: {} records, {} bytes", data.len(), output.len());
        Ok(InternalExportStats {
            file_size_bytes: output.len() as u64,
        })
    }
}
