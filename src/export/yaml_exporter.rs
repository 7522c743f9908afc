use anyhow::Result;
use std::path::Path;
use tracing::{debug, info};

use super::{Exporter, InternalExportStats};
use crate::plan::{ExportFormat, Record};

/// Records as a YAML sequence
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlExporter;

#[async_trait::async_trait]
impl Exporter for YamlExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Yaml
    }

    async fn export(&self, data: &[Record], output_path: &Path) -> Result<InternalExportStats> {
        debug!("Exporting {} records to YAML: {}", data.len(), output_path.display());

        let yaml = serde_yaml::to_string(data)?;
        tokio::fs::write(output_path, &yaml).await?;

        info!("YAML export completed: {} records, {} bytes", data.len(), yaml.len());
        Ok(InternalExportStats {
            file_size_bytes: yaml.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_yaml_round_trips_through_serde() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.yaml");
        let data: Vec<Record> = vec![json!({"author": "Ada", "n": 3}).as_object().cloned().unwrap()];

        YamlExporter.export(&data, &path).await.unwrap();
        let parsed: Vec<Record> = serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed, data);
    }
}
