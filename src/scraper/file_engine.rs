use anyhow::Result;
use async_trait::async_trait;
use std::time::Instant;
use tracing::debug;
use url::Url;

use super::{DocumentKind, FetchOptions, FetchedDocument, ScraperEngine};
use crate::error::CollectorError;

/// Reads `file://` URLs from the local filesystem
pub struct FileEngine {
    max_body_bytes: usize,
}

impl FileEngine {
    pub fn new(max_body_bytes: usize) -> Self {
        Self { max_body_bytes }
    }
}

#[async_trait]
impl ScraperEngine for FileEngine {
    fn name(&self) -> &str {
        "file"
    }

    fn supports(&self, url: &Url) -> bool {
        url.scheme() == "file"
    }

    async fn fetch(&self, url: &Url, options: &FetchOptions) -> Result<FetchedDocument> {
        let started = Instant::now();
        let path = url
            .to_file_path()
            .map_err(|_| CollectorError::scraping(format!("Not a local file URL: {}", url)))?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| CollectorError::scraping(format!("Cannot read {}: {}", path.display(), e)))?;
        if metadata.len() as usize > self.max_body_bytes {
            return Err(CollectorError::scraping(format!(
                "File {} too large: {} bytes (max {})",
                path.display(), metadata.len(), self.max_body_bytes
            )).into());
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| CollectorError::scraping(format!("Cannot read {}: {}", path.display(), e)))?;
        let body = String::from_utf8_lossy(&bytes).into_owned();

        let content_type = match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
            Some(ext) if ext == "json" => Some("application/json".to_string()),
            Some(ext) if ext == "html" || ext == "htm" => Some("text/html".to_string()),
            Some(ext) if ext == "xml" => Some("application/xml".to_string()),
            Some(ext) if ext == "txt" => Some("text/plain".to_string()),
            _ => None,
        };
        let kind = DocumentKind::detect(content_type.as_deref(), &body);

        if let Some(metrics) = &options.metrics {
            metrics.record_request("localhost", started.elapsed(), true, bytes.len() as u64);
        }

        debug!("Read {} bytes from {}", bytes.len(), path.display());

        Ok(FetchedDocument {
            url: url.clone(),
            final_url: url.clone(),
            status: 200,
            content_type,
            bytes: bytes.len(),
            body,
            elapsed: started.elapsed(),
            kind,
            engine: "file".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_local_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items.json");
        std::fs::write(&path, r#"[{"name": "a"}]"#).unwrap();

        let engine = FileEngine::new(1024);
        let url = Url::from_file_path(&path).unwrap();
        assert!(engine.supports(&url));

        let doc = engine.fetch(&url, &FetchOptions::default()).await.unwrap();
        assert_eq!(doc.kind, DocumentKind::Json);
        assert_eq!(doc.status, 200);
        assert_eq!(doc.engine, "file");
        assert_eq!(doc.bytes, 15);
    }

    #[tokio::test]
    async fn test_missing_and_oversized_files_fail() {
        let dir = TempDir::new().unwrap();
        let engine = FileEngine::new(4);

        let missing = Url::from_file_path(dir.path().join("nope.html")).unwrap();
        assert!(engine.fetch(&missing, &FetchOptions::default()).await.is_err());

        let path = dir.path().join("big.html");
        std::fs::write(&path, "<p>too big</p>").unwrap();
        let big = Url::from_file_path(&path).unwrap();
        assert!(engine.fetch(&big, &FetchOptions::default()).await.is_err());
    }

    #[test]
    fn test_only_supports_file_scheme() {
        let engine = FileEngine::new(1024);
        assert!(!engine.supports(&Url::parse("https://example.com").unwrap()));
    }
}
