use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::CollectorError;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scraping: ScrapingConfig,
    pub processing: ProcessingConfig,
    pub export: ExportConfig,
    pub security: SecurityConfig,
    pub session: SessionConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub enable_wal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    pub max_concurrent_requests: usize,
    pub request_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub respect_robots_txt: bool,
    pub robots_cache_ttl_seconds: u64,
    /// Upper bound for a robots.txt Crawl-delay
    pub max_crawl_delay_seconds: u64,
    /// Minimum interval between two requests to the same domain
    pub default_delay_ms: u64,
    /// Global request budget, 0 disables the quota
    pub requests_per_minute: u32,
    pub user_agents: Vec<String>,
    pub rotate_user_agents: bool,
    pub max_redirects: usize,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub batch_size: usize,
    pub enable_cleaning: bool,
    pub enable_validation: bool,
    pub enable_filtering: bool,
    pub enable_deduplication: bool,
    pub enable_normalization: bool,
    pub enable_enrichment: bool,
    pub normalize_numbers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub default_format: String,
    pub max_records: usize,
    pub compression_enabled: bool,
    pub output_directory: PathBuf,
    pub pretty_json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enable_input_validation: bool,
    pub enable_output_filtering: bool,
    pub remove_sensitive_fields: bool,
    pub max_input_length: usize,
    pub blocked_domains: Vec<String>,
    /// When non-empty only these domains (and their subdomains) may be collected
    pub allowed_domains: Vec<String>,
    pub allowed_schemes: Vec<String>,
    pub allow_private_addresses: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pages between two checkpoints
    pub checkpoint_interval: usize,
    pub retry_failed_on_resume: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub sample_process_memory: bool,
    pub max_response_samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file_enabled: bool,
    pub console_enabled: bool,
    pub json_format: bool,
    pub max_files: usize,
    pub log_directory: PathBuf,
    pub include_targets: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = get_data_directory();

        Self {
            database: DatabaseConfig {
                path: data_dir.join("collector.db"),
                enable_wal: true,
            },
            scraping: ScrapingConfig::default(),
            processing: ProcessingConfig::default(),
            export: ExportConfig {
                default_format: "csv".to_string(),
                max_records: 1_000_000,
                compression_enabled: false,
                output_directory: data_dir.join("exports"),
                pretty_json: true,
            },
            security: SecurityConfig::default(),
            session: SessionConfig {
                checkpoint_interval: 10,
                retry_failed_on_resume: true,
            },
            metrics: MetricsConfig {
                enabled: true,
                sample_process_memory: true,
                max_response_samples: 1000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file_enabled: true,
                console_enabled: true,
                json_format: false,
                max_files: 5,
                log_directory: data_dir.join("logs"),
                include_targets: true,
            },
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        AppConfig::default().database
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        AppConfig::default().export
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        AppConfig::default().session
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        AppConfig::default().metrics
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        AppConfig::default().logging
    }
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            request_timeout_seconds: 30,
            connect_timeout_seconds: 10,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            respect_robots_txt: true,
            robots_cache_ttl_seconds: 24 * 60 * 60,
            max_crawl_delay_seconds: 60,
            default_delay_ms: 1000,
            requests_per_minute: 120,
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15".to_string(),
            ],
            rotate_user_agents: true,
            max_redirects: 10,
            max_body_bytes: 20 * 1024 * 1024,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            enable_cleaning: true,
            enable_validation: true,
            enable_filtering: true,
            enable_deduplication: true,
            enable_normalization: true,
            enable_enrichment: true,
            normalize_numbers: false,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_input_validation: true,
            enable_output_filtering: false,
            remove_sensitive_fields: false,
            max_input_length: 10_000,
            blocked_domains: vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
                "0.0.0.0".to_string(),
            ],
            allowed_domains: Vec::new(),
            allowed_schemes: vec![
                "http".to_string(),
                "https".to_string(),
                "file".to_string(),
            ],
            allow_private_addresses: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location, writing defaults on first run
    pub async fn load() -> Result<Self> {
        let config_path = get_config_path();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path).await?
        } else {
            info!("No configuration file found, using defaults");
            let config = Self::default();
            config.save_to(&config_path).await?;
            config
        };

        ConfigOverrides::apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from specific file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let config = Self::from_toml(&content).map_err(|e| {
            e.context(CollectorError::InvalidConfig { path: path.display().to_string() })
        })?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a path
    pub async fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.scraping.max_concurrent_requests == 0 {
            return Err(anyhow::anyhow!("scraping.max_concurrent_requests must be > 0"));
        }

        if self.scraping.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("scraping.request_timeout_seconds must be > 0"));
        }

        if self.scraping.retry_base_delay_ms > self.scraping.retry_max_delay_ms {
            return Err(anyhow::anyhow!(
                "scraping.retry_base_delay_ms must not exceed scraping.retry_max_delay_ms"
            ));
        }

        if self.scraping.max_crawl_delay_seconds > 24 * 60 * 60 {
            return Err(anyhow::anyhow!("scraping.max_crawl_delay_seconds must not exceed one day"));
        }

        if self.scraping.user_agents.is_empty() {
            return Err(anyhow::anyhow!("At least one user agent must be configured"));
        }

        if self.processing.batch_size == 0 {
            return Err(anyhow::anyhow!("processing.batch_size must be > 0"));
        }

        if self.security.max_input_length == 0 {
            return Err(anyhow::anyhow!("security.max_input_length must be > 0"));
        }

        if self.security.allowed_schemes.is_empty() {
            return Err(anyhow::anyhow!("security.allowed_schemes must not be empty"));
        }

        if self.export.max_records == 0 {
            return Err(anyhow::anyhow!("export.max_records must be > 0"));
        }

        if self.session.checkpoint_interval == 0 {
            return Err(anyhow::anyhow!("session.checkpoint_interval must be > 0"));
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub async fn ensure_directories(&self) -> Result<()> {
        let mut dirs_to_create = vec![self.export.output_directory.clone()];
        if let Some(parent) = self.database.path.parent() {
            dirs_to_create.push(parent.to_path_buf());
        }

        for dir in dirs_to_create {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                tokio::fs::create_dir_all(&dir).await?;
                info!("Created directory: {}", dir.display());
            }
        }

        Ok(())
    }
}

/// Get the default data directory
fn get_data_directory() -> PathBuf {
    directories::ProjectDirs::from("com", "ai-data-collector", "adc")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("data"))
}

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    directories::ProjectDirs::from("com", "ai-data-collector", "adc")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("config.toml"))
}

/// Environment-based configuration overrides
pub struct ConfigOverrides;

impl ConfigOverrides {
    /// Apply `ADC_*` environment variable overrides
    pub fn apply(config: &mut AppConfig) {
        Self::apply_from(config, |key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup, used by tests
    pub fn apply_from<F>(config: &mut AppConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db_path) = lookup("ADC_DB_PATH") {
            config.database.path = PathBuf::from(db_path);
        }

        if let Some(concurrency) = lookup("ADC_CONCURRENCY").and_then(|v| v.parse::<usize>().ok()) {
            config.scraping.max_concurrent_requests = concurrency;
        }

        if let Some(retries) = lookup("ADC_MAX_RETRIES").and_then(|v| v.parse::<u32>().ok()) {
            config.scraping.max_retries = retries;
        }

        if let Some(robots) = lookup("ADC_RESPECT_ROBOTS") {
            config.scraping.respect_robots_txt = robots.to_lowercase() == "true";
        }

        if let Some(rate) = lookup("ADC_RATE_LIMIT").and_then(|v| v.parse::<u32>().ok()) {
            config.scraping.requests_per_minute = rate;
        }

        if let Some(dir) = lookup("ADC_OUTPUT_DIR") {
            config.export.output_directory = PathBuf::from(dir);
        }

        if let Some(level) = lookup("ADC_LOG_LEVEL") {
            config.logging.level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [scraping]
            max_concurrent_requests = 2
            user_agents = ["test-agent"]

            [session]
            retry_failed_on_resume = false
            "#,
        ).unwrap();

        assert_eq!(config.scraping.max_concurrent_requests, 2);
        assert_eq!(config.scraping.max_retries, 3);
        assert_eq!(config.session.checkpoint_interval, 10);
        assert!(!config.session.retry_failed_on_resume);
        assert!(config.processing.enable_deduplication);
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let mut config = AppConfig::default();
        config.scraping.max_concurrent_requests = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let mut config = AppConfig::default();
        config.scraping.retry_base_delay_ms = 10_000;
        config.scraping.retry_max_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bounds_crawl_delay() {
        let mut config = AppConfig::default();
        config.scraping.max_crawl_delay_seconds = 3600;
        assert!(config.validate().is_ok());
        config.scraping.max_crawl_delay_seconds = 7 * 24 * 60 * 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ADC_CONCURRENCY", "9"),
            ("ADC_RESPECT_ROBOTS", "false"),
            ("ADC_MAX_RETRIES", "not-a-number"),
            ("ADC_LOG_LEVEL", "debug"),
        ].into_iter().collect();

        let mut config = AppConfig::default();
        ConfigOverrides::apply_from(&mut config, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.scraping.max_concurrent_requests, 9);
        assert!(!config.scraping.respect_robots_txt);
        assert_eq!(config.scraping.max_retries, 3);
        assert_eq!(config.logging.level, "debug");
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.session.checkpoint_interval = 3;
        config.save_to(&path).await.unwrap();

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.session.checkpoint_interval, 3);
    }

    #[tokio::test]
    async fn test_malformed_file_is_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[scraping]\nmax_retries = \"many\"\n").await.unwrap();

        let err = AppConfig::load_from_file(&path).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CollectorError>(),
            Some(CollectorError::InvalidConfig { .. })
        ));
    }
}
