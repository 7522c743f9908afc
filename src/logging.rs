use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub use crate::config::LoggingConfig;

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level when it is set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers = Vec::new();

    if config.console_enabled {
        let console_layer = fmt::layer()
            .with_target(config.include_targets)
            .with_writer(std::io::stderr)
            .boxed();

        layers.push(console_layer);
    }

    if config.file_enabled {
        std::fs::create_dir_all(&config.log_directory)?;

        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("collector")
            .filename_suffix("log")
            .max_log_files(config.max_files)
            .build(&config.log_directory)?;

        let file_layer = if config.json_format {
            fmt::layer()
                .json()
                .with_thread_ids(true)
                .with_target(config.include_targets)
                .with_writer(file_appender)
                .boxed()
        } else {
            fmt::layer()
                .with_ansi(false)
                .with_target(config.include_targets)
                .with_writer(file_appender)
                .boxed()
        };

        layers.push(file_layer);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        level = %config.level,
        console = config.console_enabled,
        file = config.file_enabled,
        "Logging system initialized"
    );
    if config.file_enabled {
        info!("Log directory: {}", config.log_directory.display());
    }

    Ok(())
}

/// Structured logging context
#[derive(Debug, Clone, Serialize)]
pub struct LogContext {
    pub component: String,
    pub operation: String,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub duration_ms: Option<u64>,
    pub status: Option<String>,
    pub error_category: Option<String>,
    pub additional_fields: HashMap<String, serde_json::Value>,
}

impl LogContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            request_id: None,
            session_id: None,
            url: None,
            domain: None,
            duration_ms: None,
            status: None,
            error_category: None,
            additional_fields: HashMap::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_error_category(mut self, category: impl Into<String>) -> Self {
        self.error_category = Some(category.into());
        self
    }

    pub fn with_string_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_fields.insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    pub fn with_number_field(mut self, key: impl Into<String>, value: impl Into<i64>) -> Self {
        self.additional_fields.insert(key.into(), serde_json::Value::Number(serde_json::Number::from(value.into())));
        self
    }
}

/// Emit an event at `$level` carrying every `LogContext` field
#[doc(hidden)]
#[macro_export]
macro_rules! log_with_context {
    ($level:expr, $context:expr, $message:expr $(, $key:ident = $value:expr)*) => {{
        let context = &$context;
        tracing::event!(
            $level,
            component = %context.component,
            operation = %context.operation,
            request_id = ?context.request_id,
            session_id = ?context.session_id,
            url = ?context.url,
            domain = ?context.domain,
            duration_ms = ?context.duration_ms,
            status = ?context.status,
            error_category = ?context.error_category,
            additional_fields = ?context.additional_fields,
            $($key = %$value,)*
            "{}", $message
        );
    }};
}

#[macro_export]
macro_rules! log_info {
    ($context:expr, $message:expr) => {
        $crate::log_with_context!(tracing::Level::INFO, $context, $message)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($context:expr, $message:expr) => {
        $crate::log_with_context!(tracing::Level::WARN, $context, $message)
    };
}

#[macro_export]
macro_rules! log_error {
    ($context:expr, $message:expr) => {
        $crate::log_with_context!(tracing::Level::ERROR, $context, $message)
    };

    ($context:expr, $error:expr, $message:expr) => {
        $crate::log_with_context!(tracing::Level::ERROR, $context, $message, error = $error)
    };
}

/// Times an operation and logs its outcome with the attached context
pub struct PerformanceLogger {
    context: LogContext,
    start_time: std::time::Instant,
}

impl PerformanceLogger {
    pub fn new(context: LogContext) -> Self {
        Self {
            context,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn finish(self, message: &str) {
        let context = self.context.with_duration(self.start_time.elapsed());
        log_info!(context, message);
    }

    pub fn finish_with_status(self, message: &str, status: impl Into<String>) {
        let context = self.context
            .with_duration(self.start_time.elapsed())
            .with_status(status);
        log_info!(context, message);
    }

    pub fn finish_with_error(self, message: &str, error: &anyhow::Error) {
        let category = error
            .downcast_ref::<crate::error::CollectorError>()
            .map(|e| e.category())
            .unwrap_or("internal");
        let context = self.context
            .with_duration(self.start_time.elapsed())
            .with_status("error")
            .with_error_category(category);
        log_error!(context, error, message);
    }
}

/// Request ID generation
pub struct RequestIdGenerator;

impl RequestIdGenerator {
    pub fn generate() -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let timestamp = chrono::Utc::now().timestamp_millis();
        let counter = COUNTER.fetch_add(1, Ordering::SeqCst);

        format!("req-{}-{:04}", timestamp, counter % 10000)
    }
}
