use std::fmt;
use thiserror::Error;

/// Error types for the data collector
#[derive(Error, Debug)]
pub enum CollectorError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid configuration file: {path}")]
    InvalidConfig { path: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Migration failed: {version}")]
    Migration { version: i32 },

    // Network errors
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("HTTP request failed: {url} - {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Connection timeout: {url}")]
    Timeout { url: String },

    #[error("Rate limited by server: {url}")]
    RateLimited { url: String, retry_after_secs: Option<u64> },

    // Scraping errors
    #[error("Scraping error: {message}")]
    Scraping { message: String },

    #[error("Robots.txt disallows: {url}")]
    RobotsDisallowed { url: String },

    #[error("No engine supports target: {url}")]
    NoEngine { url: String },

    #[error("Extraction failed: {message}")]
    Extraction { message: String },

    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    // Plan errors
    #[error("Plan validation error: {message}")]
    PlanValidation { message: String },

    // Pipeline errors
    #[error("Pipeline stage '{stage}' failed: {message}")]
    Pipeline { stage: String, message: String },

    // Security errors
    #[error("Security validation failed: {message}")]
    Security { message: String },

    #[error("Domain blocked: {domain}")]
    DomainBlocked { domain: String },

    // Export errors
    #[error("Export error: {message}")]
    Export { message: String },

    #[error("Unsupported format: {format}")]
    UnsupportedFormat { format: String },

    // Session errors
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Session {session_id} cannot be resumed: {reason}")]
    SessionNotResumable { session_id: String, reason: String },

    // Generic errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CollectorError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Create a scraping error
    pub fn scraping(message: impl Into<String>) -> Self {
        Self::Scraping { message: message.into() }
    }

    /// Create an extraction error
    pub fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction { message: message.into() }
    }

    /// Create a plan validation error
    pub fn plan(message: impl Into<String>) -> Self {
        Self::PlanValidation { message: message.into() }
    }

    /// Create a security error
    pub fn security(message: impl Into<String>) -> Self {
        Self::Security { message: message.into() }
    }

    /// Create an export error
    pub fn export(message: impl Into<String>) -> Self {
        Self::Export { message: message.into() }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network { .. } |
            Self::Timeout { .. } |
            Self::RateLimited { .. } => true,

            Self::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,

            _ => false,
        }
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } | Self::InvalidConfig { .. } => "configuration",
            Self::Storage { .. } | Self::Migration { .. } => "storage",
            Self::Network { .. } | Self::HttpStatus { .. } | Self::Timeout { .. } | Self::RateLimited { .. } => "network",
            Self::Scraping { .. } | Self::RobotsDisallowed { .. } | Self::NoEngine { .. } => "scraping",
            Self::Extraction { .. } | Self::InvalidSelector { .. } => "extraction",
            Self::PlanValidation { .. } => "plan",
            Self::Pipeline { .. } => "pipeline",
            Self::Security { .. } | Self::DomainBlocked { .. } => "security",
            Self::Export { .. } | Self::UnsupportedFormat { .. } => "export",
            Self::SessionNotFound { .. } | Self::SessionNotResumable { .. } => "session",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for the data collector
pub type CollectorResult<T> = std::result::Result<T, CollectorError>;

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub operation: String,
    pub component: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub additional_data: std::collections::HashMap<String, String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            component: component.into(),
            timestamp: chrono::Utc::now(),
            request_id: None,
            session_id: None,
            additional_data: std::collections::HashMap::new(),
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

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_data.insert(key.into(), value.into());
        self
    }
}

/// Error paired with the context it happened in
#[derive(Debug)]
pub struct ContextualError {
    pub error: CollectorError,
    pub context: ErrorContext,
    pub chain: Vec<String>,
}

impl ContextualError {
    pub fn new(error: CollectorError, context: ErrorContext) -> Self {
        Self {
            error,
            context,
            chain: Vec::new(),
        }
    }

    pub fn add_to_chain(&mut self, message: impl Into<String>) {
        self.chain.push(message.into());
    }
}

impl fmt::Display for ContextualError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}::{}", self.error, self.context.component, self.context.operation)?;

        if !self.chain.is_empty() {
            write!(f, " (chain: {})", self.chain.join(" -> "))?;
        }

        if let Some(session_id) = &self.context.session_id {
            write!(f, " [session: {}]", session_id)?;
        }

        if let Some(request_id) = &self.context.request_id {
            write!(f, " [req: {}]", request_id)?;
        }

        Ok(())
    }
}

impl std::error::Error for ContextualError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Build a `ContextualError` from an error, an operation and a component
#[macro_export]
macro_rules! contextual_error {
    ($error:expr, $operation:expr, $component:expr) => {
        $crate::error::ContextualError::new(
            $error,
            $crate::error::ErrorContext::new($operation, $component)
        )
    };

    ($error:expr, $operation:expr, $component:expr, $($key:expr => $value:expr),*) => {
        {
            let mut context = $crate::error::ErrorContext::new($operation, $component);
            $(
                context = context.with_data($key, $value);
            )*
            $crate::error::ContextualError::new($error, context)
        }
    };
}

impl From<rusqlite::Error> for CollectorError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage { message: err.to_string() }
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        if err.is_timeout() {
            Self::Timeout { url }
        } else if let Some(status) = err.status() {
            Self::HttpStatus { url, status: status.as_u16() }
        } else if err.is_connect() || err.is_request() {
            Self::Network { message: err.to_string() }
        } else {
            // Redirect, builder and decode failures do not go away on retry
            Self::Scraping { message: format!("{:#}", anyhow::Error::new(err)) }
        }
    }
}
