use anyhow::Result;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::SecurityConfig;
use crate::error::CollectorError;

/// Input validator for detecting injection attempts in user-supplied text
pub struct InputValidator {
    enabled: bool,
    max_input_length: usize,
    sql_injection_patterns: Vec<Regex>,
    xss_patterns: Vec<Regex>,
    command_injection_patterns: Vec<Regex>,
    path_traversal_patterns: Vec<Regex>,
}

impl InputValidator {
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        Ok(Self {
            enabled: config.enable_input_validation,
            max_input_length: config.max_input_length,
            sql_injection_patterns: compile_patterns(SQL_PATTERNS)?,
            xss_patterns: compile_patterns(XSS_PATTERNS)?,
            command_injection_patterns: compile_patterns(COMMAND_PATTERNS)?,
            path_traversal_patterns: compile_patterns(PATH_PATTERNS)?,
        })
    }

    /// Validate input string for security issues
    pub fn validate(&self, input: &str) -> Result<()> {
        let length = input.chars().count();
        if length > self.max_input_length {
            return Err(CollectorError::security(format!(
                "Input too long: {} characters, max allowed: {}",
                length, self.max_input_length
            ))
            .into());
        }

        if !self.enabled {
            return Ok(());
        }

        debug!("Validating input: {} characters", length);
        check(&self.sql_injection_patterns, input, "SQL injection")?;
        check(&self.xss_patterns, input, "script injection")?;
        check(&self.command_injection_patterns, input, "command injection")?;
        check(&self.path_traversal_patterns, &input.to_lowercase(), "path traversal")?;
        Ok(())
    }

    /// Only the script patterns, for CSS selectors and JSON pointers
    pub fn validate_selector(&self, selector: &str) -> Result<()> {
        let lower = selector.to_lowercase();
        if lower.contains("javascript:") || lower.contains("data:") {
            return Err(CollectorError::security(format!(
                "Selector contains potentially dangerous content: {}",
                selector
            ))
            .into());
        }
        check(&self.xss_patterns, selector, "script injection")
    }
}

fn check(patterns: &[Regex], input: &str, kind: &str) -> Result<()> {
    if patterns.iter().any(|p| p.is_match(input)) {
        warn!("{} pattern detected in input", kind);
        return Err(CollectorError::security(format!("Input contains potential {}", kind)).into());
    }
    Ok(())
}

fn compile_patterns(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| anyhow::anyhow!("Invalid security pattern '{}': {}", p, e)))
        .collect()
}

const SQL_PATTERNS: &[&str] = &[
    r"(?i)\bunion\s+(all\s+)?select\b",
    r"(?i)\bdrop\s+(table|database)\b",
    r"(?i)\bdelete\s+from\b",
    r"(?i)\binsert\s+into\b",
    r"(?i)\balter\s+table\b",
    r"(?i)'\s*or\s*'?\d+'?\s*=\s*'?\d+",
    r"(?i)\bxp_cmdshell\b",
    r";\s*--",
];

const XSS_PATTERNS: &[&str] = &[
    r"(?i)<script[^>]*>",
    r"(?i)</script>",
    r"(?i)javascript:",
    r"(?i)vbscript:",
    r"(?i)data:text/html",
    r"(?i)\bon[a-z]+\s*=",
    r"(?i)<iframe[^>]*>",
    r"(?i)\beval\s*\(",
    r"(?i)document\.cookie",
];

const COMMAND_PATTERNS: &[&str] = &[
    r";\s*(rm|cat|ls|wget|curl|sh|bash)\s",
    r"&&\s*(rm|cat|ls|wget|curl)\s",
    r"\|\s*(rm|cat|sh|bash)\b",
    r"`[^`]*`",
    r"\$\([^)]*\)",
    r"/bin/(ba)?sh\b",
];

const PATH_PATTERNS: &[&str] = &[
    r"\.\./",
    r"\.\.\\",
    r"%2e%2e%2f",
    r"%2e%2e%5c",
    r"\.\.%2f",
    r"%252e%252e%252f",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> InputValidator {
        InputValidator::new(&SecurityConfig::default()).unwrap()
    }

    #[test]
    fn test_sql_injection_detection() {
        let validator = validator();
        assert!(validator.validate("'; DROP TABLE users; --").is_err());
        assert!(validator.validate("1' OR '1'='1").is_err());
        assert!(validator.validate("UNION SELECT password FROM users").is_err());

        assert!(validator.validate("search for products").is_ok());
        assert!(validator.validate("user@example.com").is_ok());
    }

    #[test]
    fn test_script_and_command_detection() {
        let validator = validator();
        assert!(validator.validate("<script>alert('xss')</script>").is_err());
        assert!(validator.validate("<img src=x onerror=alert(1)>").is_err());
        assert!(validator.validate("test; rm -rf /").is_err());
        assert!(validator.validate("$(whoami)").is_err());

        assert!(validator.validate("Quotes to Scrape (2024)").is_ok());
    }

    #[test]
    fn test_path_traversal_detection() {
        let validator = validator();
        assert!(validator.validate("../../../etc/passwd").is_err());
        assert!(validator.validate("%2E%2E%2F").is_err());
        assert!(validator.validate("folder/subfolder").is_ok());
    }

    #[test]
    fn test_length_limit_applies_even_when_disabled() {
        let config = SecurityConfig {
            enable_input_validation: false,
            max_input_length: 5,
            ..SecurityConfig::default()
        };
        let validator = InputValidator::new(&config).unwrap();
        assert!(validator.validate("<script>").is_err());
        assert!(validator.validate("<b>").is_ok());
    }

    #[test]
    fn test_selector_validation() {
        let validator = validator();
        assert!(validator.validate_selector("div.quote > span.text").is_ok());
        assert!(validator.validate_selector("a[href^='javascript:']").is_err());
        assert!(validator.validate_selector("/data/items").is_ok());
    }
}
