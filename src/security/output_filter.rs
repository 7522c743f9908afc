use anyhow::Result;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::config::SecurityConfig;
use crate::plan::{is_metadata_key, Record};

/// Redacts sensitive values from collected records
pub struct OutputFilter {
    redact_patterns: bool,
    remove_sensitive_fields: bool,
    sensitive_patterns: Vec<SensitivePattern>,
}

struct SensitivePattern {
    name: &'static str,
    regex: Regex,
    replacement: &'static str,
}

const SENSITIVE_FIELD_TOKENS: &[&str] = &[
    "password", "passwd", "pwd", "secret", "token", "key", "apikey", "auth", "authorization",
    "credential", "credentials", "ssn", "cvv",
];

impl OutputFilter {
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        Ok(Self {
            redact_patterns: config.enable_output_filtering,
            remove_sensitive_fields: config.remove_sensitive_fields,
            sensitive_patterns: Self::create_sensitive_patterns()?,
        })
    }

    pub fn is_active(&self) -> bool {
        self.redact_patterns || self.remove_sensitive_fields
    }

    /// Redact one record in place, returning the number of values changed
    pub fn filter_record(&self, record: &mut Record) -> usize {
        let mut changed = 0;

        if self.remove_sensitive_fields {
            let keys: Vec<String> = record
                .keys()
                .filter(|k| !is_metadata_key(k) && is_sensitive_field(k))
                .cloned()
                .collect();
            for key in keys {
                debug!("Removing sensitive field: {}", key);
                record.remove(&key);
                changed += 1;
            }
        }

        if self.redact_patterns {
            for (key, value) in record.iter_mut() {
                if !is_metadata_key(key) {
                    changed += self.filter_value(value);
                }
            }
        }
        changed
    }

    fn filter_value(&self, value: &mut Value) -> usize {
        match value {
            Value::String(s) => {
                let filtered = self.filter_string(s);
                if filtered != *s {
                    *s = filtered;
                    1
                } else {
                    0
                }
            }
            Value::Array(items) => items.iter_mut().map(|v| self.filter_value(v)).sum(),
            Value::Object(obj) => obj.values_mut().map(|v| self.filter_value(v)).sum(),
            _ => 0,
        }
    }

    pub fn filter_string(&self, input: &str) -> String {
        let mut filtered = input.to_string();
        for pattern in &self.sensitive_patterns {
            if pattern.regex.is_match(&filtered) {
                debug!("Redacting {} pattern", pattern.name);
                filtered = pattern.regex.replace_all(&filtered, pattern.replacement).into_owned();
            }
        }
        filtered
    }

    fn create_sensitive_patterns() -> Result<Vec<SensitivePattern>> {
        let specs: [(&'static str, &str, &'static str); 6] = [
            ("url password", r"://([^:/@\s]+):[^@/\s]+@", "://$1:[REDACTED]@"),
            (
                "url secret",
                r"(?i)([?&](?:api_?key|access_token|token|secret|password|auth)=)[^&#\s]+",
                "${1}[REDACTED]",
            ),
            ("credit card", r"\b(?:\d{4}[-\s]?){3}\d{4}\b", "[CREDIT_CARD_REDACTED]"),
            ("ssn", r"\b\d{3}-\d{2}-\d{4}\b", "[SSN_REDACTED]"),
            ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b", "[EMAIL_REDACTED]"),
            (
                "phone",
                r"(?:\+?1[-.\s]?)?\(?\b[0-9]{3}\)?[-.\s][0-9]{3}[-.\s][0-9]{4}\b",
                "[PHONE_REDACTED]",
            ),
        ];

        specs
            .into_iter()
            .map(|(name, pattern, replacement)| {
                Ok(SensitivePattern {
                    name,
                    regex: Regex::new(pattern)?,
                    replacement,
                })
            })
            .collect()
    }
}

fn is_sensitive_field(key: &str) -> bool {
    key.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| SENSITIVE_FIELD_TOKENS.contains(&token))
}
