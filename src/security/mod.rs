use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

pub mod domain_policy;
pub mod input_validator;
pub mod output_filter;

use crate::config::SecurityConfig;
use crate::error::CollectorError;
use crate::plan::{CollectionPlan, Record};
use domain_policy::{DomainPolicy, DomainVerdict};
use input_validator::InputValidator;
use output_filter::OutputFilter;

/// Headers a plan may never set
const FORBIDDEN_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "upgrade",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Security manager for validating plans and filtering output
pub struct SecurityManager {
    config: SecurityConfig,
    input_validator: InputValidator,
    output_filter: OutputFilter,
    domain_policy: DomainPolicy,
}

impl SecurityManager {
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            input_validator: InputValidator::new(config)?,
            output_filter: OutputFilter::new(config)?,
            domain_policy: DomainPolicy::new(
                &config.blocked_domains,
                &config.allowed_domains,
                config.allow_private_addresses,
            ),
        })
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Validate user input for length and injection patterns
    pub fn validate_input(&self, input: &str) -> Result<()> {
        self.input_validator.validate(input)
    }

    /// Scheme, domain policy and private-address checks for one URL
    pub fn validate_url(&self, url: &Url) -> Result<()> {
        let scheme = url.scheme();
        if !self.config.allowed_schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme)) {
            return Err(CollectorError::security(format!("URL scheme '{}' not allowed: {}", scheme, url)).into());
        }

        let Some(host) = url.host() else {
            if scheme == "file" {
                return Ok(());
            }
            return Err(CollectorError::security(format!("URL has no host: {}", url)).into());
        };

        match self.domain_policy.check(&host) {
            DomainVerdict::Allowed => Ok(()),
            DomainVerdict::Blocked => Err(CollectorError::DomainBlocked { domain: host.to_string() }.into()),
            DomainVerdict::NotAllowListed => Err(CollectorError::security(format!(
                "Domain '{}' is not in the allow list",
                host
            ))
            .into()),
            DomainVerdict::PrivateAddress => Err(CollectorError::security(format!(
                "Access to internal/private addresses not allowed: {}",
                url
            ))
            .into()),
        }
    }

    pub fn validate_url_str(&self, url: &str) -> Result<Url> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| CollectorError::security(format!("Invalid URL '{}': {}", url, e)))?;
        self.validate_url(&parsed)?;
        Ok(parsed)
    }

    /// Validate a plan for security compliance
    pub fn validate_plan(&self, plan: &CollectionPlan) -> Result<()> {
        debug!("Validating plan for security compliance: {}", plan.name);

        self.validate_input(&plan.name)?;
        for target in &plan.targets {
            if let Some(label) = &target.label {
                self.validate_input(label)?;
            }
            self.validate_url_str(&target.url)?;
        }

        for selector in plan_selectors(plan) {
            self.input_validator.validate_selector(selector)?;
        }

        if let Some(headers) = &plan.headers {
            for (name, value) in headers {
                self.validate_header(name, value)?;
            }
        }

        debug!("Plan security validation passed");
        Ok(())
    }

    /// Reject forbidden header names and CR/LF injection
    pub fn validate_header(&self, name: &str, value: &str) -> Result<()> {
        if FORBIDDEN_HEADERS.contains(&name.trim().to_lowercase().as_str()) {
            return Err(CollectorError::security(format!("Header '{}' is not allowed", name)).into());
        }
        if [name, value].iter().any(|s| s.contains('\n') || s.contains('\r')) {
            return Err(CollectorError::security(format!(
                "Header '{}' contains line breaks (potential injection)",
                name
            ))
            .into());
        }
        Ok(())
    }

    /// Redact sensitive content in place; returns the number of changed values
    pub fn filter_output(&self, records: &mut [Record]) -> usize {
        if !self.output_filter.is_active() {
            return 0;
        }

        let changed: usize = records.iter_mut().map(|r| self.output_filter.filter_record(r)).sum();
        if changed > 0 {
            info!("Output filtering redacted {} values", changed);
        }
        changed
    }

    /// Collect every problem with a plan without failing
    pub fn generate_security_report(&self, plan: &CollectionPlan) -> SecurityReport {
        let mut report = SecurityReport::new();

        if let Err(e) = self.validate_input(&plan.name) {
            report.add_error(format!("Plan name: {}", e));
        }

        for target in &plan.targets {
            match self.validate_url_str(&target.url) {
                Ok(url) => {
                    if url.scheme() == "http" {
                        report.add_warning(format!("Target uses plain HTTP: {}", url));
                    }
                }
                Err(e) => report.add_error(format!("Target {}: {}", target.url, e)),
            }
        }

        for selector in plan_selectors(plan) {
            if let Err(e) = self.input_validator.validate_selector(selector) {
                report.add_error(format!("Selector '{}': {}", selector, e));
            }
        }

        if let Some(headers) = &plan.headers {
            for (name, value) in headers {
                if let Err(e) = self.validate_header(name, value) {
                    report.add_error(e.to_string());
                }
            }
        }

        if !plan.respect_robots_txt {
            report.add_warning("Robots.txt compliance is disabled".to_string());
        }
        if plan.page_budget().is_none() {
            report.add_warning("No page limit set; pagination is unbounded".to_string());
        }
        if !self.config.enable_output_filtering {
            report.add_info("Output filtering is disabled".to_string());
        }
        report.add_info(format!("{} target(s) checked", plan.targets.len()));

        if report.has_errors() {
            warn!("Security report for '{}' has {} error(s)", plan.name, report.errors.len());
        }
        report
    }
}

fn plan_selectors(plan: &CollectionPlan) -> impl Iterator<Item = &str> {
    plan.extraction
        .item_selector
        .as_deref()
        .into_iter()
        .chain(plan.extraction.fields.iter().map(|f| f.selector.as_str()))
        .chain(plan.pagination.as_ref().map(|p| p.next_selector.as_str()))
}

/// Errors, warnings and notes about a plan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
}

impl SecurityReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_info(&mut self, info: String) {
        self.info.push(info);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}
