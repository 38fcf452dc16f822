//! Parameter Validation - Rule/Policy Separation
//!
//! Rules produce structured violations.
//! Policy: any `Error` violation blocks the quote; warnings are reported only.

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::quote::QuoteParams;

pub const MAX_QUANTITY: u32 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    /// `rule: message` pairs joined for error reporting.
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Error)
            .map(|v| format!("{}: {}", v.rule, v.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, params: &QuoteParams, config: &AppConfig) -> Vec<ValidationViolation>;
}

fn error(rule: &str, message: String, expected: Option<String>, actual: Option<String>) -> ValidationViolation {
    ValidationViolation {
        rule: rule.to_string(),
        severity: ViolationSeverity::Error,
        message,
        expected,
        actual,
    }
}

// --- Concrete Rules ---

pub struct InfillRangeRule;

impl ValidationRule for InfillRangeRule {
    fn name(&self) -> &'static str { "infill" }

    fn validate(&self, params: &QuoteParams, config: &AppConfig) -> Vec<ValidationViolation> {
        let range = &config.infill_options;
        if (range.min_percentage..=range.max_percentage).contains(&params.infill_percent) {
            return vec![];
        }
        vec![error(
            self.name(),
            "Infill percentage out of range".to_string(),
            Some(format!("{}..={}", range.min_percentage, range.max_percentage)),
            Some(params.infill_percent.to_string()),
        )]
    }
}

pub struct QuantityRule;

impl ValidationRule for QuantityRule {
    fn name(&self) -> &'static str { "quantity" }

    fn validate(&self, params: &QuoteParams, _config: &AppConfig) -> Vec<ValidationViolation> {
        if (1..=MAX_QUANTITY).contains(&params.quantity) {
            return vec![];
        }
        vec![error(
            self.name(),
            "Quantity out of range".to_string(),
            Some(format!("1..={MAX_QUANTITY}")),
            Some(params.quantity.to_string()),
        )]
    }
}

pub struct PrinterEnabledRule;

impl ValidationRule for PrinterEnabledRule {
    fn name(&self) -> &'static str { "printer" }

    fn validate(&self, params: &QuoteParams, config: &AppConfig) -> Vec<ValidationViolation> {
        match config.printers.get(&params.printer) {
            Some(printer) if !printer.enabled => vec![error(
                self.name(),
                format!("Printer '{}' is disabled", params.printer),
                None,
                None,
            )],
            // unknown keys are reported as configuration errors
            _ => vec![],
        }
    }
}

pub struct PostProcessingRule;

impl ValidationRule for PostProcessingRule {
    fn name(&self) -> &'static str { "post_processing" }

    fn validate(&self, params: &QuoteParams, config: &AppConfig) -> Vec<ValidationViolation> {
        params
            .post_processing
            .iter()
            .filter_map(|key| match config.post_processing.get(key) {
                None => Some(error(self.name(), format!("Unknown option '{key}'"), None, None)),
                Some(option) if !option.enabled => {
                    Some(error(self.name(), format!("Option '{key}' is disabled"), None, None))
                }
                Some(_) => None,
            })
            .collect()
    }
}

pub struct SupportsAdvisoryRule;

impl ValidationRule for SupportsAdvisoryRule {
    fn name(&self) -> &'static str { "supports" }

    fn validate(&self, params: &QuoteParams, _config: &AppConfig) -> Vec<ValidationViolation> {
        if params.supports && params.infill_percent == 100 {
            vec![ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Warning,
                message: "Supports on a solid part add material and print time".to_string(),
                expected: None,
                actual: None,
            }]
        } else {
            vec![]
        }
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(InfillRangeRule),
                Box::new(QuantityRule),
                Box::new(PrinterEnabledRule),
                Box::new(PostProcessingRule),
                Box::new(SupportsAdvisoryRule),
            ],
        }
    }

    pub fn validate(&self, params: &QuoteParams, config: &AppConfig) -> ValidationResult {
        let violations: Vec<_> = self
            .rules
            .iter()
            .flat_map(|rule| rule.validate(params, config))
            .collect();
        let valid = !violations.iter().any(|v| v.severity == ViolationSeverity::Error);
        ValidationResult { valid, violations }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
