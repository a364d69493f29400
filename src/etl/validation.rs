//! Rule-based record validation.
//!
//! Rules are evaluated independently: a record is invalid when any rule
//! fails, and every failing rule contributes its message.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::records::{DataRecord, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Field must be present and not blank
    Required,
    /// Field must match a regular expression
    Regex,
    /// Field must be a number within an inclusive "min-max" range
    Range,
}

/// One validation rule as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub field: String,
    pub kind: RuleKind,

    /// Regex pattern or range spec
    #[serde(default)]
    pub parameter: Option<String>,

    pub message: String,
}

impl ValidationRule {
    pub fn required(field: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            kind: RuleKind::Required,
            parameter: None,
            message: message.to_string(),
        }
    }

    pub fn regex(field: &str, pattern: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            kind: RuleKind::Regex,
            parameter: Some(pattern.to_string()),
            message: message.to_string(),
        }
    }

    pub fn range(field: &str, spec: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            kind: RuleKind::Range,
            parameter: Some(spec.to_string()),
            message: message.to_string(),
        }
    }
}

/// Rules applied when none are configured
pub fn default_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule::required("name", "Name is required."),
        ValidationRule::regex(
            "email",
            r"^[^@\s]+@[^@\s]+\.[^@\s]+$",
            "Email must be a valid email address.",
        ),
        ValidationRule::range("amount", "0-1000000", "Amount must be between 0 and 1,000,000."),
    ]
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Rule for field '{field}' needs a parameter")]
    MissingParameter { field: String },

    #[error("Invalid pattern for field '{field}': {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid range '{spec}' for field '{field}' (expected min-max)")]
    InvalidRange { field: String, spec: String },
}

#[derive(Debug, Clone)]
enum Check {
    Required,
    Pattern(Regex),
    Range { min: f64, max: f64 },
}

#[derive(Debug, Clone)]
struct CompiledRule {
    field: String,
    check: Check,
    message: String,
}

impl CompiledRule {
    fn passes(&self, value: Option<&str>) -> bool {
        let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
            return false;
        };

        match &self.check {
            Check::Required => true,
            Check::Pattern(pattern) => pattern.is_match(value),
            Check::Range { min, max } => value
                .trim()
                .parse::<f64>()
                .map(|n| n >= *min && n <= *max)
                .unwrap_or(false),
        }
    }
}

/// Validator over a fixed, pre-compiled rule set
#[derive(Debug, Clone)]
pub struct RuleBasedValidator {
    rules: Vec<CompiledRule>,
}

impl RuleBasedValidator {
    pub fn new(rules: &[ValidationRule]) -> Result<Self, RuleError> {
        let rules = rules.iter().map(compile).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Every failing rule message for one record, in rule order
    pub fn check(&self, record: &DataRecord) -> Vec<String> {
        self.rules
            .iter()
            .filter(|rule| !rule.passes(record.field(&rule.field)))
            .map(|rule| rule.message.clone())
            .collect()
    }

    pub fn validate(&self, records: Vec<DataRecord>) -> ValidationResult {
        let mut result = ValidationResult::default();

        for record in records {
            let errors = self.check(&record);
            if errors.is_empty() {
                result.valid_records.push(record);
            } else {
                result.errors.insert(record.id.clone(), errors);
                result.invalid_records.push(record);
            }
        }

        result
    }
}

impl Default for RuleBasedValidator {
    fn default() -> Self {
        let rules = default_rules()
            .iter()
            .filter_map(|rule| compile(rule).ok())
            .collect();
        Self { rules }
    }
}

fn compile(rule: &ValidationRule) -> Result<CompiledRule, RuleError> {
    let parameter = || {
        rule.parameter
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| RuleError::MissingParameter { field: rule.field.clone() })
    };

    let check = match rule.kind {
        RuleKind::Required => Check::Required,
        RuleKind::Regex => {
            let pattern = Regex::new(parameter()?).map_err(|source| RuleError::InvalidPattern {
                field: rule.field.clone(),
                source,
            })?;
            Check::Pattern(pattern)
        }
        RuleKind::Range => {
            let spec = parameter()?;
            let invalid = || RuleError::InvalidRange {
                field: rule.field.clone(),
                spec: spec.to_string(),
            };
            let (min, max) = spec.split_once('-').ok_or_else(invalid)?;
            let min = min.trim().parse::<f64>().map_err(|_| invalid())?;
            let max = max.trim().parse::<f64>().map_err(|_| invalid())?;
            Check::Range { min, max }
        }
    };

    Ok(CompiledRule {
        field: rule.field.clone(),
        check,
        message: rule.message.clone(),
    })
}
