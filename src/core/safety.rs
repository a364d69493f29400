//! Safety limits for orchestration instances.
//!
//! Prevents runaway orchestrations through configurable limits on:
//! - Number of tasks a single instance may schedule
//! - Size of task inputs and orchestration outputs
//!
//! Violations fail the instance; they are never retried.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Per-instance safety limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum number of tasks one instance may schedule (default: 1000)
    #[serde(default = "default_max_tasks")]
    pub max_tasks_per_instance: u64,

    /// Maximum serialized size of a task input or orchestration output (default: 1MB)
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,
}

fn default_max_tasks() -> u64 {
    1000
}
fn default_max_payload_bytes() -> u64 {
    1024 * 1024
} // 1MB

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_tasks_per_instance: default_max_tasks(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl SafetyLimits {
    /// Check that scheduling task number `count` (1-based) stays within limits
    pub fn check_task_count(&self, count: u64) -> Result<(), SafetyViolation> {
        if count > self.max_tasks_per_instance {
            return Err(SafetyViolation::MaxTasks {
                actual: count,
                limit: self.max_tasks_per_instance,
            });
        }
        Ok(())
    }

    /// Validate a payload against the size limit
    pub fn validate_payload(&self, label: &str, payload: &Value) -> Result<(), SafetyViolation> {
        let size = serde_json::to_vec(payload).map(|b| b.len() as u64).unwrap_or(0);
        if size > self.max_payload_bytes {
            return Err(SafetyViolation::MaxPayloadBytes {
                label: label.to_string(),
                actual: size,
                limit: self.max_payload_bytes,
            });
        }
        Ok(())
    }
}

/// Safety violation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("Maximum tasks exceeded: {actual} > {limit}")]
    MaxTasks { actual: u64, limit: u64 },

    #[error("Maximum payload bytes exceeded for {label}: {actual} > {limit}")]
    MaxPayloadBytes { label: String, actual: u64, limit: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_limits() {
        let limits = SafetyLimits::default();
        assert_eq!(limits.max_tasks_per_instance, 1000);
        assert_eq!(limits.max_payload_bytes, 1024 * 1024);
    }

    #[test]
    fn test_task_count_limit() {
        let limits = SafetyLimits {
            max_tasks_per_instance: 3,
            ..Default::default()
        };

        assert!(limits.check_task_count(3).is_ok());
        assert_eq!(
            limits.check_task_count(4),
            Err(SafetyViolation::MaxTasks { actual: 4, limit: 3 })
        );
    }

    #[test]
    fn test_payload_limit() {
        let limits = SafetyLimits {
            max_payload_bytes: 16,
            ..Default::default()
        };

        assert!(limits.validate_payload("input", &json!("short")).is_ok());
        let err = limits
            .validate_payload("input", &json!("a string that is clearly too long"))
            .unwrap_err();
        assert!(err.to_string().contains("input"));
    }

    #[test]
    fn test_limits_from_yaml_defaults() {
        let limits: SafetyLimits = serde_yaml::from_str("max_tasks_per_instance: 5").unwrap();
        assert_eq!(limits.max_tasks_per_instance, 5);
        assert_eq!(limits.max_payload_bytes, 1024 * 1024);
    }
}
