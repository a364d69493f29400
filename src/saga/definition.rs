//! Saga definitions.
//!
//! Sagas are ordered lists of steps, each naming the activity that moves
//! the saga forward and, optionally, the activity that undoes it.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A complete saga definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    /// Saga name
    pub name: String,

    /// Ordered list of steps to execute
    pub steps: Vec<SagaStep>,
}

/// A single saga step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    /// Step name (unique within the saga)
    pub name: String,

    /// Activity that performs the step
    pub activity: String,

    /// Activity that undoes the step; `None` means nothing to undo
    #[serde(default)]
    pub compensation: Option<String>,

    /// Prefix for failure reasons, e.g. "Payment processing"
    #[serde(default)]
    pub label: Option<String>,
}

impl SagaStep {
    pub fn new(name: impl Into<String>, activity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            activity: activity.into(),
            compensation: None,
            label: None,
        }
    }

    pub fn with_compensation(mut self, activity: impl Into<String>) -> Self {
        self.compensation = Some(activity.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Human-readable failure reason for this step
    pub fn failure_reason(&self, message: &str) -> String {
        format!("{} failed: {}", self.label.as_deref().unwrap_or(&self.name), message)
    }
}

impl SagaDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<SagaStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Load a saga definition from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read saga file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a saga definition from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse saga YAML")
    }

    /// Validate the saga definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Saga name cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Saga must have at least one step");
        }

        let mut seen = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                anyhow::bail!("Step {} has an empty name", i);
            }
            if step.activity.is_empty() {
                anyhow::bail!("Step '{}' has no activity", step.name);
            }
            if !seen.insert(step.name.as_str()) {
                anyhow::bail!("Duplicate step name '{}'", step.name);
            }
        }

        Ok(())
    }

    /// Get a step by name
    pub fn get_step(&self, name: &str) -> Option<&SagaStep> {
        self.steps.iter().find(|s| s.name == name)
    }
}
