//! Name-based registry of orchestrations and activities.
//!
//! Resolved once at startup; the engine looks functions up by the names
//! recorded in history.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::adapters::{Activity, ActivityContext, FnActivity};
use crate::domain::TaskResult;

use super::engine::Orchestration;

/// Registration problems collected by [`RegistryBuilder::build`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid registry: {}", .problems.join("; "))]
pub struct RegistryError {
    pub problems: Vec<String>,
}

/// Immutable lookup table for orchestrations and activities
#[derive(Clone, Default)]
pub struct Registry {
    orchestrations: HashMap<String, Arc<dyn Orchestration>>,
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn orchestration(&self, name: &str) -> Option<Arc<dyn Orchestration>> {
        self.orchestrations.get(name).cloned()
    }

    pub fn activity(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }

    /// Registered orchestration names, sorted
    pub fn orchestration_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.orchestrations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered activity names, sorted
    pub fn activity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.activities.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("orchestrations", &self.orchestration_names())
            .field("activities", &self.activity_names())
            .finish()
    }
}

/// Builder collecting registrations; duplicates are reported, not overwritten
#[derive(Default)]
pub struct RegistryBuilder {
    registry: Registry,
    problems: Vec<String>,
}

impl RegistryBuilder {
    pub fn orchestration(mut self, name: &str, orchestration: impl Orchestration + 'static) -> Self {
        if name.trim().is_empty() {
            self.problems.push("orchestration registered with an empty name".to_string());
        } else if self.registry.orchestrations.contains_key(name) {
            self.problems.push(format!("duplicate orchestration '{}'", name));
        } else {
            self.registry
                .orchestrations
                .insert(name.to_string(), Arc::new(orchestration));
        }
        self
    }

    pub fn activity(mut self, name: &str, activity: impl Activity + 'static) -> Self {
        if name.trim().is_empty() {
            self.problems.push("activity registered with an empty name".to_string());
        } else if self.registry.activities.contains_key(name) {
            self.problems.push(format!("duplicate activity '{}'", name));
        } else {
            self.registry
                .activities
                .insert(name.to_string(), Arc::new(activity));
        }
        self
    }

    /// Register an async closure as an activity
    pub fn activity_fn<F, Fut>(self, name: &str, f: F) -> Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.activity(name, FnActivity(f))
    }

    pub fn build(self) -> Result<Registry, RegistryError> {
        if self.problems.is_empty() {
            Ok(self.registry)
        } else {
            Err(RegistryError {
                problems: self.problems,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Interrupt, OrchestrationContext};
    use serde_json::json;

    fn noop(_: &mut OrchestrationContext, _: Value) -> Result<Value, Interrupt> {
        Ok(Value::Null)
    }

    #[test]
    fn test_lookup_by_name() {
        let registry = Registry::builder()
            .orchestration("Noop", noop)
            .activity_fn("Echo", |_, input| async move { Ok(input) })
            .build()
            .unwrap();

        assert!(registry.orchestration("Noop").is_some());
        assert!(registry.activity("Echo").is_some());
        assert!(registry.activity("Missing").is_none());
        assert_eq!(registry.activity_names(), vec!["Echo"]);
    }

    #[test]
    fn test_duplicates_are_collected() {
        let err = Registry::builder()
            .orchestration("Noop", noop)
            .orchestration("Noop", noop)
            .activity_fn("Echo", |_, input| async move { Ok(input) })
            .activity_fn("Echo", |_, _| async move { Ok(json!(1)) })
            .activity_fn("", |_, input| async move { Ok(input) })
            .build()
            .unwrap_err();

        assert_eq!(err.problems.len(), 3);
        assert!(err.to_string().contains("duplicate orchestration 'Noop'"));
        assert!(err.to_string().contains("duplicate activity 'Echo'"));
    }
}
