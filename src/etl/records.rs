//! Value objects flowing through the ETL pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single record extracted from a source system.
///
/// Fields are a string map so heterogeneous sources share one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Unique record id
    pub id: String,

    /// Source system the record came from
    pub source_name: String,

    /// When the record was extracted
    pub extracted_at: DateTime<Utc>,

    /// Record data
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl DataRecord {
    pub fn new(id: impl Into<String>, source_name: impl Into<String>, extracted_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            source_name: source_name.into(),
            extracted_at,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Output of one fan-out branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub source_name: String,

    #[serde(default)]
    pub records: Vec<DataRecord>,

    pub is_success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExtractionResult {
    pub fn success(source_name: impl Into<String>, records: Vec<DataRecord>) -> Self {
        Self {
            source_name: source_name.into(),
            records,
            is_success: true,
            error_message: None,
        }
    }

    pub fn failure(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            records: Vec::new(),
            is_success: false,
            error_message: Some(message.into()),
        }
    }
}

/// Records split by validity, with every failing rule message per invalid record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid_records: Vec<DataRecord>,
    pub invalid_records: Vec<DataRecord>,

    /// Record id -> error messages
    #[serde(default)]
    pub errors: BTreeMap<String, Vec<String>>,
}

impl ValidationResult {
    pub fn errors_for(&self, record_id: &str) -> &[String] {
        self.errors.get(record_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Input to the load step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub run_id: String,
    pub records: Vec<DataRecord>,
}

/// Terminal output of an ETL run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtlResult {
    pub run_id: String,
    pub total_extracted: usize,
    pub valid_count: usize,
    pub invalid_count: usize,
    pub loaded_count: usize,

    /// Sources whose extraction failed, sorted by name
    #[serde(default)]
    pub failed_sources: Vec<String>,
}

impl EtlResult {
    /// A run with nothing to process
    pub fn empty(run_id: impl Into<String>, failed_sources: Vec<String>) -> Self {
        Self {
            run_id: run_id.into(),
            failed_sources,
            ..Self::default()
        }
    }
}
