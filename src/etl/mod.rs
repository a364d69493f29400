//! Fan-out/fan-in ETL pipeline.
//!
//! - `records`: Data records and per-stage results
//! - `validation`: Required / Regex / Range rules
//! - `transform`: Field mappings
//! - `fan_out`: Order-independent merge of extraction branches
//! - `pipeline`: The ETL orchestration and its settings

pub mod fan_out;
pub mod pipeline;
pub mod records;
pub mod transform;
pub mod validation;

pub use fan_out::{merge_extractions, MergedExtraction};
pub use pipeline::{EtlOrchestration, EtlSettings, EtlSource, ETL_ORCHESTRATOR};
pub use records::{DataRecord, EtlResult, ExtractionResult, LoadRequest, ValidationResult};
pub use transform::{FieldMapping, MappingKind, MappingTransformer};
pub use validation::{RuleBasedValidator, RuleError, RuleKind, ValidationRule};
