//! The ETL orchestration: parallel extraction, then validate, transform, load.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::core::{decode_input, encode_output, Interrupt, Orchestration, OrchestrationContext};
use crate::domain::TaskFailure;

use super::fan_out::merge_extractions;
use super::records::{DataRecord, EtlResult, ExtractionResult, LoadRequest, ValidationResult};
use super::transform::{default_mappings, FieldMapping};
use super::validation::{default_rules, ValidationRule};

pub const ETL_ORCHESTRATOR: &str = "EtlOrchestrator";

pub const EXTRACT_FROM_API: &str = "ExtractFromApi";
pub const EXTRACT_FROM_CSV: &str = "ExtractFromCsv";
pub const EXTRACT_FROM_DATABASE: &str = "ExtractFromDatabase";
pub const VALIDATE_DATA: &str = "ValidateData";
pub const TRANSFORM_DATA: &str = "TransformData";
pub const LOAD_DATA: &str = "LoadData";

/// A fan-out branch: a source name and the activity that extracts it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtlSource {
    pub name: String,
    pub activity: String,
}

impl EtlSource {
    pub fn new(name: &str, activity: &str) -> Self {
        Self {
            name: name.to_string(),
            activity: activity.to_string(),
        }
    }
}

fn default_sources() -> Vec<EtlSource> {
    vec![
        EtlSource::new("ExternalApi", EXTRACT_FROM_API),
        EtlSource::new("CsvFile", EXTRACT_FROM_CSV),
        EtlSource::new("Database", EXTRACT_FROM_DATABASE),
    ]
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("etl-output")
}

fn default_max_records() -> usize {
    10_000
}

/// ETL pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlSettings {
    /// Extraction branches, run in parallel
    #[serde(default = "default_sources")]
    pub sources: Vec<EtlSource>,

    /// CSV file read by the CSV extractor
    #[serde(default)]
    pub csv_source: Option<PathBuf>,

    /// Directory the loader writes `<run_id>.json` into
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_max_records")]
    pub max_records_per_source: usize,

    #[serde(default = "default_rules")]
    pub rules: Vec<ValidationRule>,

    #[serde(default = "default_mappings")]
    pub mappings: Vec<FieldMapping>,
}

impl Default for EtlSettings {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            csv_source: None,
            output_dir: default_output_dir(),
            max_records_per_source: default_max_records(),
            rules: default_rules(),
            mappings: default_mappings(),
        }
    }
}

/// Fan-out/fan-in ETL orchestration.
///
/// Input is the run id. A failed source is reported in `failed_sources`
/// and never fails the run; a failure in validate, transform or load does.
#[derive(Debug, Clone)]
pub struct EtlOrchestration {
    sources: Vec<EtlSource>,
}

impl EtlOrchestration {
    pub fn new(sources: Vec<EtlSource>) -> Self {
        Self { sources }
    }

    pub fn sources(&self) -> &[EtlSource] {
        &self.sources
    }
}

impl Default for EtlOrchestration {
    fn default() -> Self {
        Self::new(default_sources())
    }
}

impl Orchestration for EtlOrchestration {
    fn run(&self, ctx: &mut OrchestrationContext, input: Value) -> Result<Value, Interrupt> {
        let run_id: String = decode_input(input)?;
        if run_id.trim().is_empty() {
            return Err(Interrupt::InvalidInput("Pipeline run id is required.".to_string()));
        }

        if !ctx.is_replaying() {
            info!(%run_id, sources = self.sources.len(), "Starting ETL orchestration");
        }

        let calls: Vec<(String, String)> = self
            .sources
            .iter()
            .map(|source| (source.activity.clone(), run_id.clone()))
            .collect();
        let branches: Vec<Result<ExtractionResult, TaskFailure>> = ctx.call_all(&calls)?;

        // Branches are keyed by the configured source name
        let extractions: Vec<ExtractionResult> = self
            .sources
            .iter()
            .zip(branches)
            .map(|(source, branch)| match branch {
                Ok(result) => ExtractionResult {
                    source_name: source.name.clone(),
                    ..result
                },
                Err(failure) => ExtractionResult::failure(&source.name, failure.message),
            })
            .collect();

        let replaying = ctx.is_replaying();
        if !replaying {
            for extraction in &extractions {
                if extraction.is_success {
                    info!(source = %extraction.source_name, count = extraction.records.len(), "Source extracted");
                } else {
                    warn!(
                        source = %extraction.source_name,
                        error = extraction.error_message.as_deref().unwrap_or(""),
                        "Source extraction failed"
                    );
                }
            }
        }

        let merged = merge_extractions(extractions);
        if merged.is_empty() {
            if !replaying {
                warn!(%run_id, "No records extracted from any source");
            }
            return encode_output(&EtlResult::empty(run_id, merged.failed_sources));
        }
        let total_extracted = merged.records.len();

        let validation: ValidationResult = ctx.call_activity(VALIDATE_DATA, &merged.records)??;
        let valid_count = validation.valid_records.len();
        let invalid_count = validation.invalid_records.len();

        let mut result = EtlResult {
            run_id: run_id.clone(),
            total_extracted,
            valid_count,
            invalid_count,
            loaded_count: 0,
            failed_sources: merged.failed_sources,
        };

        if valid_count == 0 {
            if !ctx.is_replaying() {
                warn!(%run_id, invalid_count, "No valid records after validation");
            }
            return encode_output(&result);
        }

        let transformed: Vec<DataRecord> =
            ctx.call_activity(TRANSFORM_DATA, &validation.valid_records)??;

        let request = LoadRequest {
            run_id: run_id.clone(),
            records: transformed,
        };
        result.loaded_count = ctx.call_activity(LOAD_DATA, &request)??;

        if !ctx.is_replaying() {
            info!(
                %run_id,
                total_extracted,
                valid_count,
                invalid_count,
                loaded = result.loaded_count,
                "ETL run complete"
            );
        }

        encode_output(&result)
    }
}
