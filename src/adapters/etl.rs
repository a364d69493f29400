//! ETL activities: simulated API and database sources, a CSV file source,
//! rule validation, field mapping and a JSON file loader.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::RegistryBuilder;
use crate::domain::{TaskFailure, TaskResult};
use crate::etl::pipeline::{
    EtlSettings, EXTRACT_FROM_API, EXTRACT_FROM_CSV, EXTRACT_FROM_DATABASE, LOAD_DATA,
    TRANSFORM_DATA, VALIDATE_DATA,
};
use crate::etl::{
    DataRecord, ExtractionResult, LoadRequest, MappingTransformer, RuleBasedValidator, RuleError,
};

use super::{decode, encode, ActivityContext};

const API_SOURCE: &str = "ExternalApi";
const CSV_SOURCE: &str = "CsvFile";
const DATABASE_SOURCE: &str = "Database";

/// Record ids derived from the task key, so a re-executed extraction
/// yields the same ids.
fn record_id(ctx: &ActivityContext, index: usize) -> String {
    let name = format!("{}:{}", ctx.idempotency_key, index);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Parse CSV text with a header row into records.
///
/// Values are split on commas and trimmed; blank lines are skipped and
/// columns beyond the header are dropped.
pub fn parse_csv(ctx: &ActivityContext, content: &str) -> Vec<DataRecord> {
    let mut lines = content.lines().map(str::trim).filter(|line| !line.is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let headers: Vec<&str> = header.split(',').map(str::trim).collect();
    let extracted_at = Utc::now();

    lines
        .enumerate()
        .map(|(i, line)| {
            let mut record = DataRecord::new(record_id(ctx, i), CSV_SOURCE, extracted_at);
            for (name, value) in headers.iter().zip(line.split(',').map(str::trim)) {
                record.fields.insert(name.to_string(), value.to_string());
            }
            record
        })
        .collect()
}

/// The ETL activity implementations
#[derive(Debug, Clone)]
pub struct EtlServices {
    settings: Arc<EtlSettings>,
    validator: RuleBasedValidator,
    transformer: MappingTransformer,
}

impl EtlServices {
    pub fn new(settings: EtlSettings) -> Result<Self, RuleError> {
        let validator = RuleBasedValidator::new(&settings.rules)?;
        let transformer = MappingTransformer::new(settings.mappings.clone());
        Ok(Self {
            settings: Arc::new(settings),
            validator,
            transformer,
        })
    }

    pub fn settings(&self) -> &EtlSettings {
        &self.settings
    }

    /// Where the loader writes a run's output
    pub fn output_path(&self, run_id: &str) -> PathBuf {
        self.settings.output_dir.join(format!("{}.json", run_id))
    }

    /// Register the six ETL activities on a registry builder
    pub fn register(&self, builder: RegistryBuilder) -> RegistryBuilder {
        let api = self.clone();
        let csv = self.clone();
        let db = self.clone();
        let validate = self.clone();
        let transform = self.clone();
        let load = self.clone();

        builder
            .activity_fn(EXTRACT_FROM_API, move |ctx, input| {
                let services = api.clone();
                async move { services.extract_from_api(&ctx, input) }
            })
            .activity_fn(EXTRACT_FROM_CSV, move |ctx, input| {
                let services = csv.clone();
                async move { services.extract_from_csv(&ctx, input).await }
            })
            .activity_fn(EXTRACT_FROM_DATABASE, move |ctx, input| {
                let services = db.clone();
                async move { services.extract_from_database(&ctx, input) }
            })
            .activity_fn(VALIDATE_DATA, move |_ctx, input| {
                let services = validate.clone();
                async move { services.validate(input) }
            })
            .activity_fn(TRANSFORM_DATA, move |_ctx, input| {
                let services = transform.clone();
                async move { services.transform(input) }
            })
            .activity_fn(LOAD_DATA, move |_ctx, input| {
                let services = load.clone();
                async move { services.load(input).await }
            })
    }

    fn extract_from_api(&self, ctx: &ActivityContext, input: Value) -> TaskResult {
        let run_id: String = decode(input)?;
        let extracted_at = Utc::now();

        let records: Vec<DataRecord> = (1..=5)
            .map(|i| {
                DataRecord::new(record_id(ctx, i), API_SOURCE, extracted_at)
                    .with_field("name", format!("API Record {}", i))
                    .with_field("email", format!("user{}@example.com", i))
                    .with_field("amount", format!("{:.2}", i as f64 * 100.50))
                    .with_field("category", if i % 2 == 0 { "Premium" } else { "Standard" })
            })
            .collect();

        info!(%run_id, count = records.len(), "Extracted records from external API");
        encode(&ExtractionResult::success(API_SOURCE, records))
    }

    fn extract_from_database(&self, ctx: &ActivityContext, input: Value) -> TaskResult {
        let run_id: String = decode(input)?;
        let extracted_at = Utc::now();

        let records: Vec<DataRecord> = (1..=4)
            .map(|i| {
                DataRecord::new(record_id(ctx, i), DATABASE_SOURCE, extracted_at)
                    .with_field("name", format!("DB Record {}", i))
                    .with_field("email", format!("db-user{}@example.com", i))
                    .with_field("amount", format!("{:.2}", i as f64 * 250.00))
                    .with_field("category", "Enterprise")
            })
            .collect();

        info!(%run_id, count = records.len(), "Extracted records from database");
        encode(&ExtractionResult::success(DATABASE_SOURCE, records))
    }

    async fn extract_from_csv(&self, ctx: &ActivityContext, input: Value) -> TaskResult {
        let run_id: String = decode(input)?;

        let Some(path) = self.settings.csv_source.as_deref() else {
            warn!(%run_id, "No CSV source configured");
            return encode(&ExtractionResult::success(CSV_SOURCE, Vec::new()));
        };

        let result = match read_csv(path).await {
            Ok(None) => {
                warn!(%run_id, path = %path.display(), "CSV source not found");
                ExtractionResult::success(CSV_SOURCE, Vec::new())
            }
            Ok(Some(content)) => {
                let mut records = parse_csv(ctx, &content);
                let limit = self.settings.max_records_per_source;
                if records.len() > limit {
                    warn!(%run_id, found = records.len(), limit, "CSV source truncated");
                    records.truncate(limit);
                }
                info!(%run_id, count = records.len(), "Extracted records from CSV");
                ExtractionResult::success(CSV_SOURCE, records)
            }
            Err(e) => {
                warn!(%run_id, error = %e, "CSV extraction failed");
                ExtractionResult::failure(CSV_SOURCE, e.to_string())
            }
        };

        encode(&result)
    }

    fn validate(&self, input: Value) -> TaskResult {
        let records: Vec<DataRecord> = decode(input)?;
        let result = self.validator.validate(records);

        info!(
            valid = result.valid_records.len(),
            invalid = result.invalid_records.len(),
            "Validation complete"
        );
        encode(&result)
    }

    fn transform(&self, input: Value) -> TaskResult {
        let records: Vec<DataRecord> = decode(input)?;
        let transformed = self.transformer.transform(&records);

        info!(count = transformed.len(), "Transformed records");
        encode(&transformed)
    }

    async fn load(&self, input: Value) -> TaskResult {
        let request: LoadRequest = decode(input)?;
        if request.run_id.trim().is_empty() {
            return Err(TaskFailure::business("Pipeline run id is required."));
        }

        let path = self.output_path(&request.run_id);
        let json = serde_json::to_vec_pretty(&request.records)
            .map_err(|e| TaskFailure::payload(format!("Failed to serialize records: {}", e)))?;

        tokio::fs::create_dir_all(&self.settings.output_dir)
            .await
            .map_err(|e| TaskFailure::transient(format!("Failed to create output directory: {}", e)))?;

        // Overwrite keeps re-executed loads idempotent
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| TaskFailure::transient(format!("Failed to write {}: {}", path.display(), e)))?;

        info!(run_id = %request.run_id, count = request.records.len(), path = %path.display(), "Loaded records");
        encode(&request.records.len())
    }
}

async fn read_csv(path: &Path) -> std::io::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::ValidationResult;
    use serde_json::json;
    use tempfile::TempDir;

    fn ctx(task_id: u64) -> ActivityContext {
        ActivityContext {
            instance_id: "run".to_string(),
            task_id,
            activity_name: "x".to_string(),
            attempt: 1,
            idempotency_key: format!("run:{}:0000", task_id),
        }
    }

    fn services(dir: &TempDir) -> EtlServices {
        EtlServices::new(EtlSettings {
            csv_source: Some(dir.path().join("source.csv")),
            output_dir: dir.path().join("out"),
            ..EtlSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_parse_csv() {
        let content = "name, email ,amount\n Ada ,ada@example.com, 10\n\nBob,bob@example.com\n";
        let records = parse_csv(&ctx(0), content);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field("name"), Some("Ada"));
        assert_eq!(records[0].field("email"), Some("ada@example.com"));
        assert_eq!(records[1].field("amount"), None);
        assert!(parse_csv(&ctx(0), "name,email\n").is_empty());
    }

    #[test]
    fn test_api_extraction_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir);

        let first: ExtractionResult = serde_json::from_value(services.extract_from_api(&ctx(0), json!("r")).unwrap()).unwrap();
        let second: ExtractionResult = serde_json::from_value(services.extract_from_api(&ctx(0), json!("r")).unwrap()).unwrap();

        assert_eq!(first.records.len(), 5);
        assert_eq!(first.records[1].field("amount"), Some("201.00"));
        assert_eq!(first.records[1].field("category"), Some("Premium"));
        let ids = |r: &ExtractionResult| r.records.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn test_missing_csv_is_empty_success() {
        let dir = TempDir::new().unwrap();
        let output = services(&dir).extract_from_csv(&ctx(1), json!("r")).await.unwrap();
        let result: ExtractionResult = serde_json::from_value(output).unwrap();

        assert!(result.is_success);
        assert!(result.records.is_empty());
    }

    #[tokio::test]
    async fn test_csv_respects_record_limit() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("source.csv"), "name\na\nb\nc\n").unwrap();
        let services = EtlServices::new(EtlSettings {
            csv_source: Some(dir.path().join("source.csv")),
            max_records_per_source: 2,
            ..EtlSettings::default()
        })
        .unwrap();

        let output = services.extract_from_csv(&ctx(1), json!("r")).await.unwrap();
        let result: ExtractionResult = serde_json::from_value(output).unwrap();
        assert_eq!(result.records.len(), 2);
    }

    #[tokio::test]
    async fn test_validate_transform_load() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir);

        let extracted: ExtractionResult =
            serde_json::from_value(services.extract_from_database(&ctx(2), json!("r")).unwrap()).unwrap();
        let validation: ValidationResult =
            serde_json::from_value(services.validate(json!(extracted.records)).unwrap()).unwrap();
        assert_eq!(validation.valid_records.len(), 4);

        let transformed = services.transform(json!(validation.valid_records)).unwrap();
        let request = json!({ "run_id": "run-9", "records": transformed });

        assert_eq!(services.load(request.clone()).await.unwrap(), json!(4));
        assert_eq!(services.load(request).await.unwrap(), json!(4));

        let written: Vec<DataRecord> =
            serde_json::from_slice(&std::fs::read(services.output_path("run-9")).unwrap()).unwrap();
        assert_eq!(written.len(), 4);
        assert_eq!(written[0].field("fullName"), Some("DB RECORD 1"));
        assert_eq!(written[0].field("tier"), Some("Enterprise"));
    }
}
