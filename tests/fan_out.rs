//! Fan-Out/Fan-In Integration Tests
//!
//! Tests for parallel extraction, partial source failure and the
//! validate -> transform -> load chain.

use std::future::{ready, Ready};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

use sagaflow::adapters::etl::EtlServices;
use sagaflow::adapters::ActivityContext;
use sagaflow::core::{InMemoryHistoryStore, Registry, RetryPolicy, Runtime, RuntimeSettings};
use sagaflow::domain::{EventKind, InstanceStatus, TaskFailure, TaskResult};
use sagaflow::etl::pipeline::{
    EXTRACT_FROM_API, EXTRACT_FROM_DATABASE, LOAD_DATA, TRANSFORM_DATA, VALIDATE_DATA,
};
use sagaflow::etl::{
    merge_extractions, DataRecord, EtlOrchestration, EtlResult, EtlSettings, EtlSource,
    ExtractionResult, ETL_ORCHESTRATOR,
};

fn settings(dir: &TempDir) -> EtlSettings {
    EtlSettings {
        csv_source: Some(dir.path().join("source.csv")),
        output_dir: dir.path().join("out"),
        ..EtlSettings::default()
    }
}

fn runtime_settings() -> RuntimeSettings {
    RuntimeSettings {
        retry: RetryPolicy::no_retry(),
        ..RuntimeSettings::default()
    }
}

/// An extractor whose source is always unreachable
fn broken(name: &'static str) -> impl Fn(ActivityContext, Value) -> Ready<TaskResult> + Send + Sync + 'static {
    move |_, _| ready(Err(TaskFailure::business(format!("{} unreachable", name))))
}

async fn run_etl(runtime: &Runtime, instance_id: &str, run_id: &str) -> EtlResult {
    runtime.start_with_id(instance_id, ETL_ORCHESTRATOR, json!(run_id)).await.unwrap();
    let report = runtime.run_to_completion(instance_id).await.unwrap();
    assert_eq!(report.status, InstanceStatus::Completed, "{:?}", report.failure_reason);
    serde_json::from_value(report.output.unwrap()).unwrap()
}

async fn scheduled_activities(runtime: &Runtime, instance_id: &str) -> Vec<String> {
    runtime
        .history(instance_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EventKind::TaskScheduled)
        .filter_map(|e| e.name)
        .collect()
}

#[tokio::test]
async fn test_one_failed_source_still_loads() {
    let dir = TempDir::new().unwrap();
    let services = EtlServices::new(settings(&dir)).unwrap();
    let orchestration = EtlOrchestration::new(vec![
        EtlSource::new("ExternalApi", EXTRACT_FROM_API),
        EtlSource::new("Broken", "ExtractFromBroken"),
        EtlSource::new("Database", EXTRACT_FROM_DATABASE),
    ]);
    let builder = Registry::builder()
        .orchestration(ETL_ORCHESTRATOR, orchestration)
        .activity_fn("ExtractFromBroken", broken("Broken"));
    let registry = services.register(builder).build().unwrap();
    let runtime = Runtime::new(Arc::new(InMemoryHistoryStore::new()), registry, runtime_settings());

    let result = run_etl(&runtime, "etl-partial", "run-partial").await;

    assert_eq!(result.failed_sources, vec!["Broken".to_string()]);
    assert_eq!(result.total_extracted, 5 + 4);
    assert_eq!(result.valid_count, 9);
    assert_eq!(result.invalid_count, 0);
    assert_eq!(result.loaded_count, 9);
    assert!(services.output_path("run-partial").exists());

    // All three branches were scheduled in one turn, before anything else
    let scheduled = scheduled_activities(&runtime, "etl-partial").await;
    assert_eq!(
        scheduled,
        vec![
            EXTRACT_FROM_API.to_string(),
            "ExtractFromBroken".to_string(),
            EXTRACT_FROM_DATABASE.to_string(),
            VALIDATE_DATA.to_string(),
            TRANSFORM_DATA.to_string(),
            LOAD_DATA.to_string(),
        ]
    );
}

#[tokio::test]
async fn test_all_sources_failed_skips_downstream() {
    let dir = TempDir::new().unwrap();
    let services = EtlServices::new(settings(&dir)).unwrap();
    let orchestration = EtlOrchestration::new(vec![
        EtlSource::new("A", "ExtractA"),
        EtlSource::new("B", "ExtractB"),
        EtlSource::new("C", "ExtractC"),
    ]);
    let builder = Registry::builder()
        .orchestration(ETL_ORCHESTRATOR, orchestration)
        .activity_fn("ExtractA", broken("A"))
        .activity_fn("ExtractB", broken("B"))
        .activity_fn("ExtractC", broken("C"));
    let registry = services.register(builder).build().unwrap();
    let runtime = Runtime::new(Arc::new(InMemoryHistoryStore::new()), registry, runtime_settings());

    let result = run_etl(&runtime, "etl-empty", "run-empty").await;

    assert_eq!(result.total_extracted, 0);
    assert_eq!(result.loaded_count, 0);
    assert_eq!(result.failed_sources, vec!["A".to_string(), "B".to_string(), "C".to_string()]);

    let scheduled = scheduled_activities(&runtime, "etl-empty").await;
    assert_eq!(scheduled.len(), 3);
    assert!(!services.output_path("run-empty").exists());
}

#[tokio::test]
async fn test_default_pipeline_with_csv() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("source.csv"),
        "name,email,amount,category\n\
         Grace,grace@example.com,42.00,Premium\n\
         ,nobody@example.com,10\n\
         Linus,not-an-email,2000000\n",
    )
    .unwrap();

    let services = EtlServices::new(settings(&dir)).unwrap();
    let builder = Registry::builder().orchestration(ETL_ORCHESTRATOR, EtlOrchestration::default());
    let registry = services.register(builder).build().unwrap();
    let runtime = Runtime::new(Arc::new(InMemoryHistoryStore::new()), registry, runtime_settings());

    let result = run_etl(&runtime, "etl-full", "run-full").await;

    assert!(result.failed_sources.is_empty());
    assert_eq!(result.total_extracted, 5 + 3 + 4);
    assert_eq!(result.invalid_count, 2);
    assert_eq!(result.valid_count, 10);
    assert_eq!(result.loaded_count, 10);

    let written: Vec<DataRecord> =
        serde_json::from_slice(&std::fs::read(services.output_path("run-full")).unwrap()).unwrap();
    assert_eq!(written.len(), 10);
    assert!(written.iter().any(|r| r.field("fullName") == Some("GRACE")));
    assert!(written.iter().all(|r| r.field("tier").is_some_and(|t| !t.is_empty())));
}

fn extraction(source: &str, count: usize, ok: bool) -> ExtractionResult {
    if !ok {
        return ExtractionResult::failure(source, "down");
    }
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let records = (0..count)
        .map(|i| DataRecord::new(format!("{}-{}", source, i), source, at).with_field("n", i.to_string()))
        .collect();
    ExtractionResult::success(source, records)
}

proptest! {
    #[test]
    fn prop_merge_is_order_independent(
        branches in prop::collection::vec((0usize..5, any::<bool>()), 1..6)
            .prop_flat_map(|branches| {
                let results: Vec<ExtractionResult> = branches
                    .iter()
                    .enumerate()
                    .map(|(i, (count, ok))| extraction(&format!("src{}", i), *count, *ok))
                    .collect();
                (Just(results.clone()), Just(results).prop_shuffle())
            })
    ) {
        let (in_order, shuffled) = branches;
        let expected_total: usize = in_order.iter().filter(|r| r.is_success).map(|r| r.records.len()).sum();

        let a = merge_extractions(in_order);
        let b = merge_extractions(shuffled);

        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.records.len(), expected_total);
        let mut sorted = a.failed_sources.clone();
        sorted.sort();
        prop_assert_eq!(a.failed_sources, sorted);
    }
}
