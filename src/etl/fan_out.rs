//! Fan-in merge of extraction branches.

use serde::{Deserialize, Serialize};

use super::records::{DataRecord, ExtractionResult};

/// Combined output of all extraction branches
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedExtraction {
    pub records: Vec<DataRecord>,
    pub failed_sources: Vec<String>,
}

impl MergedExtraction {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Merge branch results independently of the order they arrived in.
///
/// Branches are stably sorted by source name, successful branches' records
/// are concatenated in that order and failed source names are collected.
pub fn merge_extractions(mut results: Vec<ExtractionResult>) -> MergedExtraction {
    results.sort_by(|a, b| a.source_name.cmp(&b.source_name));

    let mut merged = MergedExtraction::default();
    for result in results {
        if result.is_success {
            merged.records.extend(result.records);
        } else {
            merged.failed_sources.push(result.source_name);
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn source(name: &str, count: usize) -> ExtractionResult {
        let records = (0..count)
            .map(|i| DataRecord::new(format!("{}-{}", name, i), name, Utc::now()))
            .collect();
        ExtractionResult::success(name, records)
    }

    #[test]
    fn test_merge_sorts_by_source() {
        let merged = merge_extractions(vec![
            source("b", 1),
            ExtractionResult::failure("c", "down"),
            source("a", 2),
        ]);

        let ids: Vec<_> = merged.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a-0", "a-1", "b-0"]);
        assert_eq!(merged.failed_sources, vec!["c".to_string()]);
    }

    #[test]
    fn test_all_failed_is_empty() {
        let merged = merge_extractions(vec![
            ExtractionResult::failure("a", "x"),
            ExtractionResult::failure("b", "y"),
        ]);

        assert!(merged.is_empty());
        assert_eq!(merged.failed_sources, vec!["a".to_string(), "b".to_string()]);
    }
}
