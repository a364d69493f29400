//! Field-mapping transformation.

use serde::{Deserialize, Serialize};

use super::records::DataRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    /// Copy the value unchanged under the target name
    Rename,
    Uppercase,
    Lowercase,
    /// Use `default_value` when the source is missing or blank
    Default,
}

/// Maps one source field to one target field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
    pub kind: MappingKind,

    #[serde(default)]
    pub default_value: Option<String>,
}

impl FieldMapping {
    pub fn new(source_field: &str, target_field: &str, kind: MappingKind) -> Self {
        Self {
            source_field: source_field.to_string(),
            target_field: target_field.to_string(),
            kind,
            default_value: None,
        }
    }

    pub fn with_default(mut self, value: &str) -> Self {
        self.default_value = Some(value.to_string());
        self
    }

    fn apply(&self, value: Option<&str>) -> String {
        match self.kind {
            MappingKind::Rename => value.unwrap_or_default().to_string(),
            MappingKind::Uppercase => value.unwrap_or_default().to_uppercase(),
            MappingKind::Lowercase => value.unwrap_or_default().to_lowercase(),
            MappingKind::Default => match value {
                Some(v) if !v.trim().is_empty() => v.to_string(),
                _ => self.default_value.clone().unwrap_or_default(),
            },
        }
    }
}

pub fn default_mappings() -> Vec<FieldMapping> {
    vec![
        FieldMapping::new("name", "fullName", MappingKind::Uppercase),
        FieldMapping::new("email", "emailAddress", MappingKind::Lowercase),
        FieldMapping::new("amount", "totalAmount", MappingKind::Rename),
        FieldMapping::new("category", "tier", MappingKind::Default).with_default("Standard"),
    ]
}

/// Projects records onto the mapped target fields.
///
/// Output records keep id, source and extraction time; only mapped fields
/// survive, and a missing source field maps to an empty string.
#[derive(Debug, Clone)]
pub struct MappingTransformer {
    mappings: Vec<FieldMapping>,
}

impl MappingTransformer {
    pub fn new(mappings: Vec<FieldMapping>) -> Self {
        Self { mappings }
    }

    pub fn transform_record(&self, record: &DataRecord) -> DataRecord {
        let mut out = DataRecord::new(record.id.clone(), record.source_name.clone(), record.extracted_at);
        for mapping in &self.mappings {
            let value = mapping.apply(record.field(&mapping.source_field));
            out.fields.insert(mapping.target_field.clone(), value);
        }
        out
    }

    pub fn transform(&self, records: &[DataRecord]) -> Vec<DataRecord> {
        records.iter().map(|r| self.transform_record(r)).collect()
    }
}

impl Default for MappingTransformer {
    fn default() -> Self {
        Self::new(default_mappings())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_default_mappings() {
        let record = DataRecord::new("r1", "api", Utc::now())
            .with_field("name", "Ada Lovelace")
            .with_field("email", "Ada@Example.COM")
            .with_field("amount", "12.50")
            .with_field("ignored", "x");

        let out = MappingTransformer::default().transform_record(&record);

        assert_eq!(out.id, "r1");
        assert_eq!(out.source_name, "api");
        assert_eq!(out.field("fullName"), Some("ADA LOVELACE"));
        assert_eq!(out.field("emailAddress"), Some("ada@example.com"));
        assert_eq!(out.field("totalAmount"), Some("12.50"));
        assert_eq!(out.field("tier"), Some("Standard"));
        assert_eq!(out.field("ignored"), None);
        assert_eq!(out.fields.len(), 4);
    }

    #[test]
    fn test_missing_source_maps_to_empty() {
        let record = DataRecord::new("r1", "api", Utc::now()).with_field("category", "Premium");
        let out = MappingTransformer::default().transform_record(&record);

        assert_eq!(out.field("fullName"), Some(""));
        assert_eq!(out.field("tier"), Some("Premium"));
    }
}
