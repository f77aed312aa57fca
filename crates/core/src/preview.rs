//! Dry-run of an analyzer's mappings against a sample message.
//!
//! Nothing is written: the preview parses the message, applies the active mappings and shows the
//! laboratory entities that would be created.

use crate::apply::{MappedField, MappingEngine};
use crate::constants::{
    CATEGORY_RESULT_VALUE, CATEGORY_SAMPLE_ID, CATEGORY_TEST_CODE, MAX_PREVIEW_MESSAGE_BYTES,
};
use crate::model::{MappingType, OpenelisFieldType};
use crate::store::{AnalyzerStore, AnalyzerStoreExt};
use crate::CoreResult;
use astm::Message;
use lis_uuid::EntityId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One non-empty field of the sample message, named by position (`R_3`, ref `R|3`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ParsedField {
    pub field_name: String,
    pub astm_ref: String,
    pub raw_value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PreviewTest {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PreviewResult {
    pub test_id: String,
    pub field_name: String,
    pub value: Option<String>,
    pub unit: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EntityPreview {
    pub tests: Vec<PreviewTest>,
    pub results: Vec<PreviewResult>,
    /// Sample attributes keyed by analyzer field name.
    pub sample: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MappingPreview {
    pub parsed_fields: Vec<ParsedField>,
    pub applied_mappings: Vec<MappedField>,
    pub translated_lines: Vec<String>,
    pub entity_preview: EntityPreview,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

pub struct MappingPreviewService {
    store: Arc<dyn AnalyzerStore>,
    engine: Arc<MappingEngine>,
}

impl MappingPreviewService {
    pub fn new(store: Arc<dyn AnalyzerStore>, engine: Arc<MappingEngine>) -> Self {
        Self { store, engine }
    }

    /// Preview `message` for `analyzer_id`.
    ///
    /// Oversized or blank messages are reported in `errors`; only an unknown analyzer or a store
    /// failure is returned as an error.
    pub fn preview_mapping(&self, analyzer_id: EntityId, message: &str) -> CoreResult<MappingPreview> {
        self.store.require_analyzer(analyzer_id)?;

        let mut preview = MappingPreview::default();
        if message.len() > MAX_PREVIEW_MESSAGE_BYTES {
            preview.errors.push(format!(
                "ASTM message exceeds maximum size of {} KB",
                MAX_PREVIEW_MESSAGE_BYTES / 1024
            ));
            return Ok(preview);
        }
        let parsed = match Message::parse(message) {
            Ok(parsed) => parsed,
            Err(e) => {
                preview.errors.push(format!("Error processing ASTM message: {e}"));
                return Ok(preview);
            }
        };
        preview.parsed_fields = parsed_fields(&parsed);

        let lines = astm::split_lines(message);
        let result = self.engine.apply(analyzer_id, &lines)?;
        if !result.has_mappings {
            preview
                .warnings
                .push("Analyzer has no active mappings; message would pass through unchanged".into());
        }
        for field in &result.unmapped_fields {
            preview
                .warnings
                .push(format!("Field '{field}' is not mapped to any OpenELIS field"));
        }
        preview.warnings.extend(result.warnings);
        preview.errors.extend(result.errors);

        let active: Vec<_> = self
            .store
            .mappings_for_analyzer(analyzer_id)?
            .into_iter()
            .filter(|m| m.is_active && m.is_required)
            .collect();
        let required = [
            (
                CATEGORY_SAMPLE_ID,
                active
                    .iter()
                    .any(|m| m.openelis_field_type == OpenelisFieldType::Sample),
            ),
            (
                CATEGORY_TEST_CODE,
                active.iter().any(|m| m.mapping_type == MappingType::TestLevel),
            ),
            (
                CATEGORY_RESULT_VALUE,
                active.iter().any(|m| m.mapping_type == MappingType::ResultLevel),
            ),
        ];
        for (category, present) in required {
            if !present {
                preview
                    .warnings
                    .push(format!("Required mapping missing: {category}"));
            }
        }

        preview.entity_preview = entity_preview(&result.mapped);
        preview.applied_mappings = result.mapped;
        preview.translated_lines = result.lines;
        Ok(preview)
    }
}

fn parsed_fields(message: &Message) -> Vec<ParsedField> {
    let mut out = Vec::new();
    for record in message.records() {
        let token = record.record_type().token();
        for (index, raw) in record.fields().iter().enumerate().skip(1) {
            if raw.trim().is_empty() {
                continue;
            }
            out.push(ParsedField {
                field_name: format!("{token}_{index}"),
                astm_ref: format!("{token}|{index}"),
                raw_value: raw.clone(),
            });
        }
    }
    out
}

fn entity_preview(mapped: &[MappedField]) -> EntityPreview {
    let mut preview = EntityPreview::default();
    for field in mapped {
        match field.openelis_field_type {
            OpenelisFieldType::Test => preview.tests.push(PreviewTest {
                id: field.openelis_field_id.clone(),
                name: field.field_name.clone(),
            }),
            OpenelisFieldType::Result => preview.results.push(PreviewResult {
                test_id: field.openelis_field_id.clone(),
                field_name: field.field_name.clone(),
                value: field.value.clone(),
                unit: field.unit.clone(),
            }),
            OpenelisFieldType::Sample => {
                if let Some(value) = &field.value {
                    preview
                        .sample
                        .insert(field.field_name.clone(), value.clone());
                }
            }
            OpenelisFieldType::Qc | OpenelisFieldType::Metadata => {}
        }
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnalyzerStatus;
    use crate::testing::{analyzer_with_status, configure_analyzer, Fixture};

    const MESSAGE: &str = "H|\\^&|||COBAS^6000^1.2\rO|1|S001||^^^GLU\rR|1|^^^GLU|105.5|mg/dL\rR|2|^^^NA|140|mmol/L\rL|1|N";

    fn service(fx: &Fixture) -> MappingPreviewService {
        MappingPreviewService::new(fx.dyn_store(), Arc::new(fx.mapping_engine()))
    }

    #[test]
    fn test_preview_builds_entities() {
        let fx = Fixture::new();
        let configured = configure_analyzer(&fx, "Cobas");
        let preview = service(&fx)
            .preview_mapping(configured.analyzer, MESSAGE)
            .unwrap();

        assert!(preview.errors.is_empty());
        assert_eq!(preview.entity_preview.tests[0].id, "test.glucose");
        assert_eq!(preview.entity_preview.results[0].test_id, "result.glucose");
        assert_eq!(
            preview.entity_preview.results[0].value.as_deref(),
            Some("105.5")
        );
        assert_eq!(preview.entity_preview.sample["SAMPLE_ID"], "S001");
        assert!(preview
            .warnings
            .contains(&"Field 'NA' is not mapped to any OpenELIS field".to_string()));
        assert!(preview
            .parsed_fields
            .iter()
            .any(|f| f.field_name == "R_3" && f.raw_value == "105.5"));
    }

    #[test]
    fn test_preview_rejects_oversized_message() {
        let fx = Fixture::new();
        let analyzer = analyzer_with_status(&fx, "Cobas", AnalyzerStatus::Setup);
        let big = "R|1|^^^GLU|1\r".repeat(1000);
        let preview = service(&fx).preview_mapping(analyzer, &big).unwrap();
        assert_eq!(preview.errors.len(), 1);
        assert!(preview.parsed_fields.is_empty());
    }

    #[test]
    fn test_preview_warns_about_missing_required_mappings() {
        let fx = Fixture::new();
        let analyzer = analyzer_with_status(&fx, "Cobas", AnalyzerStatus::Setup);
        let preview = service(&fx).preview_mapping(analyzer, MESSAGE).unwrap();
        for category in ["Sample ID", "Test Code", "Result Value"] {
            assert!(preview
                .warnings
                .contains(&format!("Required mapping missing: {category}")));
        }
    }
}
