//! Mapping coverage metrics for the configuration screens.

use crate::mapping::compatible_targets;
use crate::model::{AnalyzerField, FieldType};
use crate::store::AnalyzerStore;
use crate::CoreResult;
use lis_uuid::EntityId;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Group key for fields with neither an ASTM reference nor a `PREFIX_` name.
const UNKNOWN_GROUP: &str = "UNKNOWN";

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ValidationMetrics {
    /// Share of the analyzer's fields with at least one active mapping, `0.0` to `1.0`.
    pub accuracy: f64,
    pub unmapped_fields: Vec<String>,
    pub unmapped_count: usize,
    pub warnings: Vec<String>,
    /// Coverage per record type (`R`, `O`, ...) or field-name prefix.
    pub coverage: BTreeMap<String, f64>,
}

pub struct MappingMetricsService {
    store: Arc<dyn AnalyzerStore>,
}

impl MappingMetricsService {
    pub fn new(store: Arc<dyn AnalyzerStore>) -> Self {
        Self { store }
    }

    pub fn metrics(&self, analyzer_id: EntityId) -> CoreResult<ValidationMetrics> {
        let fields = self.store.fields_for_analyzer(analyzer_id)?;
        let active = self
            .store
            .mappings_for_analyzer(analyzer_id)?
            .into_iter()
            .filter(|m| m.is_active)
            .collect::<Vec<_>>();
        let mapped: HashSet<EntityId> = active.iter().map(|m| m.analyzer_field_id).collect();

        let unmapped_fields: Vec<String> = fields
            .iter()
            .filter(|f| !mapped.contains(&f.id))
            .map(|f| f.field_name.to_string())
            .collect();

        let accuracy = ratio(fields.len() - unmapped_fields.len(), fields.len());

        let mut warnings = Vec::new();
        for mapping in &active {
            let Some(field) = fields.iter().find(|f| f.id == mapping.analyzer_field_id) else {
                continue;
            };
            if field.field_type != FieldType::Custom
                && !compatible_targets(field.field_type).contains(&mapping.openelis_field_type)
            {
                warnings.push(format!(
                    "Type mismatch for field '{}': analyzer field type '{}' is not compatible with OpenELIS field type '{}'",
                    field.field_name, field.field_type, mapping.openelis_field_type
                ));
            }
        }

        let mut groups: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for field in &fields {
            let entry = groups.entry(coverage_group(field)).or_default();
            entry.1 += 1;
            if mapped.contains(&field.id) {
                entry.0 += 1;
            }
        }
        let coverage = groups
            .into_iter()
            .map(|(group, (mapped, total))| (group, ratio(mapped, total)))
            .collect();

        Ok(ValidationMetrics {
            accuracy,
            unmapped_count: unmapped_fields.len(),
            unmapped_fields,
            warnings,
            coverage,
        })
    }
}

fn coverage_group(field: &AnalyzerField) -> String {
    if let Some((record, _)) = field.position() {
        return record.to_string();
    }
    if let Some(astm_ref) = field.astm_ref.as_deref() {
        return astm_ref.to_string();
    }
    match field.field_name.as_str().split_once('_') {
        Some((prefix, _)) if !prefix.is_empty() => prefix.to_string(),
        _ => UNKNOWN_GROUP.to_string(),
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnalyzerStatus;
    use crate::testing::{add_field, analyzer_with_status, configure_analyzer, Fixture};

    #[test]
    fn test_metrics_for_unconfigured_analyzer() {
        let fx = Fixture::new();
        let analyzer = analyzer_with_status(&fx, "Bare", AnalyzerStatus::Setup);
        let metrics = MappingMetricsService::new(fx.dyn_store())
            .metrics(analyzer)
            .unwrap();
        assert_eq!(metrics.accuracy, 0.0);
        assert!(metrics.coverage.is_empty());
    }

    #[test]
    fn test_accuracy_and_unmapped_fields() {
        let fx = Fixture::new();
        let configured = configure_analyzer(&fx, "Cobas");
        add_field(&fx, configured.analyzer, "HB_A1C", FieldType::Numeric, Some("%"));
        add_field(&fx, configured.analyzer, "HB_F", FieldType::Numeric, Some("%"));

        let metrics = MappingMetricsService::new(fx.dyn_store())
            .metrics(configured.analyzer)
            .unwrap();
        assert_eq!(metrics.accuracy, 0.5);
        assert_eq!(metrics.unmapped_fields, vec!["HB_A1C", "HB_F"]);
        assert_eq!(metrics.unmapped_count, 2);
        assert_eq!(metrics.coverage["O"], 1.0);
        assert_eq!(metrics.coverage["HB"], 0.0);
        assert_eq!(metrics.coverage[UNKNOWN_GROUP], 1.0);
        assert!(metrics.warnings.is_empty());
    }
}
