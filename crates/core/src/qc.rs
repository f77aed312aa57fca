//! QC result extraction.
//!
//! Q records are resolved through the same mapping store as patient results: the record's test
//! code names an analyzer field mapped to an OpenELIS TEST, and its control lot names a field mapped
//! to an OpenELIS QC lot. Extraction is all-or-nothing; any unresolved part rejects the result.

use crate::apply::convert_value;
use crate::model::{AnalyzerField, FieldMapping, OpenelisFieldType};
use crate::rules::parse_decimal;
use crate::store::AnalyzerStore;
use crate::{CoreError, CoreResult};
use astm::{ControlLevel, QcSegmentData};
use chrono::NaiveDateTime;
use lis_uuid::EntityId;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QcLevel {
    Low,
    Normal,
    High,
}

impl From<ControlLevel> for QcLevel {
    fn from(level: ControlLevel) -> Self {
        match level {
            ControlLevel::Low => Self::Low,
            ControlLevel::Normal => Self::Normal,
            ControlLevel::High => Self::High,
        }
    }
}

/// A QC measurement translated into laboratory-system identifiers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QcResult {
    pub analyzer_id: EntityId,
    pub instrument_id: Option<String>,
    pub test_id: String,
    pub control_lot_id: String,
    pub control_level: QcLevel,
    pub result_value: Decimal,
    pub unit: String,
    pub timestamp: NaiveDateTime,
    pub flag: Option<String>,
}

/// Receives extracted QC results (the laboratory's QC module).
pub trait QcResultSink: Send + Sync {
    /// # Errors
    ///
    /// Any error is recorded against the analyzer by the caller.
    fn record(&self, result: &QcResult) -> CoreResult<()>;
}

pub struct QcExtractionService {
    store: Arc<dyn AnalyzerStore>,
    conversion_scale: u32,
}

impl QcExtractionService {
    pub fn new(store: Arc<dyn AnalyzerStore>, conversion_scale: u32) -> Self {
        Self {
            store,
            conversion_scale,
        }
    }

    /// Translate one parsed Q record for `analyzer_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] if the test code or control lot has no active mapping,
    /// the value is not numeric, or the reported unit is configured to be rejected.
    pub fn extract(&self, qc: &QcSegmentData, analyzer_id: EntityId) -> CoreResult<QcResult> {
        let fields = self.store.fields_for_analyzer(analyzer_id)?;
        let mappings = self.store.mappings_for_analyzer(analyzer_id)?;

        let test_code = qc.test_code();
        let (test_field, test_id) =
            resolve(&fields, &mappings, test_code, OpenelisFieldType::Test).ok_or_else(|| {
                CoreError::Validation(format!("No mapping found for test code: {test_code}"))
            })?;

        let lot = qc.control_lot_number();
        let (_, control_lot_id) = resolve(&fields, &mappings, lot, OpenelisFieldType::Qc)
            .ok_or_else(|| {
                CoreError::Validation(format!("No mapping found for control lot number: {lot}"))
            })?;

        let raw_value = qc.result_value();
        let value = parse_decimal(raw_value).ok_or_else(|| {
            CoreError::Validation(format!("Invalid result value: {raw_value}"))
        })?;

        let (result_value, unit) = self.convert(test_field, value, qc.unit().trim())?;

        Ok(QcResult {
            analyzer_id,
            instrument_id: qc.instrument_id().map(str::to_string),
            test_id,
            control_lot_id,
            control_level: qc.control_level().into(),
            result_value,
            unit,
            timestamp: qc.timestamp(),
            flag: qc.flag().map(str::to_string),
        })
    }

    /// Parse every Q record in `message` and translate them all.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Parse`] for a malformed message, otherwise the first extraction error.
    /// No partial list is returned.
    pub fn extract_message(&self, analyzer_id: EntityId, message: &str) -> CoreResult<Vec<QcResult>> {
        astm::parse_q_segments(message)?
            .iter()
            .map(|qc| self.extract(qc, analyzer_id))
            .collect()
    }

    fn convert(
        &self,
        field: &AnalyzerField,
        value: Decimal,
        unit: &str,
    ) -> CoreResult<(Decimal, String)> {
        if unit.is_empty() {
            return Ok((value, String::new()));
        }
        let unit_mappings = self.store.unit_mappings_for_field(field.id)?;
        let Some(mapping) = unit_mappings
            .iter()
            .find(|m| m.analyzer_unit.eq_ignore_case(unit)) else {
            return Ok((value, unit.to_string()));
        };

        match mapping.conversion_factor {
            Some(factor) if !factor.is_zero() => Ok((
                convert_value(value, factor, self.conversion_scale),
                mapping.openelis_unit.to_string(),
            )),
            _ if !mapping.units_differ() => Ok((value, mapping.openelis_unit.to_string())),
            _ => Err(CoreError::Validation(format!(
                "QC unit '{unit}' for {} is rejected, expected '{}'",
                field.field_name, mapping.openelis_unit
            ))),
        }
    }
}

/// Find the active field named `name` and its active mapping onto `target`.
fn resolve<'a>(
    fields: &'a [AnalyzerField],
    mappings: &[FieldMapping],
    name: &str,
    target: OpenelisFieldType,
) -> Option<(&'a AnalyzerField, String)> {
    let field = fields
        .iter()
        .find(|f| f.is_active && f.field_name == name)?;
    mappings
        .iter()
        .find(|m| m.is_active && m.analyzer_field_id == field.id && m.openelis_field_type == target)
        .map(|m| (field, m.openelis_field_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{NewCustomType, NewField, NewUnitMapping};
    use crate::model::{AnalyzerStatus, FieldType, MappingType};
    use crate::testing::{add_field, add_mapping, analyzer_with_status, Fixture};
    use std::str::FromStr;

    const HEADER: &str = "H|\\^&|||TEST_ANALYZER^MODEL^V1|||||||P|LIS2-A2";

    /// Analyzer with GLUCOSE mapped to a test and LOT1 mapped to a QC lot.
    fn qc_analyzer(fx: &Fixture) -> (EntityId, EntityId) {
        let analyzer = analyzer_with_status(fx, "QC", AnalyzerStatus::Setup);
        let glucose = add_field(fx, analyzer, "GLUCOSE", FieldType::Numeric, Some("mg/dL"));
        let test = add_mapping(
            fx,
            glucose,
            "test.glucose",
            OpenelisFieldType::Test,
            MappingType::TestLevel,
            false,
        );

        let svc = fx.mappings();
        let lot_type = svc
            .create_custom_type(NewCustomType {
                type_name: "CONTROL_LOT".into(),
                display_name: "Control lot".into(),
                compatible_types: vec![OpenelisFieldType::Qc],
            })
            .unwrap();
        let lot = svc
            .create_field(NewField {
                analyzer_id: analyzer,
                field_name: "LOT1".into(),
                field_type: FieldType::Custom,
                unit: None,
                astm_ref: None,
                custom_type_id: Some(lot_type.id),
            })
            .unwrap();
        let lot_mapping = add_mapping(
            fx,
            lot.id,
            "qc.lot.2025-01",
            OpenelisFieldType::Qc,
            MappingType::Metadata,
            false,
        );
        svc.bulk_activate(analyzer, &[test, lot_mapping], false).unwrap();
        (analyzer, glucose)
    }

    fn segment(q: &str) -> QcSegmentData {
        astm::parse_q_segments(&format!("{HEADER}\r{q}\rL|1|N"))
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_extract_resolves_test_and_lot() {
        let fx = Fixture::new();
        let (analyzer, _) = qc_analyzer(&fx);
        let service = QcExtractionService::new(fx.dyn_store(), 5);

        let result = service
            .extract(
                &segment("Q|1|GLUCOSE^LOT1^N|105.5|mg/dL|20250127143000|N"),
                analyzer,
            )
            .unwrap();

        assert_eq!(result.test_id, "test.glucose");
        assert_eq!(result.control_lot_id, "qc.lot.2025-01");
        assert_eq!(result.control_level, QcLevel::Normal);
        assert_eq!(result.result_value, Decimal::from_str("105.5").unwrap());
        assert_eq!(result.unit, "mg/dL");
        assert_eq!(result.instrument_id.as_deref(), Some("TEST_ANALYZER"));
    }

    #[test]
    fn test_extract_applies_unit_conversion() {
        let fx = Fixture::new();
        let (analyzer, glucose) = qc_analyzer(&fx);
        fx.mappings()
            .create_unit_mapping(NewUnitMapping {
                analyzer_field_id: glucose,
                analyzer_unit: "mg/dL".into(),
                openelis_unit: "mmol/L".into(),
                conversion_factor: Some(Decimal::from_str("0.0555").unwrap()),
                reject_if_mismatch: false,
            })
            .unwrap();
        let service = QcExtractionService::new(fx.dyn_store(), 5);

        let result = service
            .extract(
                &segment("Q|1|GLUCOSE^LOT1^H|105.5|mg/dL|20250127143000|N"),
                analyzer,
            )
            .unwrap();
        assert_eq!(result.result_value.to_string(), "5.85525");
        assert_eq!(result.unit, "mmol/L");
        assert_eq!(result.control_level, QcLevel::High);

        let lower = service
            .extract(
                &segment("Q|2|GLUCOSE^LOT1^N|105.5|MG/DL|20250127143000|N"),
                analyzer,
            )
            .unwrap();
        assert_eq!(lower.unit, "mmol/L");
        assert_eq!(lower.result_value.to_string(), "5.85525");
    }

    #[test]
    fn test_missing_mappings_are_validation_errors() {
        let fx = Fixture::new();
        let (analyzer, _) = qc_analyzer(&fx);
        let service = QcExtractionService::new(fx.dyn_store(), 5);

        let unknown_test = service.extract(
            &segment("Q|1|SODIUM^LOT1^N|140|mmol/L|20250127143000|N"),
            analyzer,
        );
        assert!(matches!(unknown_test, Err(CoreError::Validation(m)) if m.contains("SODIUM")));

        let unknown_lot = service.extract(
            &segment("Q|1|GLUCOSE^LOT9^N|105|mg/dL|20250127143000|N"),
            analyzer,
        );
        assert!(matches!(unknown_lot, Err(CoreError::Validation(m)) if m.contains("LOT9")));
    }

    #[test]
    fn test_qualitative_value_is_rejected() {
        let fx = Fixture::new();
        let (analyzer, _) = qc_analyzer(&fx);
        let service = QcExtractionService::new(fx.dyn_store(), 5);
        let result = service.extract(
            &segment("Q|1|GLUCOSE^LOT1^N|POSITIVE|mg/dL|20250127143000|N"),
            analyzer,
        );
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_extract_message_is_all_or_nothing() {
        let fx = Fixture::new();
        let (analyzer, _) = qc_analyzer(&fx);
        let service = QcExtractionService::new(fx.dyn_store(), 5);
        let message = format!(
            "{HEADER}\rQ|1|GLUCOSE^LOT1^N|105|mg/dL|20250127143000|N\r\
             Q|2|SODIUM^LOT1^N|140|mmol/L|20250127143000|N\rL|1|N"
        );
        assert!(service.extract_message(analyzer, &message).is_err());
    }
}
