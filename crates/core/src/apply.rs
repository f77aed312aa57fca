//! Applies an analyzer's active mappings to the lines of one message.
//!
//! Result lines are rewritten in place: the instrument test code is replaced by the mapped
//! OpenELIS identifier, numeric values are unit-converted and qualitative values are translated
//! to OpenELIS codes. Anything without a mapping is reported, never dropped, so partially
//! configured analyzers keep delivering what they can.
//!
//! Both ASTM `R` records (`R|seq|^^^CODE|value|unit`) and HL7 `OBX` segments
//! (`OBX|seq|type|CODE^name||value|unit`) are recognised as result lines.

use crate::model::{
    AnalyzerField, FieldMapping, FieldType, MappingType, OpenelisFieldType, QualitativeMapping,
    UnitMapping,
};
use crate::rules::{parse_decimal, CustomTypeValidator};
use crate::store::AnalyzerStore;
use crate::CoreResult;
use astm::{Delimiters, Message, Record, RecordType};
use lis_uuid::EntityId;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::sync::Arc;

/// Multiply by `factor` and round half away from zero to `scale` places.
pub fn convert_value(value: Decimal, factor: Decimal, scale: u32) -> Decimal {
    (value * factor)
        .round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
}

/// One value translated through an active mapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MappedField {
    pub field_name: String,
    pub record_type: String,
    pub openelis_field_id: String,
    pub openelis_field_type: OpenelisFieldType,
    pub original_value: Option<String>,
    pub value: Option<String>,
    pub unit: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MappingResult {
    /// Translated lines, or the input unchanged when the analyzer has no active mappings.
    pub lines: Vec<String>,
    pub has_mappings: bool,
    pub mapped: Vec<MappedField>,
    /// Test codes (or `CODE=value` for untranslated qualitative values) without a mapping.
    pub unmapped_fields: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl MappingResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn note_unmapped(&mut self, name: String) {
        if !self.unmapped_fields.contains(&name) {
            self.unmapped_fields.push(name);
        }
    }
}

/// An active field with everything needed to translate its values.
#[derive(Clone, Debug)]
struct ActiveField {
    field: AnalyzerField,
    mappings: Vec<FieldMapping>,
    unit_mappings: Vec<UnitMapping>,
    qualitative: Vec<QualitativeMapping>,
}

impl ActiveField {
    fn matches_code(&self, code: &str) -> bool {
        self.field.field_name == code || self.field.astm_ref.as_deref() == Some(code)
    }

    /// Identifier substituted for the instrument test code.
    fn test_identifier(&self) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| {
                m.mapping_type == MappingType::TestLevel
                    || m.openelis_field_type == OpenelisFieldType::Test
            })
            .or(self.mappings.first())
            .map(|m| m.openelis_field_id.as_str())
    }
}

/// Active mappings of one analyzer, loaded once per message.
#[derive(Clone, Debug, Default)]
pub struct ActiveMappingSet {
    fields: Vec<ActiveField>,
}

impl ActiveMappingSet {
    pub fn load(store: &dyn AnalyzerStore, analyzer_id: EntityId) -> CoreResult<Self> {
        let mut fields: Vec<ActiveField> = Vec::new();
        for mapping in store
            .mappings_for_analyzer(analyzer_id)?
            .into_iter()
            .filter(|m| m.is_active)
        {
            if let Some(entry) = fields
                .iter_mut()
                .find(|f| f.field.id == mapping.analyzer_field_id)
            {
                entry.mappings.push(mapping);
                continue;
            }
            let Some(field) = store.field(mapping.analyzer_field_id)? else {
                tracing::warn!(
                    "mapping {} references missing field {}",
                    mapping.id,
                    mapping.analyzer_field_id
                );
                continue;
            };
            if !field.is_active {
                continue;
            }
            fields.push(ActiveField {
                unit_mappings: store.unit_mappings_for_field(field.id)?,
                qualitative: store.qualitative_mappings_for_field(field.id)?,
                field,
                mappings: vec![mapping],
            });
        }
        Ok(Self { fields })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn by_code(&self, code: &str) -> Option<&ActiveField> {
        self.fields.iter().find(|f| f.matches_code(code))
    }
}

/// Field positions of a result line.
struct ResultLayout {
    code_field: usize,
    code_component: usize,
    value_field: usize,
    unit_field: usize,
}

impl ResultLayout {
    fn of(record: &Record) -> Option<Self> {
        match record.record_type() {
            RecordType::Result => {
                let code_component = if record.component(2, 3).is_some() {
                    3
                } else {
                    record
                        .components(2)
                        .iter()
                        .position(|c| !c.trim().is_empty())?
                };
                Some(Self {
                    code_field: 2,
                    code_component,
                    value_field: 3,
                    unit_field: 4,
                })
            }
            RecordType::Other(token) if token == "OBX" => Some(Self {
                code_field: 3,
                code_component: 0,
                value_field: 5,
                unit_field: 6,
            }),
            _ => None,
        }
    }
}

pub struct MappingEngine {
    store: Arc<dyn AnalyzerStore>,
    custom_validator: Arc<dyn CustomTypeValidator>,
    conversion_scale: u32,
}

impl MappingEngine {
    pub fn new(
        store: Arc<dyn AnalyzerStore>,
        custom_validator: Arc<dyn CustomTypeValidator>,
        conversion_scale: u32,
    ) -> Self {
        Self {
            store,
            custom_validator,
            conversion_scale,
        }
    }

    pub fn has_active_mappings(&self, analyzer_id: EntityId) -> CoreResult<bool> {
        Ok(self
            .store
            .mappings_for_analyzer(analyzer_id)?
            .iter()
            .any(|m| m.is_active))
    }

    /// Translate `lines` through the analyzer's active mappings.
    ///
    /// Problems inside the message are reported in the result rather than raised. Only a store
    /// failure is returned as an error.
    pub fn apply<S: AsRef<str>>(
        &self,
        analyzer_id: EntityId,
        lines: &[S],
    ) -> CoreResult<MappingResult> {
        let mut result = MappingResult::default();
        if lines.iter().all(|l| l.as_ref().trim().is_empty()) {
            result.errors.push("message lines are empty".into());
            return Ok(result);
        }

        let active = ActiveMappingSet::load(self.store.as_ref(), analyzer_id)?;
        if active.is_empty() {
            result.lines = lines.iter().map(|l| l.as_ref().to_string()).collect();
            return Ok(result);
        }
        result.has_mappings = true;

        let message = Message::from_lines(lines);
        let delimiters = *message.delimiters();

        for record in message.records() {
            let line = match ResultLayout::of(record) {
                Some(layout) => self.translate_result(record, &layout, &delimiters, &active, &mut result)?,
                None => record.raw().to_string(),
            };
            collect_positional(record, &active, &mut result);
            result.lines.push(line);
        }

        Ok(result)
    }

    fn translate_result(
        &self,
        record: &Record,
        layout: &ResultLayout,
        delimiters: &Delimiters,
        active: &ActiveMappingSet,
        result: &mut MappingResult,
    ) -> CoreResult<String> {
        let Some(code) = record.component(layout.code_field, layout.code_component) else {
            result
                .warnings
                .push(format!("result line without test code: {}", record.raw()));
            return Ok(record.raw().to_string());
        };
        let Some(entry) = active.by_code(code) else {
            result.note_unmapped(code.to_string());
            return Ok(record.raw().to_string());
        };

        let original_value = record.field(layout.value_field).map(str::to_string);
        let original_unit = record.field(layout.unit_field).map(str::to_string);
        let (value, unit) = match &original_value {
            Some(value) => self.translate_value(entry, value, original_unit.as_deref(), result)?,
            None => (None, original_unit.clone()),
        };

        let mut fields: Vec<String> = record.fields().to_vec();
        let mut components: Vec<&str> = record.components(layout.code_field);
        if let Some(identifier) = entry.test_identifier() {
            components[layout.code_component] = identifier;
        }
        fields[layout.code_field] = components.join(&delimiters.component.to_string());
        if let Some(value) = &value {
            set_field(&mut fields, layout.value_field, value);
        }
        if let Some(unit) = &unit {
            set_field(&mut fields, layout.unit_field, unit);
        }

        for mapping in &entry.mappings {
            result.mapped.push(MappedField {
                field_name: entry.field.field_name.to_string(),
                record_type: record.record_type().token().to_string(),
                openelis_field_id: mapping.openelis_field_id.to_string(),
                openelis_field_type: mapping.openelis_field_type,
                original_value: original_value.clone(),
                value: value.clone().or_else(|| original_value.clone()),
                unit: unit.clone(),
            });
        }

        Ok(fields.join(&delimiters.field.to_string()))
    }

    /// Returns the translated value and unit. `None` for the value leaves it untouched.
    fn translate_value(
        &self,
        entry: &ActiveField,
        value: &str,
        unit: Option<&str>,
        result: &mut MappingResult,
    ) -> CoreResult<(Option<String>, Option<String>)> {
        let field = &entry.field;
        let unit_owned = unit.map(str::to_string);
        match field.field_type {
            FieldType::Numeric => {
                let reported_unit = unit.or(field.unit.as_ref().map(|u| u.as_str()));
                let Some(unit_mapping) = reported_unit.and_then(|u| {
                    entry
                        .unit_mappings
                        .iter()
                        .find(|m| m.analyzer_unit.eq_ignore_case(u))
                }) else {
                    if let (Some(reported), Some(expected)) = (unit, field.unit.as_ref()) {
                        if !expected.eq_ignore_case(reported) {
                            result.warnings.push(format!(
                                "{}: unit '{}' differs from configured '{}' and has no unit mapping",
                                field.field_name, reported, expected
                            ));
                        }
                    }
                    return Ok((None, unit_owned));
                };

                if !unit_mapping.units_differ() {
                    return Ok((None, Some(unit_mapping.openelis_unit.to_string())));
                }
                let Some(factor) = unit_mapping.conversion_factor else {
                    result.errors.push(format!(
                        "{}: unit '{}' rejected, expected '{}'",
                        field.field_name, unit_mapping.analyzer_unit, unit_mapping.openelis_unit
                    ));
                    return Ok((None, unit_owned));
                };
                let Some(number) = parse_decimal(value) else {
                    result.warnings.push(format!(
                        "{}: value '{}' is not numeric; unit conversion skipped",
                        field.field_name, value
                    ));
                    return Ok((None, unit_owned));
                };
                let converted = convert_value(number, factor, self.conversion_scale);
                Ok((
                    Some(converted.to_string()),
                    Some(unit_mapping.openelis_unit.to_string()),
                ))
            }
            FieldType::Qualitative => {
                let code = entry
                    .qualitative
                    .iter()
                    .find(|q| q.analyzer_value.eq_ignore_case(value))
                    .or_else(|| entry.qualitative.iter().find(|q| q.is_default));
                match code {
                    Some(q) => Ok((Some(q.openelis_code.to_string()), unit_owned)),
                    None => {
                        result.note_unmapped(format!("{}={}", field.field_name, value));
                        Ok((None, unit_owned))
                    }
                }
            }
            FieldType::Custom => {
                if let Some(type_id) = field.custom_type_id {
                    for failure in self.custom_validator.validate_value(type_id, value)? {
                        result
                            .warnings
                            .push(format!("{}: {}", field.field_name, failure));
                    }
                }
                Ok((None, unit_owned))
            }
            FieldType::Text => Ok((None, unit_owned)),
        }
    }
}

/// Report fields configured by position (`O|3`) that are present in `record`.
fn collect_positional(record: &Record, active: &ActiveMappingSet, result: &mut MappingResult) {
    for entry in &active.fields {
        let Some((record_token, index)) = entry.field.position() else {
            continue;
        };
        if record.record_type().token() != record_token {
            continue;
        }
        let Some(value) = record.field(index) else {
            continue;
        };
        for mapping in &entry.mappings {
            result.mapped.push(MappedField {
                field_name: entry.field.field_name.to_string(),
                record_type: record_token.to_string(),
                openelis_field_id: mapping.openelis_field_id.to_string(),
                openelis_field_type: mapping.openelis_field_type,
                original_value: Some(value.to_string()),
                value: Some(value.to_string()),
                unit: None,
            });
        }
    }
}

fn set_field(fields: &mut Vec<String>, index: usize, value: &str) {
    if fields.len() <= index {
        fields.resize(index + 1, String::new());
    }
    fields[index] = value.to_string();
}
