//! Field mapping configuration: analyzer fields, mappings, unit and qualitative translations,
//! custom field types, activation checks and copying between analyzers.
//!
//! This is the strict side of the engine. Every write is validated up front and committed in a
//! single store transaction, so a rejected call leaves no partial configuration behind.

use crate::constants::{CATEGORY_RESULT_VALUE, CATEGORY_SAMPLE_ID, CATEGORY_TEST_CODE};
use crate::events::{AnalyzerEvent, EventBus};
use crate::model::{
    Analyzer, AnalyzerField, AnalyzerStatus, CustomFieldType, ErrorStatus, FieldMapping,
    FieldType, MappingType, OpenelisFieldType, QualitativeMapping, RuleType, UnitMapping,
    ValidationRule,
};
use crate::rules::{CustomTypeValidator, RuleEngine};
use crate::store::{AnalyzerStore, AnalyzerStoreExt, StoreSnapshot};
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use lis_types::NonEmptyText;
use lis_uuid::EntityId;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Laboratory-system targets each field type may map to. CUSTOM is decided by a
/// [`CustomTypeValidator`] instead.
pub fn compatible_targets(field_type: FieldType) -> &'static [OpenelisFieldType] {
    use OpenelisFieldType::*;
    match field_type {
        FieldType::Numeric | FieldType::Qualitative => &[Test, Result],
        FieldType::Text => &[Sample, Test, Metadata],
        FieldType::Custom => &[],
    }
}

/// Check `mapping` against the compatibility table, or `validator` for CUSTOM fields.
///
/// # Errors
///
/// Returns [`CoreError::TypeIncompatibility`].
pub fn check_compatibility(
    validator: &dyn CustomTypeValidator,
    field: &AnalyzerField,
    mapping: &FieldMapping,
) -> CoreResult<()> {
    if field.field_type == FieldType::Custom {
        return validator.validate_mapping(field, mapping);
    }
    let allowed = compatible_targets(field.field_type);
    if allowed.contains(&mapping.openelis_field_type) {
        return Ok(());
    }
    Err(CoreError::TypeIncompatibility {
        field_type: field.field_type,
        openelis_type: mapping.openelis_field_type,
        detail: format!(
            "allowed targets are {}",
            allowed
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    })
}

// ============================================================================
// REQUESTS AND REPORTS
// ============================================================================

#[derive(Clone, Debug)]
pub struct NewField {
    pub analyzer_id: EntityId,
    pub field_name: String,
    pub field_type: FieldType,
    pub unit: Option<String>,
    pub astm_ref: Option<String>,
    pub custom_type_id: Option<EntityId>,
}

#[derive(Clone, Debug)]
pub struct NewMapping {
    pub analyzer_field_id: EntityId,
    pub openelis_field_id: String,
    pub openelis_field_type: OpenelisFieldType,
    pub mapping_type: MappingType,
    pub is_required: bool,
    pub sample_values: Vec<String>,
}

/// Partial update; `None` leaves a property unchanged.
#[derive(Clone, Debug, Default)]
pub struct MappingChanges {
    pub openelis_field_id: Option<String>,
    pub openelis_field_type: Option<OpenelisFieldType>,
    pub mapping_type: Option<MappingType>,
    pub is_required: Option<bool>,
    pub sample_values: Option<Vec<String>>,
}

/// Optimistic-lock token the caller read before editing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionToken {
    Version(u64),
    LastUpdated(DateTime<Utc>),
}

#[derive(Clone, Debug)]
pub struct NewUnitMapping {
    pub analyzer_field_id: EntityId,
    pub analyzer_unit: String,
    pub openelis_unit: String,
    pub conversion_factor: Option<Decimal>,
    pub reject_if_mismatch: bool,
}

#[derive(Clone, Debug)]
pub struct NewCustomType {
    pub type_name: String,
    pub display_name: String,
    pub compatible_types: Vec<OpenelisFieldType>,
}

#[derive(Clone, Debug)]
pub struct NewRule {
    pub custom_field_type_id: EntityId,
    pub rule_name: String,
    pub rule_type: RuleType,
    pub rule_expression: String,
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    pub can_activate: bool,
    pub missing: Vec<String>,
    pub warnings: Vec<String>,
    pub pending_error_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyOptions {
    /// Replace an existing target mapping with the source's configuration.
    pub overwrite_existing: bool,
    /// Skip fields whose type differs from the source field instead of attempting the copy.
    pub skip_incompatible: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            overwrite_existing: true,
            skip_incompatible: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    pub copied: usize,
    pub skipped: usize,
    pub warnings: Vec<String>,
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct FieldMappingService {
    store: Arc<dyn AnalyzerStore>,
    bus: Arc<EventBus>,
    custom_validator: Arc<dyn CustomTypeValidator>,
}

impl FieldMappingService {
    pub fn new(
        store: Arc<dyn AnalyzerStore>,
        bus: Arc<EventBus>,
        custom_validator: Arc<dyn CustomTypeValidator>,
    ) -> Self {
        Self {
            store,
            bus,
            custom_validator,
        }
    }

    /// Reject `mapping` if `field`'s type may not target its OpenELIS field type.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TypeIncompatibility`].
    pub fn check_compatibility(
        &self,
        field: &AnalyzerField,
        mapping: &FieldMapping,
    ) -> CoreResult<()> {
        check_compatibility(self.custom_validator.as_ref(), field, mapping)
    }

    // ------------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------------

    /// Register a field emitted by an analyzer.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] if the analyzer or custom type does not exist
    /// - [`CoreError::Validation`] if the unit invariant fails or the name is already used on
    ///   this analyzer
    pub fn create_field(&self, request: NewField) -> CoreResult<AnalyzerField> {
        self.store.require_analyzer(request.analyzer_id)?;
        if let Some(type_id) = request.custom_type_id {
            self.store.require_custom_type(type_id)?;
        }

        let field = AnalyzerField {
            id: EntityId::new(),
            analyzer_id: request.analyzer_id,
            field_name: NonEmptyText::new(&request.field_name)?,
            field_type: request.field_type,
            unit: NonEmptyText::optional(request.unit.as_deref().filter(|u| !u.trim().is_empty()))?,
            astm_ref: request.astm_ref.filter(|r| !r.trim().is_empty()),
            custom_type_id: request.custom_type_id,
            is_active: true,
        };
        field.validate()?;

        let stored = field.clone();
        self.store.atomically(move |tx| {
            let duplicate = tx
                .fields_for_analyzer(stored.analyzer_id)
                .any(|f| f.field_name.eq_ignore_case(stored.field_name.as_str()));
            if duplicate {
                return Err(CoreError::Validation(format!(
                    "field '{}' already exists on analyzer {}",
                    stored.field_name, stored.analyzer_id
                )));
            }
            tx.put_field(stored)
        })?;

        tracing::info!(
            "created {} field '{}' on analyzer {}",
            field.field_type,
            field.field_name,
            field.analyzer_id
        );
        Ok(field)
    }

    // ------------------------------------------------------------------------
    // Mappings
    // ------------------------------------------------------------------------

    /// Create a draft mapping. Drafts are inactive until explicitly activated.
    ///
    /// Publishes [`AnalyzerEvent::MappingCreated`] when this is the analyzer's first mapping.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TypeIncompatibility`] if the field type may not target the requested
    /// OpenELIS field type. Nothing is written in that case.
    pub fn create_mapping(&self, request: NewMapping) -> CoreResult<FieldMapping> {
        let field = self.store.require_field(request.analyzer_field_id)?;
        let mapping = FieldMapping {
            id: EntityId::new(),
            analyzer_id: field.analyzer_id,
            analyzer_field_id: field.id,
            openelis_field_id: NonEmptyText::new(&request.openelis_field_id)?,
            openelis_field_type: request.openelis_field_type,
            mapping_type: request.mapping_type,
            is_required: request.is_required,
            is_active: false,
            sample_values: request.sample_values,
            version: 0,
            last_updated: Utc::now(),
            retired_at: None,
            retirement_reason: None,
        };
        self.check_compatibility(&field, &mapping)?;

        let mut is_first = false;
        let stored = mapping.clone();
        self.store.atomically(|tx| {
            is_first = tx.mappings_for_analyzer(stored.analyzer_id).next().is_none();
            insert_mapping(tx, stored)
        })?;

        tracing::info!(
            "created draft mapping {} ({} -> {} {})",
            mapping.id,
            field.field_name,
            mapping.openelis_field_type,
            mapping.openelis_field_id
        );
        if is_first {
            self.bus.publish(&AnalyzerEvent::MappingCreated {
                analyzer_id: mapping.analyzer_id,
            });
        }
        Ok(mapping)
    }

    /// Change a mapping's target or flags.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ConfirmationRequired`] when editing an active mapping on an ACTIVE analyzer
    ///   without `confirmed`
    /// - [`CoreError::TypeIncompatibility`] if the changed target is not allowed
    /// - [`CoreError::ConcurrentModification`] if `expected` no longer matches the stored mapping
    pub fn update_mapping(
        &self,
        mapping_id: EntityId,
        changes: MappingChanges,
        expected: Option<VersionToken>,
        confirmed: bool,
    ) -> CoreResult<FieldMapping> {
        let current = self.store.require_mapping(mapping_id)?;
        let analyzer = self.store.require_analyzer(current.analyzer_id)?;
        guard_live_feed(&analyzer, &current, current.is_active, confirmed)?;

        let mut updated = current.clone();
        if let Some(id) = changes.openelis_field_id {
            updated.openelis_field_id = NonEmptyText::new(id)?;
        }
        if let Some(kind) = changes.openelis_field_type {
            updated.openelis_field_type = kind;
        }
        if let Some(kind) = changes.mapping_type {
            updated.mapping_type = kind;
        }
        if let Some(required) = changes.is_required {
            updated.is_required = required;
        }
        if let Some(samples) = changes.sample_values {
            updated.sample_values = samples;
        }

        let field = self.store.require_field(updated.analyzer_field_id)?;
        self.check_compatibility(&field, &updated)?;

        let updated = self.commit_versioned(updated, expected)?;
        tracing::info!("updated mapping {} (version {})", updated.id, updated.version);
        Ok(updated)
    }

    /// Activate a single mapping.
    ///
    /// Publishes [`AnalyzerEvent::AllMappingsActivated`] when the analyzer's configuration then
    /// passes [`Self::validate_activation`].
    ///
    /// # Errors
    ///
    /// - [`CoreError::ConcurrentModification`] if `expected` no longer matches at commit time
    /// - [`CoreError::ConfirmationRequired`] if the analyzer is ACTIVE and `confirmed` is false
    /// - [`CoreError::TypeIncompatibility`] if the mapping no longer passes the type check
    pub fn activate_mapping(
        &self,
        mapping_id: EntityId,
        expected: Option<VersionToken>,
        confirmed: bool,
    ) -> CoreResult<FieldMapping> {
        let current = self.store.require_mapping(mapping_id)?;
        let analyzer = self.store.require_analyzer(current.analyzer_id)?;
        guard_live_feed(&analyzer, &current, true, confirmed)?;

        let field = self.store.require_field(current.analyzer_field_id)?;
        self.check_compatibility(&field, &current)?;

        let mut updated = current;
        updated.is_active = true;
        updated.retired_at = None;
        updated.retirement_reason = None;
        let updated = self.commit_versioned(updated, expected)?;

        tracing::info!("activated mapping {} on analyzer {}", updated.id, analyzer.id);
        self.announce_if_complete(analyzer.id)?;
        Ok(updated)
    }

    /// Activate several mappings of one analyzer in a single commit.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] if any mapping belongs to a different analyzer; nothing is
    /// activated in that case.
    pub fn bulk_activate(
        &self,
        analyzer_id: EntityId,
        mapping_ids: &[EntityId],
        confirmed: bool,
    ) -> CoreResult<Vec<FieldMapping>> {
        let analyzer = self.store.require_analyzer(analyzer_id)?;

        let mut activated = Vec::with_capacity(mapping_ids.len());
        for id in mapping_ids {
            let mut mapping = self.store.require_mapping(*id)?;
            if mapping.analyzer_id != analyzer_id {
                return Err(CoreError::Validation(format!(
                    "mapping {id} does not belong to analyzer {analyzer_id}"
                )));
            }
            guard_live_feed(&analyzer, &mapping, true, confirmed)?;
            let field = self.store.require_field(mapping.analyzer_field_id)?;
            self.check_compatibility(&field, &mapping)?;

            mapping.is_active = true;
            mapping.retired_at = None;
            mapping.retirement_reason = None;
            mapping.touch(Utc::now());
            activated.push(mapping);
        }

        let batch = activated.clone();
        self.store.atomically(move |tx| {
            batch.into_iter().try_for_each(|m| tx.put_mapping(m))
        })?;

        tracing::info!(
            "activated {} mapping(s) on analyzer {}",
            activated.len(),
            analyzer_id
        );
        self.announce_if_complete(analyzer_id)?;
        Ok(activated)
    }

    /// Retire a mapping, keeping it for audit.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Validation`] for required mappings
    /// - [`CoreError::DisableBlocked`] while the analyzer has unacknowledged errors
    pub fn disable_mapping(&self, mapping_id: EntityId, reason: &str) -> CoreResult<FieldMapping> {
        let mut mapping = self.store.require_mapping(mapping_id)?;
        if mapping.is_required {
            return Err(CoreError::Validation(
                "required mappings (Sample ID, Test Code, Result Value) must remain active".into(),
            ));
        }

        let pending = self.pending_errors(mapping.analyzer_id)?;
        if pending > 0 {
            return Err(CoreError::DisableBlocked { pending });
        }

        let now = Utc::now();
        mapping.is_active = false;
        mapping.retired_at = Some(now);
        mapping.retirement_reason = NonEmptyText::optional(Some(reason).filter(|r| !r.trim().is_empty()))?;
        mapping.touch(now);

        let stored = mapping.clone();
        self.store.atomically(move |tx| tx.put_mapping(stored))?;
        tracing::info!("retired mapping {} ({})", mapping.id, reason);
        Ok(mapping)
    }

    // ------------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------------

    /// Check whether an analyzer's active mappings cover every required category.
    ///
    /// Unacknowledged errors and type-incompatible mappings produce warnings but never block.
    pub fn validate_activation(&self, analyzer_id: EntityId) -> CoreResult<ActivationReport> {
        self.store.require_analyzer(analyzer_id)?;

        let mut warnings = Vec::new();
        let mut usable = Vec::new();
        for mapping in self
            .store
            .mappings_for_analyzer(analyzer_id)?
            .into_iter()
            .filter(|m| m.is_active)
        {
            let field = self.store.require_field(mapping.analyzer_field_id)?;
            match self.check_compatibility(&field, &mapping) {
                Ok(()) => usable.push(mapping),
                Err(e) => warnings.push(format!("Type incompatibility detected in mapping: {e}")),
            }
        }

        let required = |pred: &dyn Fn(&FieldMapping) -> bool| {
            usable.iter().any(|m| m.is_required && pred(m))
        };
        let mut missing = Vec::new();
        if !required(&|m| m.openelis_field_type == OpenelisFieldType::Sample) {
            missing.push(CATEGORY_SAMPLE_ID.to_string());
        }
        if !required(&|m| m.mapping_type == MappingType::TestLevel) {
            missing.push(CATEGORY_TEST_CODE.to_string());
        }
        if !required(&|m| m.mapping_type == MappingType::ResultLevel) {
            missing.push(CATEGORY_RESULT_VALUE.to_string());
        }

        let pending_error_count = self.pending_errors(analyzer_id)?;
        if pending_error_count > 0 {
            warnings.insert(
                0,
                format!(
                    "This analyzer has {pending_error_count} pending messages in the error queue. \
                     Activating mapping changes may affect how these messages are reprocessed."
                ),
            );
        }

        Ok(ActivationReport {
            can_activate: missing.is_empty(),
            missing,
            warnings,
            pending_error_count,
        })
    }

    /// Activate an analyzer's whole configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ActivationBlocked`] listing the missing categories.
    pub fn activate_configuration(&self, analyzer_id: EntityId) -> CoreResult<ActivationReport> {
        let report = self.validate_activation(analyzer_id)?;
        if !report.can_activate {
            return Err(CoreError::ActivationBlocked {
                missing: report.missing,
            });
        }
        self.bus
            .publish(&AnalyzerEvent::AllMappingsActivated { analyzer_id });
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Unit and qualitative mappings
    // ------------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] if the field is not NUMERIC, the factor is missing or
    /// zero, or the analyzer unit is already mapped for this field.
    pub fn create_unit_mapping(&self, request: NewUnitMapping) -> CoreResult<UnitMapping> {
        let field = self.store.require_field(request.analyzer_field_id)?;
        let unit_mapping = UnitMapping {
            id: EntityId::new(),
            analyzer_field_id: field.id,
            analyzer_unit: NonEmptyText::new(&request.analyzer_unit)?,
            openelis_unit: NonEmptyText::new(&request.openelis_unit)?,
            conversion_factor: request.conversion_factor,
            reject_if_mismatch: request.reject_if_mismatch,
        };

        let stored = unit_mapping.clone();
        self.store
            .atomically(move |tx| insert_unit_mapping(tx, stored))?;
        Ok(unit_mapping)
    }

    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] if the field is not QUALITATIVE, the value is already
    /// mapped (case-insensitive), or a second default is requested.
    pub fn create_qualitative_mapping(
        &self,
        analyzer_field_id: EntityId,
        analyzer_value: &str,
        openelis_code: &str,
        is_default: bool,
    ) -> CoreResult<QualitativeMapping> {
        self.store.require_field(analyzer_field_id)?;
        let mapping = QualitativeMapping {
            id: EntityId::new(),
            analyzer_field_id,
            analyzer_value: NonEmptyText::new(analyzer_value)?,
            openelis_code: NonEmptyText::new(openelis_code)?,
            is_default,
        };
        let stored = mapping.clone();
        self.store
            .atomically(move |tx| insert_qualitative(tx, stored))?;
        Ok(mapping)
    }

    // ------------------------------------------------------------------------
    // Custom field types
    // ------------------------------------------------------------------------

    pub fn create_custom_type(&self, request: NewCustomType) -> CoreResult<CustomFieldType> {
        let custom_type = CustomFieldType {
            id: EntityId::new(),
            type_name: NonEmptyText::new(&request.type_name)?,
            display_name: NonEmptyText::new(&request.display_name)?,
            compatible_types: request.compatible_types,
            is_active: true,
        };
        let stored = custom_type.clone();
        self.store.atomically(move |tx| {
            if tx.custom_type_named(stored.type_name.as_str()).is_some() {
                return Err(CoreError::Validation(format!(
                    "custom field type '{}' already exists",
                    stored.type_name
                )));
            }
            tx.put_custom_type(stored)
        })?;
        Ok(custom_type)
    }

    /// # Errors
    ///
    /// Returns [`CoreError::RuleExpression`] if the expression is malformed for its rule type.
    pub fn create_rule(&self, request: NewRule) -> CoreResult<ValidationRule> {
        self.store.require_custom_type(request.custom_field_type_id)?;
        RuleEngine::check_expression(request.rule_type, &request.rule_expression)?;

        let rule = ValidationRule {
            id: EntityId::new(),
            custom_field_type_id: request.custom_field_type_id,
            rule_name: NonEmptyText::new(&request.rule_name)?,
            rule_type: request.rule_type,
            rule_expression: request.rule_expression,
            error_message: request.error_message,
            is_active: true,
        };
        let stored = rule.clone();
        self.store.atomically(move |tx| tx.put_rule(stored))?;
        Ok(rule)
    }

    // ------------------------------------------------------------------------
    // Copy
    // ------------------------------------------------------------------------

    /// Copy every active mapping of `source` onto same-named fields of `target`.
    ///
    /// A source mapping overwrites the target's pre-existing mapping of that field onto the same
    /// OpenELIS field type, if there is one; otherwise it is created. A field with several source
    /// mappings therefore keeps all of them.
    ///
    /// Qualitative mappings onto the same OpenELIS field have their value sets merged rather than
    /// replaced. The whole copy is one transaction.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Validation`] if the source has no active mappings
    /// - [`CoreError::TypeIncompatibility`] if `skip_incompatible` is off and a copied mapping
    ///   would break the compatibility table
    pub fn copy_mappings(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        options: CopyOptions,
    ) -> CoreResult<CopyReport> {
        self.store.require_analyzer(source_id)?;
        self.store.require_analyzer(target_id)?;

        let source_mappings: Vec<FieldMapping> = self
            .store
            .mappings_for_analyzer(source_id)?
            .into_iter()
            .filter(|m| m.is_active)
            .collect();
        if source_mappings.is_empty() {
            return Err(CoreError::Validation(
                "source analyzer has no active mappings to copy".into(),
            ));
        }

        let target_fields = self.store.fields_for_analyzer(target_id)?;
        let pre_existing: Vec<FieldMapping> = self.store.mappings_for_analyzer(target_id)?;
        let target_had_mappings = !pre_existing.is_empty();
        let mut claimed: HashSet<EntityId> = HashSet::new();
        let now = Utc::now();

        let mut report = CopyReport::default();
        let mut planned: Vec<FieldMapping> = Vec::new();
        let mut value_sets: Vec<(EntityId, Vec<QualitativeMapping>)> = Vec::new();

        for source in source_mappings {
            let source_field = self.store.require_field(source.analyzer_field_id)?;
            let name = source_field.field_name.as_str();

            let Some(target_field) = target_fields.iter().find(|f| f.field_name.eq_ignore_case(name))
            else {
                report.skipped += 1;
                report
                    .warnings
                    .push(format!("Skipped mapping for field '{name}': field not found in target analyzer"));
                continue;
            };

            if source_field.field_type != target_field.field_type {
                if options.skip_incompatible {
                    report.skipped += 1;
                    report.warnings.push(format!(
                        "Skipped mapping for field '{name}': type incompatibility (source: {}, target: {})",
                        source_field.field_type, target_field.field_type
                    ));
                    continue;
                }
                report.warnings.push(format!(
                    "Type incompatibility for field '{name}': source type {} vs target type {}",
                    source_field.field_type, target_field.field_type
                ));
            }

            let existing = find_existing(&pre_existing, &claimed, target_field.id, &source);
            if let Some(existing) = &existing {
                claimed.insert(existing.id);
            }

            let both_qualitative = source_field.field_type == FieldType::Qualitative
                && target_field.field_type == FieldType::Qualitative;

            let candidate = match existing {
                Some(existing)
                    if both_qualitative && existing.openelis_field_id == source.openelis_field_id =>
                {
                    value_sets.push((
                        target_field.id,
                        self.store.qualitative_mappings_for_field(source_field.id)?,
                    ));
                    report.copied += 1;
                    continue;
                }
                Some(_) if !options.overwrite_existing => {
                    report.skipped += 1;
                    report.warnings.push(format!(
                        "Skipped mapping for field '{name}': existing mapping found and overwrite disabled"
                    ));
                    continue;
                }
                Some(mut existing) => {
                    existing.openelis_field_id = source.openelis_field_id.clone();
                    existing.openelis_field_type = source.openelis_field_type;
                    existing.mapping_type = source.mapping_type;
                    existing.is_required = source.is_required;
                    existing.is_active = source.is_active;
                    existing.sample_values = source.sample_values.clone();
                    existing.touch(now);
                    existing
                }
                None => FieldMapping {
                    id: EntityId::new(),
                    analyzer_id: target_id,
                    analyzer_field_id: target_field.id,
                    version: 0,
                    last_updated: now,
                    retired_at: None,
                    retirement_reason: None,
                    ..source.clone()
                },
            };

            self.check_compatibility(target_field, &candidate)?;
            if both_qualitative {
                value_sets.push((
                    target_field.id,
                    self.store.qualitative_mappings_for_field(source_field.id)?,
                ));
            }
            planned.push(candidate);
            report.copied += 1;
        }

        let created_any = !planned.is_empty();
        self.store.atomically(move |tx| {
            for mapping in planned {
                insert_mapping(tx, mapping)?;
            }
            for (target_field_id, values) in value_sets {
                merge_value_set(tx, target_field_id, values)?;
            }
            Ok(())
        })?;

        tracing::info!(
            "copied {} mapping(s) from analyzer {} to {} ({} skipped)",
            report.copied,
            source_id,
            target_id,
            report.skipped
        );
        if created_any && !target_had_mappings {
            self.bus.publish(&AnalyzerEvent::MappingCreated {
                analyzer_id: target_id,
            });
        }
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn pending_errors(&self, analyzer_id: EntityId) -> CoreResult<usize> {
        Ok(self
            .store
            .errors()?
            .iter()
            .filter(|e| e.analyzer_id == analyzer_id && e.status == ErrorStatus::Unacknowledged)
            .count())
    }

    fn announce_if_complete(&self, analyzer_id: EntityId) -> CoreResult<()> {
        if self.validate_activation(analyzer_id)?.can_activate {
            self.bus
                .publish(&AnalyzerEvent::AllMappingsActivated { analyzer_id });
        }
        Ok(())
    }

    /// Commit `updated`, checking the optimistic-lock token against the stored copy inside the
    /// transaction.
    fn commit_versioned(
        &self,
        mut updated: FieldMapping,
        expected: Option<VersionToken>,
    ) -> CoreResult<FieldMapping> {
        updated.touch(Utc::now());
        let stored = updated.clone();
        self.store.atomically(move |tx| {
            let current = tx
                .mapping(stored.id)
                .ok_or_else(|| CoreError::not_found("field mapping", stored.id))?;
            check_version(current, expected)?;
            let mut stored = stored;
            stored.version = current.version + 1;
            tx.put_mapping(stored)
        })?;
        self.store.require_mapping(updated.id)
    }
}

/// The target mapping a copied `source` mapping lands on: a live, not yet claimed mapping of
/// `target_field_id` onto the same OpenELIS field type, preferring one with the same target id.
/// Only mappings that existed before the copy are considered.
fn find_existing(
    pre_existing: &[FieldMapping],
    claimed: &HashSet<EntityId>,
    target_field_id: EntityId,
    source: &FieldMapping,
) -> Option<FieldMapping> {
    let same_slot: Vec<&FieldMapping> = pre_existing
        .iter()
        .filter(|m| {
            m.analyzer_field_id == target_field_id
                && m.openelis_field_type == source.openelis_field_type
                && m.retired_at.is_none()
                && !claimed.contains(&m.id)
        })
        .collect();
    same_slot
        .iter()
        .find(|m| m.openelis_field_id == source.openelis_field_id)
        .or(same_slot.first())
        .map(|m| (*m).clone())
}

fn guard_live_feed(
    analyzer: &Analyzer,
    mapping: &FieldMapping,
    affects_live: bool,
    confirmed: bool,
) -> CoreResult<()> {
    if analyzer.status == AnalyzerStatus::Active && affects_live && !confirmed {
        return Err(CoreError::ConfirmationRequired(format!(
            "analyzer '{}' is ACTIVE; changing mapping {} requires confirmation",
            analyzer.name, mapping.id
        )));
    }
    Ok(())
}

fn check_version(current: &FieldMapping, expected: Option<VersionToken>) -> CoreResult<()> {
    match expected {
        Some(VersionToken::Version(v)) if v != current.version => {
            Err(CoreError::ConcurrentModification {
                expected: format!("version {v}"),
                actual: format!("version {}", current.version),
            })
        }
        Some(VersionToken::LastUpdated(t)) if current.last_updated > t => {
            Err(CoreError::ConcurrentModification {
                expected: format!("last updated {}", t.to_rfc3339()),
                actual: format!("last updated {}", current.last_updated.to_rfc3339()),
            })
        }
        _ => Ok(()),
    }
}

/// Write a new mapping unless the field already has a live mapping onto the same target.
pub(crate) fn insert_mapping(tx: &mut StoreSnapshot, mapping: FieldMapping) -> CoreResult<()> {
    let duplicate = tx.mappings_for_analyzer(mapping.analyzer_id).any(|m| {
        m.id != mapping.id
            && m.analyzer_field_id == mapping.analyzer_field_id
            && m.openelis_field_id == mapping.openelis_field_id
            && m.openelis_field_type == mapping.openelis_field_type
            && m.retired_at.is_none()
    });
    if duplicate {
        let field_name = tx
            .field(mapping.analyzer_field_id)
            .map(|f| f.field_name.to_string())
            .unwrap_or_else(|| mapping.analyzer_field_id.to_string());
        return Err(CoreError::Validation(format!(
            "field '{}' is already mapped to {} {}",
            field_name, mapping.openelis_field_type, mapping.openelis_field_id
        )));
    }
    tx.put_mapping(mapping)
}

/// Write a unit mapping for a NUMERIC field. Analyzer units are unique per field, ignoring case.
pub(crate) fn insert_unit_mapping(tx: &mut StoreSnapshot, unit_mapping: UnitMapping) -> CoreResult<()> {
    if let Some(field) = tx.field(unit_mapping.analyzer_field_id) {
        if field.field_type != FieldType::Numeric {
            return Err(CoreError::Validation(format!(
                "unit mappings apply to NUMERIC fields only ('{}' is {})",
                field.field_name, field.field_type
            )));
        }
    }
    unit_mapping.validate()?;

    let duplicate = tx
        .unit_mappings_for_field(unit_mapping.analyzer_field_id)
        .any(|u| u.id != unit_mapping.id && u.analyzer_unit.eq_ignore_case(unit_mapping.analyzer_unit.as_str()));
    if duplicate {
        return Err(CoreError::Validation(format!(
            "unit '{}' is already mapped for this field",
            unit_mapping.analyzer_unit
        )));
    }
    tx.put_unit_mapping(unit_mapping)
}

/// Write a qualitative value for a QUALITATIVE field. Values are unique per field ignoring
/// case, and at most one of them is the default.
pub(crate) fn insert_qualitative(
    tx: &mut StoreSnapshot,
    mapping: QualitativeMapping,
) -> CoreResult<()> {
    if let Some(field) = tx.field(mapping.analyzer_field_id) {
        if field.field_type != FieldType::Qualitative {
            return Err(CoreError::Validation(format!(
                "qualitative mappings apply to QUALITATIVE fields only ('{}' is {})",
                field.field_name, field.field_type
            )));
        }
    }

    let value = mapping.analyzer_value.as_str();
    if tx
        .qualitative_mappings_for_field(mapping.analyzer_field_id)
        .any(|q| q.id != mapping.id && q.analyzer_value.eq_ignore_case(value))
    {
        return Err(CoreError::Validation(format!(
            "analyzer value '{}' is already mapped for this field",
            mapping.analyzer_value
        )));
    }
    if mapping.is_default
        && tx
            .qualitative_mappings_for_field(mapping.analyzer_field_id)
            .any(|q| q.id != mapping.id && q.is_default)
    {
        return Err(CoreError::Validation(
            "field already has a default qualitative mapping".into(),
        ));
    }
    tx.put_qualitative_mapping(mapping)
}

/// Union `values` into the target field's qualitative value set, skipping values already present.
fn merge_value_set(
    tx: &mut StoreSnapshot,
    target_field_id: EntityId,
    values: Vec<QualitativeMapping>,
) -> CoreResult<()> {
    let has_default = tx
        .qualitative_mappings_for_field(target_field_id)
        .any(|q| q.is_default);
    for value in values {
        let present = tx
            .qualitative_mappings_for_field(target_field_id)
            .any(|q| q.analyzer_value.eq_ignore_case(value.analyzer_value.as_str()));
        if present {
            continue;
        }
        tx.put_qualitative_mapping(QualitativeMapping {
            id: EntityId::new(),
            analyzer_field_id: target_field_id,
            is_default: value.is_default && !has_default,
            ..value
        })?;
    }
    Ok(())
}
