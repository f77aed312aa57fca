//! Persistence collaborator for analyzer configuration and the error queue.
//!
//! The engine never talks to a database directly. Services depend on the [`AnalyzerStore`]
//! trait, which offers plain reads, an all-or-nothing [`AnalyzerStore::transaction`] for writes,
//! and a compare-and-set primitive for analyzer status.
//!
//! [`InMemoryStore`] is the bundled implementation. It keeps every entity in insertion order,
//! which the router relies on for its tie-break rule.

use crate::model::{
    Analyzer, AnalyzerError, AnalyzerField, AnalyzerStatus, AnalyzerType, CustomFieldType,
    FieldMapping, QualitativeMapping, UnitMapping, ValidationRule,
};
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use lis_uuid::EntityId;
use std::sync::{Arc, RwLock};

/// Work applied inside a store transaction.
pub type TransactionFn<'a> = Box<dyn FnOnce(&mut StoreSnapshot) -> CoreResult<()> + 'a>;

/// Storage operations required by the engine.
///
/// Reads return owned values so callers never hold a lock across service calls.
pub trait AnalyzerStore: Send + Sync {
    fn analyzer(&self, id: EntityId) -> CoreResult<Option<Analyzer>>;
    fn analyzers(&self) -> CoreResult<Vec<Analyzer>>;
    fn analyzer_type(&self, id: EntityId) -> CoreResult<Option<AnalyzerType>>;
    fn field(&self, id: EntityId) -> CoreResult<Option<AnalyzerField>>;
    fn fields_for_analyzer(&self, analyzer_id: EntityId) -> CoreResult<Vec<AnalyzerField>>;
    fn mapping(&self, id: EntityId) -> CoreResult<Option<FieldMapping>>;
    fn mappings_for_analyzer(&self, analyzer_id: EntityId) -> CoreResult<Vec<FieldMapping>>;
    fn unit_mappings_for_field(&self, field_id: EntityId) -> CoreResult<Vec<UnitMapping>>;
    fn qualitative_mappings_for_field(
        &self,
        field_id: EntityId,
    ) -> CoreResult<Vec<QualitativeMapping>>;
    fn custom_type(&self, id: EntityId) -> CoreResult<Option<CustomFieldType>>;
    fn rules_for_custom_type(&self, custom_type_id: EntityId) -> CoreResult<Vec<ValidationRule>>;
    fn error(&self, id: EntityId) -> CoreResult<Option<AnalyzerError>>;
    fn errors(&self) -> CoreResult<Vec<AnalyzerError>>;

    /// Apply `work` atomically.
    ///
    /// # Errors
    ///
    /// Returns whatever `work` returns, in which case nothing is written, or
    /// [`CoreError::Persistence`] if the store itself fails.
    fn transaction(&self, work: TransactionFn<'_>) -> CoreResult<()>;

    /// Set an analyzer's status only if it still equals `expected`.
    ///
    /// `last_activated`, when given, is stamped in the same write.
    ///
    /// # Returns
    ///
    /// `false` if the stored status no longer matches `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the analyzer does not exist.
    fn compare_and_set_status(
        &self,
        analyzer_id: EntityId,
        expected: AnalyzerStatus,
        new: AnalyzerStatus,
        last_activated: Option<DateTime<Utc>>,
    ) -> CoreResult<bool>;
}

/// Lookups that turn a missing entity into [`CoreError::NotFound`].
pub trait AnalyzerStoreExt: AnalyzerStore {
    fn require_analyzer(&self, id: EntityId) -> CoreResult<Analyzer> {
        self.analyzer(id)?
            .ok_or_else(|| CoreError::not_found("analyzer", id))
    }

    fn require_field(&self, id: EntityId) -> CoreResult<AnalyzerField> {
        self.field(id)?
            .ok_or_else(|| CoreError::not_found("analyzer field", id))
    }

    fn require_mapping(&self, id: EntityId) -> CoreResult<FieldMapping> {
        self.mapping(id)?
            .ok_or_else(|| CoreError::not_found("field mapping", id))
    }

    fn require_custom_type(&self, id: EntityId) -> CoreResult<CustomFieldType> {
        self.custom_type(id)?
            .ok_or_else(|| CoreError::not_found("custom field type", id))
    }

    fn require_error(&self, id: EntityId) -> CoreResult<AnalyzerError> {
        self.error(id)?
            .ok_or_else(|| CoreError::not_found("analyzer error", id))
    }

    /// Run a closure as a transaction without boxing at the call site.
    fn atomically<'a, F>(&self, work: F) -> CoreResult<()>
    where
        F: FnOnce(&mut StoreSnapshot) -> CoreResult<()> + 'a,
    {
        self.transaction(Box::new(work))
    }
}

impl<S: AnalyzerStore + ?Sized> AnalyzerStoreExt for S {}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Complete store contents. Transactions mutate a copy and commit it as a whole.
///
/// Every `put_*` upserts by id and checks that referenced entities exist in the snapshot.
#[derive(Clone, Debug, Default)]
pub struct StoreSnapshot {
    analyzer_types: Vec<AnalyzerType>,
    analyzers: Vec<Analyzer>,
    fields: Vec<AnalyzerField>,
    mappings: Vec<FieldMapping>,
    unit_mappings: Vec<UnitMapping>,
    qualitative_mappings: Vec<QualitativeMapping>,
    custom_types: Vec<CustomFieldType>,
    rules: Vec<ValidationRule>,
    /// Shared between a transaction's draft and the committed state until an error is written,
    /// so transactions that leave the queue alone do not copy it.
    errors: Arc<Vec<AnalyzerError>>,
}

fn upsert<T>(items: &mut Vec<T>, item: T, id_of: impl Fn(&T) -> EntityId) {
    let id = id_of(&item);
    match items.iter_mut().find(|existing| id_of(existing) == id) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

impl StoreSnapshot {
    pub fn analyzer(&self, id: EntityId) -> Option<&Analyzer> {
        self.analyzers.iter().find(|a| a.id == id)
    }

    pub fn analyzers(&self) -> &[Analyzer] {
        &self.analyzers
    }

    pub fn analyzer_type(&self, id: EntityId) -> Option<&AnalyzerType> {
        self.analyzer_types.iter().find(|t| t.id == id)
    }

    pub fn field(&self, id: EntityId) -> Option<&AnalyzerField> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn fields_for_analyzer(&self, analyzer_id: EntityId) -> impl Iterator<Item = &AnalyzerField> {
        self.fields.iter().filter(move |f| f.analyzer_id == analyzer_id)
    }

    pub fn mapping(&self, id: EntityId) -> Option<&FieldMapping> {
        self.mappings.iter().find(|m| m.id == id)
    }

    pub fn mappings_for_analyzer(
        &self,
        analyzer_id: EntityId,
    ) -> impl Iterator<Item = &FieldMapping> {
        self.mappings
            .iter()
            .filter(move |m| m.analyzer_id == analyzer_id)
    }

    pub fn unit_mappings_for_field(&self, field_id: EntityId) -> impl Iterator<Item = &UnitMapping> {
        self.unit_mappings
            .iter()
            .filter(move |u| u.analyzer_field_id == field_id)
    }

    pub fn qualitative_mappings_for_field(
        &self,
        field_id: EntityId,
    ) -> impl Iterator<Item = &QualitativeMapping> {
        self.qualitative_mappings
            .iter()
            .filter(move |q| q.analyzer_field_id == field_id)
    }

    pub fn custom_type(&self, id: EntityId) -> Option<&CustomFieldType> {
        self.custom_types.iter().find(|t| t.id == id)
    }

    pub fn custom_type_named(&self, type_name: &str) -> Option<&CustomFieldType> {
        self.custom_types
            .iter()
            .find(|t| t.type_name.eq_ignore_case(type_name))
    }

    pub fn rules_for_custom_type(&self, id: EntityId) -> impl Iterator<Item = &ValidationRule> {
        self.rules
            .iter()
            .filter(move |r| r.custom_field_type_id == id)
    }

    pub fn error(&self, id: EntityId) -> Option<&AnalyzerError> {
        self.errors.iter().find(|e| e.id == id)
    }

    pub fn errors(&self) -> &[AnalyzerError] {
        self.errors.as_slice()
    }

    pub fn put_analyzer_type(&mut self, analyzer_type: AnalyzerType) -> CoreResult<()> {
        upsert(&mut self.analyzer_types, analyzer_type, |t| t.id);
        Ok(())
    }

    pub fn put_analyzer(&mut self, analyzer: Analyzer) -> CoreResult<()> {
        if let Some(type_id) = analyzer.analyzer_type_id {
            self.check_exists(self.analyzer_type(type_id).is_some(), "analyzer type", type_id)?;
        }
        upsert(&mut self.analyzers, analyzer, |a| a.id);
        Ok(())
    }

    pub fn put_field(&mut self, field: AnalyzerField) -> CoreResult<()> {
        self.check_exists(self.analyzer(field.analyzer_id).is_some(), "analyzer", field.analyzer_id)?;
        if let Some(type_id) = field.custom_type_id {
            self.check_exists(self.custom_type(type_id).is_some(), "custom field type", type_id)?;
        }
        upsert(&mut self.fields, field, |f| f.id);
        Ok(())
    }

    pub fn put_mapping(&mut self, mapping: FieldMapping) -> CoreResult<()> {
        let field = self.field(mapping.analyzer_field_id).ok_or_else(|| {
            CoreError::Persistence(format!(
                "mapping {} references missing analyzer field {}",
                mapping.id, mapping.analyzer_field_id
            ))
        })?;
        if field.analyzer_id != mapping.analyzer_id {
            return Err(CoreError::Persistence(format!(
                "mapping {} belongs to analyzer {} but field {} belongs to analyzer {}",
                mapping.id, mapping.analyzer_id, field.id, field.analyzer_id
            )));
        }
        upsert(&mut self.mappings, mapping, |m| m.id);
        Ok(())
    }

    pub fn put_unit_mapping(&mut self, unit_mapping: UnitMapping) -> CoreResult<()> {
        let field_id = unit_mapping.analyzer_field_id;
        self.check_exists(self.field(field_id).is_some(), "analyzer field", field_id)?;
        upsert(&mut self.unit_mappings, unit_mapping, |u| u.id);
        Ok(())
    }

    pub fn put_qualitative_mapping(&mut self, mapping: QualitativeMapping) -> CoreResult<()> {
        let field_id = mapping.analyzer_field_id;
        self.check_exists(self.field(field_id).is_some(), "analyzer field", field_id)?;
        upsert(&mut self.qualitative_mappings, mapping, |q| q.id);
        Ok(())
    }

    pub fn put_custom_type(&mut self, custom_type: CustomFieldType) -> CoreResult<()> {
        upsert(&mut self.custom_types, custom_type, |t| t.id);
        Ok(())
    }

    pub fn put_rule(&mut self, rule: ValidationRule) -> CoreResult<()> {
        let type_id = rule.custom_field_type_id;
        self.check_exists(self.custom_type(type_id).is_some(), "custom field type", type_id)?;
        upsert(&mut self.rules, rule, |r| r.id);
        Ok(())
    }

    pub fn put_error(&mut self, error: AnalyzerError) -> CoreResult<()> {
        self.check_exists(self.analyzer(error.analyzer_id).is_some(), "analyzer", error.analyzer_id)?;
        upsert(Arc::make_mut(&mut self.errors), error, |e| e.id);
        Ok(())
    }

    fn check_exists(&self, exists: bool, entity: &str, id: EntityId) -> CoreResult<()> {
        if exists {
            Ok(())
        } else {
            Err(CoreError::Persistence(format!(
                "referenced {entity} {id} does not exist"
            )))
        }
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreSnapshot>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&StoreSnapshot) -> R) -> CoreResult<R> {
        let guard = self
            .state
            .read()
            .map_err(|_| CoreError::Persistence("store lock poisoned".into()))?;
        Ok(f(&guard))
    }
}

impl AnalyzerStore for InMemoryStore {
    fn analyzer(&self, id: EntityId) -> CoreResult<Option<Analyzer>> {
        self.read(|s| s.analyzer(id).cloned())
    }

    fn analyzers(&self) -> CoreResult<Vec<Analyzer>> {
        self.read(|s| s.analyzers().to_vec())
    }

    fn analyzer_type(&self, id: EntityId) -> CoreResult<Option<AnalyzerType>> {
        self.read(|s| s.analyzer_type(id).cloned())
    }

    fn field(&self, id: EntityId) -> CoreResult<Option<AnalyzerField>> {
        self.read(|s| s.field(id).cloned())
    }

    fn fields_for_analyzer(&self, analyzer_id: EntityId) -> CoreResult<Vec<AnalyzerField>> {
        self.read(|s| s.fields_for_analyzer(analyzer_id).cloned().collect())
    }

    fn mapping(&self, id: EntityId) -> CoreResult<Option<FieldMapping>> {
        self.read(|s| s.mapping(id).cloned())
    }

    fn mappings_for_analyzer(&self, analyzer_id: EntityId) -> CoreResult<Vec<FieldMapping>> {
        self.read(|s| s.mappings_for_analyzer(analyzer_id).cloned().collect())
    }

    fn unit_mappings_for_field(&self, field_id: EntityId) -> CoreResult<Vec<UnitMapping>> {
        self.read(|s| s.unit_mappings_for_field(field_id).cloned().collect())
    }

    fn qualitative_mappings_for_field(
        &self,
        field_id: EntityId,
    ) -> CoreResult<Vec<QualitativeMapping>> {
        self.read(|s| s.qualitative_mappings_for_field(field_id).cloned().collect())
    }

    fn custom_type(&self, id: EntityId) -> CoreResult<Option<CustomFieldType>> {
        self.read(|s| s.custom_type(id).cloned())
    }

    fn rules_for_custom_type(&self, custom_type_id: EntityId) -> CoreResult<Vec<ValidationRule>> {
        self.read(|s| s.rules_for_custom_type(custom_type_id).cloned().collect())
    }

    fn error(&self, id: EntityId) -> CoreResult<Option<AnalyzerError>> {
        self.read(|s| s.error(id).cloned())
    }

    fn errors(&self) -> CoreResult<Vec<AnalyzerError>> {
        self.read(|s| s.errors().to_vec())
    }

    fn transaction(&self, work: TransactionFn<'_>) -> CoreResult<()> {
        let mut guard = self
            .state
            .write()
            .map_err(|_| CoreError::Persistence("store lock poisoned".into()))?;
        let mut draft = guard.clone();
        work(&mut draft)?;
        *guard = draft;
        Ok(())
    }

    fn compare_and_set_status(
        &self,
        analyzer_id: EntityId,
        expected: AnalyzerStatus,
        new: AnalyzerStatus,
        last_activated: Option<DateTime<Utc>>,
    ) -> CoreResult<bool> {
        let mut guard = self
            .state
            .write()
            .map_err(|_| CoreError::Persistence("store lock poisoned".into()))?;
        let analyzer = guard
            .analyzers
            .iter_mut()
            .find(|a| a.id == analyzer_id)
            .ok_or_else(|| CoreError::not_found("analyzer", analyzer_id))?;
        if analyzer.status != expected {
            return Ok(false);
        }
        analyzer.status = new;
        if last_activated.is_some() {
            analyzer.last_activated = last_activated;
        }
        Ok(true)
    }
}
