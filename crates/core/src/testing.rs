//! Shared fixtures for unit tests.

use crate::apply::MappingEngine;
use crate::config::CoreConfig;
use crate::error_queue::ErrorQueueService;
use crate::events::{AnalyzerEvent, EventBus, EventListener};
use crate::mapping::{FieldMappingService, NewField, NewMapping};
use crate::model::{
    Analyzer, AnalyzerError, AnalyzerField, AnalyzerStatus, AnalyzerType, CustomFieldType,
    FieldMapping, FieldType, MappingType, OpenelisFieldType, QualitativeMapping, UnitMapping,
    ValidationRule,
};
use crate::qc::QcExtractionService;
use crate::rules::RuleEngineValidator;
use crate::status::{StatusEventListener, StatusService};
use crate::store::{AnalyzerStore, AnalyzerStoreExt, InMemoryStore, TransactionFn};
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use lis_types::NonEmptyText;
use lis_uuid::EntityId;
use std::sync::{Arc, Mutex};

/// Records every published event.
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<AnalyzerEvent>>,
}

impl RecordingListener {
    pub(crate) fn events(&self) -> Vec<AnalyzerEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &AnalyzerEvent) -> CoreResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// In-memory store, event bus and status machine wired the way the engine wires them.
pub(crate) struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub bus: Arc<EventBus>,
    pub status: Arc<StatusService>,
    pub recorder: Arc<RecordingListener>,
    pub config: CoreConfig,
    _listeners: Vec<Arc<dyn EventListener>>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(EventBus::new());
        let status = Arc::new(StatusService::new(store.clone(), bus.clone()));
        let recorder = Arc::new(RecordingListener::default());

        let status_listener: Arc<dyn EventListener> =
            Arc::new(StatusEventListener::new(status.clone()));
        let recording: Arc<dyn EventListener> = recorder.clone();
        bus.subscribe(&status_listener);
        bus.subscribe(&recording);

        Self {
            store,
            bus,
            status,
            recorder,
            config: CoreConfig::default(),
            _listeners: vec![status_listener, recording],
        }
    }

    pub(crate) fn dyn_store(&self) -> Arc<dyn AnalyzerStore> {
        self.store.clone()
    }

    pub(crate) fn mappings(&self) -> FieldMappingService {
        FieldMappingService::new(
            self.dyn_store(),
            self.bus.clone(),
            Arc::new(RuleEngineValidator::new(self.dyn_store())),
        )
    }

    pub(crate) fn mapping_engine(&self) -> MappingEngine {
        MappingEngine::new(
            self.dyn_store(),
            Arc::new(RuleEngineValidator::new(self.dyn_store())),
            self.config.conversion_scale(),
        )
    }

    pub(crate) fn errors(&self) -> ErrorQueueService {
        ErrorQueueService::new(
            self.dyn_store(),
            self.bus.clone(),
            Arc::new(self.mapping_engine()),
            Arc::new(QcExtractionService::new(
                self.dyn_store(),
                self.config.conversion_scale(),
            )),
        )
    }
}

/// Store an analyzer already in `status`. ACTIVE analyzers are stamped as activated now.
pub(crate) fn analyzer_with_status(fx: &Fixture, name: &str, status: AnalyzerStatus) -> EntityId {
    let mut analyzer = Analyzer::new(NonEmptyText::new(name).unwrap());
    analyzer.status = status;
    if status == AnalyzerStatus::Active {
        analyzer.last_activated = Some(Utc::now());
    }
    let id = analyzer.id;
    fx.store.atomically(move |tx| tx.put_analyzer(analyzer)).unwrap();
    id
}

pub(crate) fn add_field(
    fx: &Fixture,
    analyzer: EntityId,
    name: &str,
    field_type: FieldType,
    unit: Option<&str>,
) -> EntityId {
    fx.mappings()
        .create_field(NewField {
            analyzer_id: analyzer,
            field_name: name.into(),
            field_type,
            unit: unit.map(str::to_string),
            astm_ref: None,
            custom_type_id: None,
        })
        .unwrap()
        .id
}

/// Create a draft (inactive) mapping.
pub(crate) fn add_mapping(
    fx: &Fixture,
    field: EntityId,
    openelis_field_id: &str,
    openelis_field_type: OpenelisFieldType,
    mapping_type: MappingType,
    required: bool,
) -> EntityId {
    fx.mappings()
        .create_mapping(NewMapping {
            analyzer_field_id: field,
            openelis_field_id: openelis_field_id.into(),
            openelis_field_type,
            mapping_type,
            is_required: required,
            sample_values: vec![],
        })
        .unwrap()
        .id
}

pub(crate) struct ConfiguredAnalyzer {
    pub analyzer: EntityId,
    pub sample_id: EntityId,
    pub glucose: EntityId,
    pub sample_mapping: EntityId,
    pub test_mapping: EntityId,
    pub result_mapping: EntityId,
}

/// An analyzer taken from SETUP to ACTIVE through the configuration events: SAMPLE_ID (`O|2`)
/// mapped to the accession number, GLU mapped to a test and a result.
pub(crate) fn configure_analyzer(fx: &Fixture, name: &str) -> ConfiguredAnalyzer {
    let analyzer = analyzer_with_status(fx, name, AnalyzerStatus::Setup);
    let svc = fx.mappings();

    let sample_id = svc
        .create_field(NewField {
            analyzer_id: analyzer,
            field_name: "SAMPLE_ID".into(),
            field_type: FieldType::Text,
            unit: None,
            astm_ref: Some("O|2".into()),
            custom_type_id: None,
        })
        .unwrap()
        .id;
    let sample_mapping = add_mapping(
        fx,
        sample_id,
        "sample.accession",
        OpenelisFieldType::Sample,
        MappingType::Metadata,
        true,
    );

    let glucose = add_field(fx, analyzer, "GLU", FieldType::Numeric, Some("mg/dL"));
    let test_mapping = add_mapping(
        fx,
        glucose,
        "test.glucose",
        OpenelisFieldType::Test,
        MappingType::TestLevel,
        true,
    );
    let result_mapping = add_mapping(
        fx,
        glucose,
        "result.glucose",
        OpenelisFieldType::Result,
        MappingType::ResultLevel,
        true,
    );

    svc.bulk_activate(analyzer, &[sample_mapping, test_mapping, result_mapping], false)
        .unwrap();
    assert_eq!(
        fx.status.current_status(analyzer).unwrap(),
        AnalyzerStatus::Active
    );

    ConfiguredAnalyzer {
        analyzer,
        sample_id,
        glucose,
        sample_mapping,
        test_mapping,
        result_mapping,
    }
}

/// Delegates to an in-memory store but fails status writes for one analyzer.
pub(crate) struct FaultyStore {
    inner: Arc<InMemoryStore>,
    fail_id: EntityId,
}

impl FaultyStore {
    pub(crate) fn new(inner: Arc<InMemoryStore>, fail_id: EntityId) -> Self {
        Self { inner, fail_id }
    }
}

impl AnalyzerStore for FaultyStore {
    fn analyzer(&self, id: EntityId) -> CoreResult<Option<Analyzer>> {
        self.inner.analyzer(id)
    }

    fn analyzers(&self) -> CoreResult<Vec<Analyzer>> {
        self.inner.analyzers()
    }

    fn analyzer_type(&self, id: EntityId) -> CoreResult<Option<AnalyzerType>> {
        self.inner.analyzer_type(id)
    }

    fn field(&self, id: EntityId) -> CoreResult<Option<AnalyzerField>> {
        self.inner.field(id)
    }

    fn fields_for_analyzer(&self, analyzer_id: EntityId) -> CoreResult<Vec<AnalyzerField>> {
        self.inner.fields_for_analyzer(analyzer_id)
    }

    fn mapping(&self, id: EntityId) -> CoreResult<Option<FieldMapping>> {
        self.inner.mapping(id)
    }

    fn mappings_for_analyzer(&self, analyzer_id: EntityId) -> CoreResult<Vec<FieldMapping>> {
        self.inner.mappings_for_analyzer(analyzer_id)
    }

    fn unit_mappings_for_field(&self, field_id: EntityId) -> CoreResult<Vec<UnitMapping>> {
        self.inner.unit_mappings_for_field(field_id)
    }

    fn qualitative_mappings_for_field(
        &self,
        field_id: EntityId,
    ) -> CoreResult<Vec<QualitativeMapping>> {
        self.inner.qualitative_mappings_for_field(field_id)
    }

    fn custom_type(&self, id: EntityId) -> CoreResult<Option<CustomFieldType>> {
        self.inner.custom_type(id)
    }

    fn rules_for_custom_type(&self, custom_type_id: EntityId) -> CoreResult<Vec<ValidationRule>> {
        self.inner.rules_for_custom_type(custom_type_id)
    }

    fn error(&self, id: EntityId) -> CoreResult<Option<AnalyzerError>> {
        self.inner.error(id)
    }

    fn errors(&self) -> CoreResult<Vec<AnalyzerError>> {
        self.inner.errors()
    }

    fn transaction(&self, work: TransactionFn<'_>) -> CoreResult<()> {
        self.inner.transaction(work)
    }

    fn compare_and_set_status(
        &self,
        analyzer_id: EntityId,
        expected: AnalyzerStatus,
        new: AnalyzerStatus,
        last_activated: Option<DateTime<Utc>>,
    ) -> CoreResult<bool> {
        if analyzer_id == self.fail_id {
            return Err(CoreError::Persistence("simulated status write failure".into()));
        }
        self.inner
            .compare_and_set_status(analyzer_id, expected, new, last_activated)
    }
}
