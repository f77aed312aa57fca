//! Service wiring for one running integration engine.
//!
//! [`Engine`] builds every core service over a single store and event bus, subscribes the
//! status listener, and owns the listener handles the bus only holds weakly.

use crate::apply::MappingEngine;
use crate::config::CoreConfig;
use crate::error_queue::ErrorQueueService;
use crate::events::{EventBus, EventListener};
use crate::handlers::build_registry;
use crate::mapping::FieldMappingService;
use crate::metrics::MappingMetricsService;
use crate::pipeline::IngestPipeline;
use crate::preview::MappingPreviewService;
use crate::qc::{QcExtractionService, QcResultSink};
use crate::query::QueryService;
use crate::router::{HandlerRegistry, LineInserter, MessageRouter};
use crate::rules::{CustomTypeValidator, RuleEngineValidator};
use crate::seed::Seed;
use crate::status::{StatusEventListener, StatusService};
use crate::store::AnalyzerStore;
use crate::sweep::{spawn_idle_sweep, IdleSweep};
use crate::CoreResult;
use std::sync::Arc;

pub struct Engine {
    config: Arc<CoreConfig>,
    store: Arc<dyn AnalyzerStore>,
    bus: Arc<EventBus>,
    status: Arc<StatusService>,
    mappings: Arc<FieldMappingService>,
    mapping_engine: Arc<MappingEngine>,
    qc: Arc<QcExtractionService>,
    errors: Arc<ErrorQueueService>,
    router: Arc<MessageRouter>,
    pipeline: Arc<IngestPipeline>,
    preview: Arc<MappingPreviewService>,
    metrics: Arc<MappingMetricsService>,
    query: Arc<QueryService>,
    sweep: Arc<IdleSweep>,
    _listeners: Vec<Arc<dyn EventListener>>,
}

impl Engine {
    pub fn new(
        config: Arc<CoreConfig>,
        store: Arc<dyn AnalyzerStore>,
        handlers: HandlerRegistry,
        qc_sink: Option<Arc<dyn QcResultSink>>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let status = Arc::new(StatusService::new(Arc::clone(&store), Arc::clone(&bus)));
        let status_listener: Arc<dyn EventListener> =
            Arc::new(StatusEventListener::new(Arc::clone(&status)));
        bus.subscribe(&status_listener);

        let validator: Arc<dyn CustomTypeValidator> =
            Arc::new(RuleEngineValidator::new(Arc::clone(&store)));
        let mappings = Arc::new(FieldMappingService::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&validator),
        ));
        let mapping_engine = Arc::new(MappingEngine::new(
            Arc::clone(&store),
            validator,
            config.conversion_scale(),
        ));
        let qc = Arc::new(QcExtractionService::new(
            Arc::clone(&store),
            config.conversion_scale(),
        ));
        let errors = Arc::new(
            ErrorQueueService::new(
                Arc::clone(&store),
                Arc::clone(&bus),
                Arc::clone(&mapping_engine),
                Arc::clone(&qc),
            )
            .with_qc_sink(qc_sink.clone()),
        );
        let router = Arc::new(MessageRouter::new(Arc::clone(&store), Arc::new(handlers)));
        let pipeline = Arc::new(
            IngestPipeline::new(
                Arc::clone(&store),
                Arc::clone(&router),
                Arc::clone(&mapping_engine),
                Arc::clone(&errors),
                Arc::clone(&qc),
            )
            .with_qc_sink(qc_sink),
        );
        let preview = Arc::new(MappingPreviewService::new(
            Arc::clone(&store),
            Arc::clone(&mapping_engine),
        ));
        let metrics = Arc::new(MappingMetricsService::new(Arc::clone(&store)));
        let query = Arc::new(QueryService::new(Arc::clone(&store), Arc::clone(&bus), &config));
        let sweep = Arc::new(IdleSweep::new(Arc::clone(&store), Arc::clone(&status), &config));

        tracing::info!("analyzer integration engine initialised");

        Self {
            config,
            store,
            bus,
            status,
            mappings,
            mapping_engine,
            qc,
            errors,
            router,
            pipeline,
            preview,
            metrics,
            query,
            sweep,
            _listeners: vec![status_listener],
        }
    }

    /// Build an engine over a loaded seed, registering its handlers.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::InvalidInput`] if a handler spec is invalid.
    pub fn from_seed(
        config: Arc<CoreConfig>,
        seed: Seed,
        inserter: Arc<dyn LineInserter>,
        qc_sink: Option<Arc<dyn QcResultSink>>,
    ) -> CoreResult<Self> {
        let handlers = build_registry(&seed.handlers, inserter)?;
        Ok(Self::new(config, seed.store, handlers, qc_sink))
    }

    /// Start the periodic idle sweep on the current tokio runtime.
    pub fn spawn_idle_sweep(&self) -> tokio::task::JoinHandle<()> {
        spawn_idle_sweep(Arc::clone(&self.sweep), self.config.sweep_interval())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn AnalyzerStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn status(&self) -> &Arc<StatusService> {
        &self.status
    }

    pub fn mappings(&self) -> &Arc<FieldMappingService> {
        &self.mappings
    }

    pub fn mapping_engine(&self) -> &Arc<MappingEngine> {
        &self.mapping_engine
    }

    pub fn qc(&self) -> &Arc<QcExtractionService> {
        &self.qc
    }

    pub fn errors(&self) -> &Arc<ErrorQueueService> {
        &self.errors
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    pub fn preview(&self) -> &Arc<MappingPreviewService> {
        &self.preview
    }

    pub fn metrics(&self) -> &Arc<MappingMetricsService> {
        &self.metrics
    }

    pub fn query(&self) -> &Arc<QueryService> {
        &self.query
    }

    pub fn sweep(&self) -> &Arc<IdleSweep> {
        &self.sweep
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::MemoryLineInserter;
    use crate::model::{AnalyzerStatus, ErrorType, Severity};
    use crate::router::RouteMethod;
    use crate::seed::load_seed_str;
    use lis_uuid::EntityId;

    const SEED: &str = r#"
handlers:
  - name: cobas
    protocol: ASTM
    pattern: "^COBAS"
analyzers:
  - id: "bb000000000000000000000000000001"
    name: Cobas 6000
    handler: cobas
    ip_address: 10.0.0.5
    port: 5000
    status: ACTIVE
"#;

    fn engine() -> Engine {
        let seed = load_seed_str(SEED).unwrap();
        Engine::from_seed(
            Arc::new(CoreConfig::default()),
            seed,
            Arc::new(MemoryLineInserter::default()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_status_listener_outlives_constructor() {
        let engine = engine();
        let analyzer = EntityId::parse("bb000000000000000000000000000001").unwrap();

        engine
            .errors()
            .create_error(analyzer, ErrorType::Protocol, Severity::Error, "bad frame", None)
            .unwrap();

        assert_eq!(
            engine.status().current_status(analyzer).unwrap(),
            AnalyzerStatus::ErrorPending
        );
    }

    #[test]
    fn test_router_uses_seeded_handlers() {
        let engine = engine();
        let lines = vec!["H|\\^&|||COBAS^6000".to_string(), "L|1|N".to_string()];

        let routed = engine.router().route(None, &lines).unwrap();
        assert_eq!(routed.method, RouteMethod::PluginMatch);

        let unknown = vec!["H|\\^&|||SYSMEX^XN".to_string()];
        let unrouted = engine.router().route(None, &unknown).unwrap();
        assert!(!unrouted.is_success());
    }
}
