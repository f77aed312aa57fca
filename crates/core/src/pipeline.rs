//! Inbound message pipeline: route, translate, deliver, extract QC.
//!
//! Configuration problems found while processing a message never drop it silently. A message
//! that cannot be translated is queued as a MAPPING error; one with unmapped fields is delivered
//! and queued as a warning so the operator can complete the configuration and reprocess it.

use crate::apply::MappingEngine;
use crate::error_queue::ErrorQueueService;
use crate::model::{ErrorType, Severity};
use crate::qc::{QcExtractionService, QcResultSink};
use crate::router::{MessageRouter, RouteMethod};
use crate::store::{AnalyzerStore, AnalyzerStoreExt};
use crate::{CoreError, CoreResult};
use lis_uuid::EntityId;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;

/// What happened to one inbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub analyzer_id: Option<EntityId>,
    pub handler: Option<String>,
    pub route_method: String,
    /// Translated lines were handed to the handler's line inserter.
    pub delivered: bool,
    pub lines_delivered: usize,
    pub unmapped_fields: Vec<String>,
    pub qc_recorded: usize,
    /// Errors queued while processing this message.
    pub queued_errors: Vec<EntityId>,
}

impl IngestOutcome {
    fn unrouted(method: RouteMethod) -> Self {
        Self {
            analyzer_id: None,
            handler: None,
            route_method: method.to_string(),
            delivered: false,
            lines_delivered: 0,
            unmapped_fields: Vec::new(),
            qc_recorded: 0,
            queued_errors: Vec::new(),
        }
    }
}

pub struct IngestPipeline {
    store: Arc<dyn AnalyzerStore>,
    router: Arc<MessageRouter>,
    engine: Arc<MappingEngine>,
    errors: Arc<ErrorQueueService>,
    qc: Arc<QcExtractionService>,
    qc_sink: Option<Arc<dyn QcResultSink>>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn AnalyzerStore>,
        router: Arc<MessageRouter>,
        engine: Arc<MappingEngine>,
        errors: Arc<ErrorQueueService>,
        qc: Arc<QcExtractionService>,
    ) -> Self {
        Self {
            store,
            router,
            engine,
            errors,
            qc,
            qc_sink: None,
        }
    }

    pub fn with_qc_sink(mut self, sink: Option<Arc<dyn QcResultSink>>) -> Self {
        self.qc_sink = sink;
        self
    }

    /// Process one raw message received from `source_ip`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidInput`] if `text` has no non-blank line
    /// - a line inserter failure, or a store failure
    ///
    /// Unroutable messages and mapping problems are reported in the outcome.
    pub fn ingest(&self, source_ip: Option<IpAddr>, text: &str) -> CoreResult<IngestOutcome> {
        let lines: Vec<String> = astm::split_lines(text)
            .into_iter()
            .map(str::to_string)
            .collect();
        if lines.is_empty() {
            return Err(CoreError::InvalidInput("message is empty".into()));
        }

        let route = self.router.route(source_ip, &lines)?;
        let (Some(analyzer), Some(handler)) = (route.analyzer, route.handler) else {
            tracing::warn!("dropping unroutable message from {:?}", source_ip);
            return Ok(IngestOutcome::unrouted(route.method));
        };

        let mut outcome = IngestOutcome::unrouted(route.method);
        outcome.analyzer_id = Some(analyzer.id);
        outcome.handler = Some(handler.name().to_string());

        let result = self.engine.apply(analyzer.id, &lines)?;
        if !result.is_success() {
            let error = self.errors.create_error(
                analyzer.id,
                ErrorType::Mapping,
                Severity::Error,
                &format!("Mapping failed: {}", result.errors.join("; ")),
                Some(text),
            )?;
            outcome.queued_errors.push(error.id);
            return Ok(outcome);
        }

        if !result.unmapped_fields.is_empty() {
            let error = self.errors.create_error(
                analyzer.id,
                ErrorType::Mapping,
                Severity::Warning,
                &format!("Unmapped fields: {}", result.unmapped_fields.join(", ")),
                Some(text),
            )?;
            outcome.queued_errors.push(error.id);
        }

        handler.line_inserter().insert(analyzer.id, &result.lines)?;
        outcome.delivered = true;
        outcome.lines_delivered = result.lines.len();
        outcome.unmapped_fields = result.unmapped_fields;
        tracing::info!(
            "delivered {} line(s) from analyzer {} via '{}' ({})",
            outcome.lines_delivered,
            analyzer.id,
            handler.name(),
            outcome.route_method
        );

        if lines.iter().any(|l| l.starts_with("Q|")) {
            self.record_qc(analyzer.id, text, &mut outcome)?;
        }
        Ok(outcome)
    }

    fn record_qc(
        &self,
        analyzer_id: EntityId,
        text: &str,
        outcome: &mut IngestOutcome,
    ) -> CoreResult<()> {
        let Some(sink) = &self.qc_sink else {
            let error = self.errors.create_error(
                analyzer_id,
                ErrorType::QcServiceUnavailable,
                Severity::Warning,
                "QC service unavailable; QC records were not recorded",
                Some(text),
            )?;
            outcome.queued_errors.push(error.id);
            return Ok(());
        };

        let recorded = self
            .qc
            .extract_message(analyzer_id, text)
            .and_then(|results| {
                results.iter().try_for_each(|r| sink.record(r))?;
                Ok(results.len())
            });
        match recorded {
            Ok(count) => outcome.qc_recorded = count,
            Err(e) => {
                let error = self.errors.create_error(
                    analyzer_id,
                    ErrorType::QcMappingIncomplete,
                    Severity::Error,
                    &e.to_string(),
                    Some(text),
                )?;
                outcome.queued_errors.push(error.id);
            }
        }
        Ok(())
    }

    /// Reprocess a queued message and deliver it through the analyzer's bound handler.
    ///
    /// # Returns
    ///
    /// `true` if the message translated cleanly and was delivered.
    pub fn reprocess(&self, error_id: EntityId) -> CoreResult<bool> {
        let Some(result) = self.errors.reprocess_mapped(error_id)? else {
            return Ok(false);
        };
        if !result.is_success() || !result.unmapped_fields.is_empty() {
            return Ok(false);
        }

        let error = self.store.require_error(error_id)?;
        let analyzer = self.store.require_analyzer(error.analyzer_id)?;
        let Some(handler) = self.router.bound_handler(&analyzer)? else {
            tracing::warn!(
                "analyzer {} has no bound handler; reprocessed error {} not delivered",
                analyzer.id,
                error_id
            );
            return Ok(false);
        };
        handler.line_inserter().insert(analyzer.id, &result.lines)?;
        tracing::info!("redelivered error {} via '{}'", error_id, handler.name());
        Ok(true)
    }
}
