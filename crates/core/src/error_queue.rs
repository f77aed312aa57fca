//! Error queue: messages the engine could not fully translate.
//!
//! Entries are created UNACKNOWLEDGED, keep the raw message verbatim and are never deleted.
//! Reprocessing re-runs mapping against the stored message without changing the entry; operators
//! acknowledge it afterwards.

use crate::apply::{MappingEngine, MappingResult};
use crate::events::{AnalyzerEvent, EventBus};
use crate::model::{AnalyzerError, ErrorStatus, ErrorType, Severity};
use crate::qc::{QcExtractionService, QcResultSink};
use crate::store::{AnalyzerStore, AnalyzerStoreExt};
use crate::CoreResult;
use chrono::{DateTime, Utc};
use lis_types::NonEmptyText;
use lis_uuid::EntityId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Error queue query. Every criterion is optional and all present criteria must match.
#[derive(Clone, Debug, Default)]
pub struct ErrorFilter {
    pub analyzer_id: Option<EntityId>,
    pub error_type: Option<ErrorType>,
    pub severity: Option<Severity>,
    pub status: Option<ErrorStatus>,
    /// Inclusive lower bound on `created_at`.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub end: Option<DateTime<Utc>>,
}

impl ErrorFilter {
    pub fn matches(&self, error: &AnalyzerError) -> bool {
        self.analyzer_id.is_none_or(|id| error.analyzer_id == id)
            && self.error_type.is_none_or(|t| error.error_type == t)
            && self.severity.is_none_or(|s| error.severity == s)
            && self.status.is_none_or(|s| error.status == s)
            && self.start.is_none_or(|start| error.created_at >= start)
            && self.end.is_none_or(|end| error.created_at <= end)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStatistics {
    pub total: usize,
    pub unacknowledged: usize,
    pub acknowledged: usize,
    pub by_type: BTreeMap<ErrorType, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
}

pub struct ErrorQueueService {
    store: Arc<dyn AnalyzerStore>,
    bus: Arc<EventBus>,
    engine: Arc<MappingEngine>,
    qc: Arc<QcExtractionService>,
    qc_sink: Option<Arc<dyn QcResultSink>>,
}

impl ErrorQueueService {
    pub fn new(
        store: Arc<dyn AnalyzerStore>,
        bus: Arc<EventBus>,
        engine: Arc<MappingEngine>,
        qc: Arc<QcExtractionService>,
    ) -> Self {
        Self {
            store,
            bus,
            engine,
            qc,
            qc_sink: None,
        }
    }

    /// Deliver QC results found while reprocessing to `sink`.
    pub fn with_qc_sink(mut self, sink: Option<Arc<dyn QcResultSink>>) -> Self {
        self.qc_sink = sink;
        self
    }

    /// Queue an error for `analyzer_id` and publish [`AnalyzerEvent::UnacknowledgedErrorCreated`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::NotFound`] for an unknown analyzer.
    pub fn create_error(
        &self,
        analyzer_id: EntityId,
        error_type: ErrorType,
        severity: Severity,
        message: &str,
        raw_message: Option<&str>,
    ) -> CoreResult<AnalyzerError> {
        self.store.require_analyzer(analyzer_id)?;

        let error = AnalyzerError {
            id: EntityId::new(),
            analyzer_id,
            error_type,
            severity,
            status: ErrorStatus::Unacknowledged,
            error_message: message.to_string(),
            raw_message: raw_message.map(str::to_string),
            created_at: Utc::now(),
            acknowledged_by: None,
            acknowledged_at: None,
        };
        let stored = error.clone();
        self.store.atomically(move |tx| tx.put_error(stored))?;

        tracing::warn!(
            "queued {} {} error {} for analyzer {}: {}",
            severity,
            error_type,
            error.id,
            analyzer_id,
            message
        );
        self.bus.publish(&AnalyzerEvent::UnacknowledgedErrorCreated {
            analyzer_id,
            error_id: error.id,
        });
        Ok(error)
    }

    /// Mark an error acknowledged by `user`.
    ///
    /// Acknowledging an already acknowledged error returns it unchanged. When this clears the
    /// analyzer's last unacknowledged error, [`AnalyzerEvent::AllErrorsAcknowledged`] is published.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::NotFound`] for an unknown id and [`crate::CoreError::Text`] for a blank user.
    pub fn acknowledge_error(&self, error_id: EntityId, user: &str) -> CoreResult<AnalyzerError> {
        let user = NonEmptyText::new(user)?;
        let mut error = self.store.require_error(error_id)?;
        if error.status == ErrorStatus::Acknowledged {
            return Ok(error);
        }

        error.status = ErrorStatus::Acknowledged;
        error.acknowledged_by = Some(user);
        error.acknowledged_at = Some(Utc::now());

        let analyzer_id = error.analyzer_id;
        let mut remaining = 0;
        let stored = error.clone();
        self.store.atomically(|tx| {
            tx.put_error(stored)?;
            remaining = tx
                .errors()
                .iter()
                .filter(|e| e.analyzer_id == analyzer_id && e.status == ErrorStatus::Unacknowledged)
                .count();
            Ok(())
        })?;

        tracing::info!("error {} acknowledged", error.id);
        if remaining == 0 {
            self.bus
                .publish(&AnalyzerEvent::AllErrorsAcknowledged { analyzer_id });
        }
        Ok(error)
    }

    /// Re-run mapping for a queued message.
    ///
    /// # Returns
    ///
    /// `true` when the stored message now translates without errors or unmapped fields. A blank
    /// raw message, or an analyzer without active mappings, gives `false`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::NotFound`] for an unknown id, or a store failure.
    pub fn reprocess_error(&self, error_id: EntityId) -> CoreResult<bool> {
        Ok(self
            .reprocess_mapped(error_id)?
            .is_some_and(|result| result.is_success() && result.unmapped_fields.is_empty()))
    }

    /// Like [`Self::reprocess_error`] but returns the mapping result for delivery.
    ///
    /// `None` when the message could not be reprocessed at all. QC records in the message are
    /// extracted as well; QC failures are logged and do not affect the result.
    pub fn reprocess_mapped(&self, error_id: EntityId) -> CoreResult<Option<MappingResult>> {
        let error = self.store.require_error(error_id)?;
        let Some(raw) = error.raw_message.as_deref().filter(|r| !r.trim().is_empty()) else {
            tracing::warn!("error {error_id} has no raw message to reprocess");
            return Ok(None);
        };
        if !self.engine.has_active_mappings(error.analyzer_id)? {
            tracing::info!(
                "analyzer {} has no active mappings; error {} not reprocessed",
                error.analyzer_id,
                error_id
            );
            return Ok(None);
        }

        let lines = astm::split_lines(raw);
        let result = self.engine.apply(error.analyzer_id, &lines)?;

        if let Some(sink) = &self.qc_sink {
            if lines.iter().any(|l| l.starts_with("Q|")) {
                let delivered = self
                    .qc
                    .extract_message(error.analyzer_id, raw)
                    .and_then(|results| results.iter().try_for_each(|r| sink.record(r)));
                if let Err(e) = delivered {
                    tracing::warn!("QC extraction failed while reprocessing error {error_id}: {e}");
                }
            }
        }

        tracing::info!(
            "reprocessed error {} ({} mapped, {} unmapped, {} error(s))",
            error_id,
            result.mapped.len(),
            result.unmapped_fields.len(),
            result.errors.len()
        );
        Ok(Some(result))
    }

    pub fn errors_by_filters(&self, filter: &ErrorFilter) -> CoreResult<Vec<AnalyzerError>> {
        let mut errors: Vec<AnalyzerError> = self
            .store
            .errors()?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        errors.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(errors)
    }

    pub fn pending_count(&self, analyzer_id: EntityId) -> CoreResult<usize> {
        Ok(self
            .errors_by_filters(&ErrorFilter {
                analyzer_id: Some(analyzer_id),
                status: Some(ErrorStatus::Unacknowledged),
                ..Default::default()
            })?
            .len())
    }

    /// Counts by status, type and severity, for one analyzer or all of them.
    pub fn statistics(&self, analyzer_id: Option<EntityId>) -> CoreResult<ErrorStatistics> {
        let errors = self.errors_by_filters(&ErrorFilter {
            analyzer_id,
            ..Default::default()
        })?;

        let mut stats = ErrorStatistics {
            total: errors.len(),
            ..Default::default()
        };
        for error in &errors {
            match error.status {
                ErrorStatus::Unacknowledged => stats.unacknowledged += 1,
                ErrorStatus::Acknowledged => stats.acknowledged += 1,
            }
            *stats.by_type.entry(error.error_type).or_default() += 1;
            *stats.by_severity.entry(error.severity).or_default() += 1;
        }
        Ok(stats)
    }
}
