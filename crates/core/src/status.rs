//! Analyzer status state machine.
//!
//! Status is written only here, always through
//! [`AnalyzerStore::compare_and_set_status`](crate::store::AnalyzerStore::compare_and_set_status),
//! so two racing transitions on the same analyzer cannot both succeed from the same source state.
//!
//! Operators drive the configuration states (INACTIVE, SETUP, VALIDATION, DELETED). The running
//! states (ACTIVE, ERROR_PENDING, OFFLINE) are entered only by [`StatusEventListener`] reacting to
//! events, or by the idle sweep.

use crate::constants::{
    REASON_ALL_MAPPINGS_ACTIVATED, REASON_CONNECTION_FAILED, REASON_CONNECTION_RESTORED,
    REASON_ERRORS_ACKNOWLEDGED, REASON_ERROR_CREATED, REASON_FIRST_MAPPING,
};
use crate::events::{AnalyzerEvent, EventBus, EventListener, StatusChangeEvent};
use crate::model::AnalyzerStatus;
use crate::store::{AnalyzerStore, AnalyzerStoreExt};
use crate::{CoreError, CoreResult};
use chrono::Utc;
use lis_uuid::EntityId;
use std::sync::Arc;

use AnalyzerStatus::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionTrigger {
    /// Operator-invoked.
    Manual,
    /// Raised by an engine event or the idle sweep.
    Automatic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionCheck {
    /// Source and target are the same; nothing to write.
    Unchanged,
    Allowed,
}

/// Check a transition against the lifecycle table.
///
/// # Errors
///
/// - [`CoreError::ManualTransitionForbidden`] for any manual attempt to enter ACTIVE,
///   ERROR_PENDING or OFFLINE, whatever the source state.
/// - [`CoreError::InvalidTransition`] for any pair not in the table.
pub fn check_transition(
    from: AnalyzerStatus,
    to: AnalyzerStatus,
    trigger: TransitionTrigger,
) -> CoreResult<TransitionCheck> {
    use TransitionTrigger::{Automatic, Manual};

    if trigger == Manual && matches!(to, Active | ErrorPending | Offline) {
        return Err(CoreError::ManualTransitionForbidden(to));
    }
    if from == to {
        return Ok(TransitionCheck::Unchanged);
    }

    let allowed = match (from, to, trigger) {
        (_, Inactive, Manual) => true,
        (Inactive, Setup | Deleted, Manual) => true,
        (Setup, Validation, _) => true,
        (Validation, Setup, Manual) => true,
        (Validation, Active, Automatic) => true,
        (Active, ErrorPending | Offline, Automatic) => true,
        (ErrorPending, Active | Offline, Automatic) => true,
        (Offline, Active, Automatic) => true,
        _ => false,
    };

    if allowed {
        Ok(TransitionCheck::Allowed)
    } else {
        Err(CoreError::InvalidTransition { from, to })
    }
}

/// Applies checked transitions and announces them.
pub struct StatusService {
    store: Arc<dyn AnalyzerStore>,
    bus: Arc<EventBus>,
}

impl StatusService {
    pub fn new(store: Arc<dyn AnalyzerStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    pub fn current_status(&self, analyzer_id: EntityId) -> CoreResult<AnalyzerStatus> {
        Ok(self.store.require_analyzer(analyzer_id)?.status)
    }

    /// Operator-requested transition.
    pub fn transition_manual(
        &self,
        analyzer_id: EntityId,
        to: AnalyzerStatus,
        reason: &str,
    ) -> CoreResult<Option<StatusChangeEvent>> {
        self.transition(analyzer_id, to, TransitionTrigger::Manual, reason)
    }

    pub fn transition_automatic(
        &self,
        analyzer_id: EntityId,
        to: AnalyzerStatus,
        reason: &str,
    ) -> CoreResult<Option<StatusChangeEvent>> {
        self.transition(analyzer_id, to, TransitionTrigger::Automatic, reason)
    }

    /// Check and commit a transition, then publish [`AnalyzerEvent::StatusChanged`].
    ///
    /// # Returns
    ///
    /// The published event, or `None` when the analyzer was already in `to`.
    ///
    /// # Errors
    ///
    /// Returns the [`check_transition`] errors, [`CoreError::NotFound`] for an unknown analyzer, and
    /// [`CoreError::ConcurrentModification`] if the status changed between read and commit.
    pub fn transition(
        &self,
        analyzer_id: EntityId,
        to: AnalyzerStatus,
        trigger: TransitionTrigger,
        reason: &str,
    ) -> CoreResult<Option<StatusChangeEvent>> {
        let from = self.current_status(analyzer_id)?;
        if check_transition(from, to, trigger)? == TransitionCheck::Unchanged {
            return Ok(None);
        }

        let now = Utc::now();
        let last_activated = (to == Active).then_some(now);
        if !self
            .store
            .compare_and_set_status(analyzer_id, from, to, last_activated)?
        {
            let actual = self.current_status(analyzer_id)?;
            return Err(CoreError::ConcurrentModification {
                expected: from.to_string(),
                actual: actual.to_string(),
            });
        }

        tracing::info!("analyzer {analyzer_id} status {from} -> {to} ({reason})");

        let event = StatusChangeEvent {
            analyzer_id,
            old_status: from,
            new_status: to,
            reason: reason.to_string(),
            timestamp: now,
        };
        self.bus.publish(&AnalyzerEvent::StatusChanged(event.clone()));
        Ok(Some(event))
    }
}

/// Drives automatic transitions from engine events.
///
/// Each handler re-reads the persisted status first and does nothing unless the analyzer is in the
/// expected source state, so a repeated or late event never double-transitions.
pub struct StatusEventListener {
    status: Arc<StatusService>,
}

impl StatusEventListener {
    pub fn new(status: Arc<StatusService>) -> Self {
        Self { status }
    }

    fn advance(
        &self,
        analyzer_id: EntityId,
        from: &[AnalyzerStatus],
        to: AnalyzerStatus,
        reason: &str,
    ) -> CoreResult<()> {
        let current = self.status.current_status(analyzer_id)?;
        if !from.contains(&current) {
            tracing::debug!(
                "analyzer {analyzer_id} is {current}; ignoring '{reason}' transition to {to}"
            );
            return Ok(());
        }
        self.status.transition_automatic(analyzer_id, to, reason)?;
        Ok(())
    }
}

impl EventListener for StatusEventListener {
    fn on_event(&self, event: &AnalyzerEvent) -> CoreResult<()> {
        match event {
            AnalyzerEvent::MappingCreated { analyzer_id } => {
                self.advance(*analyzer_id, &[Setup], Validation, REASON_FIRST_MAPPING)
            }
            AnalyzerEvent::AllMappingsActivated { analyzer_id } => self.advance(
                *analyzer_id,
                &[Validation],
                Active,
                REASON_ALL_MAPPINGS_ACTIVATED,
            ),
            AnalyzerEvent::UnacknowledgedErrorCreated { analyzer_id, .. } => {
                self.advance(*analyzer_id, &[Active], ErrorPending, REASON_ERROR_CREATED)
            }
            AnalyzerEvent::AllErrorsAcknowledged { analyzer_id } => self.advance(
                *analyzer_id,
                &[ErrorPending],
                Active,
                REASON_ERRORS_ACKNOWLEDGED,
            ),
            AnalyzerEvent::ConnectionTestFailed { analyzer_id, .. } => self.advance(
                *analyzer_id,
                &[Active, ErrorPending],
                Offline,
                REASON_CONNECTION_FAILED,
            ),
            AnalyzerEvent::ConnectionTestSucceeded { analyzer_id } => {
                self.advance(*analyzer_id, &[Offline], Active, REASON_CONNECTION_RESTORED)
            }
            AnalyzerEvent::StatusChanged(_) => Ok(()),
        }
    }
}
