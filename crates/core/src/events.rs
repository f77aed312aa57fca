//! In-process event bus connecting the configuration, error-queue and connectivity services to
//! the analyzer status machine.
//!
//! Publishing is synchronous and ordered: listeners run on the publisher's thread in registration
//! order, so events for one analyzer are always applied in the order they were raised. A failing
//! listener is logged and skipped; it never undoes work the publisher already committed.

use crate::model::AnalyzerStatus;
use crate::CoreResult;
use chrono::{DateTime, Utc};
use lis_uuid::EntityId;
use std::sync::{Arc, RwLock, Weak};

/// Emitted after every successful status transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChangeEvent {
    pub analyzer_id: EntityId,
    pub old_status: AnalyzerStatus,
    pub new_status: AnalyzerStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalyzerEvent {
    /// The first mapping for an analyzer was created.
    MappingCreated { analyzer_id: EntityId },
    /// Every required mapping category now has an active mapping.
    AllMappingsActivated { analyzer_id: EntityId },
    UnacknowledgedErrorCreated {
        analyzer_id: EntityId,
        error_id: EntityId,
    },
    /// The analyzer has no unacknowledged errors left.
    AllErrorsAcknowledged { analyzer_id: EntityId },
    ConnectionTestFailed {
        analyzer_id: EntityId,
        reason: String,
    },
    ConnectionTestSucceeded { analyzer_id: EntityId },
    StatusChanged(StatusChangeEvent),
}

impl AnalyzerEvent {
    pub fn analyzer_id(&self) -> EntityId {
        match self {
            Self::MappingCreated { analyzer_id }
            | Self::AllMappingsActivated { analyzer_id }
            | Self::UnacknowledgedErrorCreated { analyzer_id, .. }
            | Self::AllErrorsAcknowledged { analyzer_id }
            | Self::ConnectionTestFailed { analyzer_id, .. }
            | Self::ConnectionTestSucceeded { analyzer_id } => *analyzer_id,
            Self::StatusChanged(event) => event.analyzer_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MappingCreated { .. } => "MappingCreated",
            Self::AllMappingsActivated { .. } => "AllMappingsActivated",
            Self::UnacknowledgedErrorCreated { .. } => "UnacknowledgedErrorCreated",
            Self::AllErrorsAcknowledged { .. } => "AllErrorsAcknowledged",
            Self::ConnectionTestFailed { .. } => "ConnectionTestFailed",
            Self::ConnectionTestSucceeded { .. } => "ConnectionTestSucceeded",
            Self::StatusChanged(_) => "StatusChanged",
        }
    }
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &AnalyzerEvent) -> CoreResult<()>;
}

/// Listener registry.
///
/// Listeners are held weakly: the bus is shared by the services that publish, and the status
/// listener itself holds services that publish, so strong references would form a cycle. The
/// owner of a listener (normally [`crate::engine::Engine`]) keeps it alive.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Weak<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: &Arc<dyn EventListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(Arc::downgrade(listener)),
            Err(_) => tracing::error!("event bus lock poisoned; listener not registered"),
        }
    }

    /// Deliver `event` to every live listener. Entries whose listener was dropped are removed.
    pub fn publish(&self, event: &AnalyzerEvent) {
        let (listeners, stale) = match self.listeners.read() {
            Ok(registered) => {
                let live: Vec<Arc<dyn EventListener>> =
                    registered.iter().filter_map(Weak::upgrade).collect();
                let stale = live.len() < registered.len();
                (live, stale)
            }
            Err(_) => {
                tracing::error!("event bus lock poisoned; dropping {}", event.name());
                return;
            }
        };
        if stale {
            self.prune();
        }

        tracing::debug!(
            "publishing {} for analyzer {} to {} listener(s)",
            event.name(),
            event.analyzer_id(),
            listeners.len()
        );

        for listener in listeners {
            if let Err(e) = listener.on_event(event) {
                tracing::warn!(
                    "listener failed on {} for analyzer {}: {}",
                    event.name(),
                    event.analyzer_id(),
                    e
                );
            }
        }
    }
}

impl EventBus {
    fn prune(&self) {
        match self.listeners.write() {
            Ok(mut registered) => registered.retain(|l| l.strong_count() > 0),
            Err(_) => tracing::error!("event bus lock poisoned; stale listeners kept"),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.listeners.read().map(|l| l.len()).unwrap_or_default();
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}
