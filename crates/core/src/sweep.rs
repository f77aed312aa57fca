//! Idle sweep: analyzers ACTIVE longer than the idle threshold go OFFLINE.
//!
//! Each analyzer is transitioned on its own; one failure is logged and the sweep moves on.

use crate::config::CoreConfig;
use crate::constants::{REASON_IDLE_THRESHOLD, SWEEP_FAILURE_WARN_THRESHOLD};
use crate::model::AnalyzerStatus;
use crate::status::StatusService;
use crate::store::AnalyzerStore;
use crate::CoreResult;
use chrono::{DateTime, Utc};
use lis_uuid::EntityId;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evaluated: usize,
    pub transitioned: Vec<EntityId>,
    pub failed: Vec<(EntityId, String)>,
}

pub struct IdleSweep {
    store: Arc<dyn AnalyzerStore>,
    status: Arc<StatusService>,
    idle_threshold: chrono::Duration,
}

impl IdleSweep {
    pub fn new(store: Arc<dyn AnalyzerStore>, status: Arc<StatusService>, config: &CoreConfig) -> Self {
        Self {
            store,
            status,
            idle_threshold: config.idle_threshold(),
        }
    }

    pub fn run(&self) -> CoreResult<SweepReport> {
        self.run_at(Utc::now())
    }

    /// Sweep as of `now`.
    ///
    /// # Errors
    ///
    /// Only a failure to list analyzers is returned; per-analyzer failures are collected in the
    /// report.
    pub fn run_at(&self, now: DateTime<Utc>) -> CoreResult<SweepReport> {
        let cutoff = now - self.idle_threshold;
        let mut report = SweepReport::default();

        for analyzer in self.store.analyzers()? {
            if analyzer.status != AnalyzerStatus::Active {
                continue;
            }
            report.evaluated += 1;
            let Some(last_activated) = analyzer.last_activated else {
                tracing::debug!("analyzer {} is ACTIVE without an activation time", analyzer.id);
                continue;
            };
            if last_activated > cutoff {
                continue;
            }

            match self.status.transition_automatic(
                analyzer.id,
                AnalyzerStatus::Offline,
                REASON_IDLE_THRESHOLD,
            ) {
                Ok(_) => report.transitioned.push(analyzer.id),
                Err(e) => {
                    tracing::warn!("idle sweep could not take analyzer {} offline: {}", analyzer.id, e);
                    report.failed.push((analyzer.id, e.to_string()));
                }
            }
        }

        if report.failed.len() > SWEEP_FAILURE_WARN_THRESHOLD {
            tracing::warn!(
                "idle sweep: {} analyzers failed to transition",
                report.failed.len()
            );
        }
        tracing::info!(
            "idle sweep evaluated {} active analyzer(s), {} taken offline",
            report.evaluated,
            report.transitioned.len()
        );
        Ok(report)
    }
}

/// Run `sweep` every `interval` until the task is aborted. The first run happens after one
/// interval.
pub fn spawn_idle_sweep(sweep: Arc<IdleSweep>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let sweep = Arc::clone(&sweep);
            match tokio::task::spawn_blocking(move || sweep.run()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!("idle sweep failed: {e}"),
                Err(e) => tracing::error!("idle sweep task panicked: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::model::AnalyzerStatus::{Active, Offline, Validation};
    use crate::store::AnalyzerStoreExt;
    use crate::testing::{analyzer_with_status, FaultyStore, Fixture};

    fn backdate(fx: &Fixture, analyzer: EntityId, days: i64) {
        let mut stored = fx.store.require_analyzer(analyzer).unwrap();
        stored.last_activated = Some(Utc::now() - chrono::Duration::days(days));
        fx.store.atomically(move |tx| tx.put_analyzer(stored)).unwrap();
    }

    #[test]
    fn test_idle_active_analyzer_goes_offline() {
        let fx = Fixture::new();
        let idle = analyzer_with_status(&fx, "Idle", Active);
        let busy = analyzer_with_status(&fx, "Busy", Active);
        let setup = analyzer_with_status(&fx, "Setup", Validation);
        backdate(&fx, idle, 8);
        backdate(&fx, busy, 2);

        let sweep = IdleSweep::new(fx.dyn_store(), fx.status.clone(), &fx.config);
        let report = sweep.run().unwrap();

        assert_eq!(report.evaluated, 2);
        assert_eq!(report.transitioned, vec![idle]);
        assert_eq!(fx.status.current_status(idle).unwrap(), Offline);
        assert_eq!(fx.status.current_status(busy).unwrap(), Active);
        assert_eq!(fx.status.current_status(setup).unwrap(), Validation);
    }

    #[test]
    fn test_failure_for_one_analyzer_does_not_stop_sweep() {
        let fx = Fixture::new();
        let broken = analyzer_with_status(&fx, "Broken", Active);
        let idle = analyzer_with_status(&fx, "Idle", Active);
        backdate(&fx, broken, 30);
        backdate(&fx, idle, 30);

        let faulty: Arc<dyn AnalyzerStore> = Arc::new(FaultyStore::new(fx.store.clone(), broken));
        let status = Arc::new(StatusService::new(faulty.clone(), Arc::new(EventBus::new())));
        let report = IdleSweep::new(faulty, status, &fx.config).run().unwrap();

        assert_eq!(report.transitioned, vec![idle]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, broken);
        assert_eq!(fx.status.current_status(broken).unwrap(), Active);
    }
}
