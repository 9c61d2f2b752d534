use std::sync::Arc;

use rumbo_core::clock::Clock;
use rumbo_core::EngineResult;
use serde::Serialize;
use tracing::info;

use crate::lifecycle::TripLifecycleManager;
use crate::violations::ViolationTracker;

/// Counts from one pass of the periodic sweeps
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub no_shows: usize,
    pub forgotten_closures: usize,
    pub expired_violations: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.no_shows == 0 && self.forgotten_closures == 0 && self.expired_violations == 0
    }
}

/// Time-driven transitions nobody asks for: no-shows, forgotten closures, violation expiry
#[derive(Clone)]
pub struct Sweeper {
    lifecycle: Arc<TripLifecycleManager>,
    violations: Arc<ViolationTracker>,
    clock: Arc<dyn Clock>,
}

impl Sweeper {
    pub fn new(
        lifecycle: Arc<TripLifecycleManager>,
        violations: Arc<ViolationTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lifecycle,
            violations,
            clock,
        }
    }

    pub async fn no_shows(&self) -> EngineResult<usize> {
        Ok(self.lifecycle.sweep_no_shows().await?.len())
    }

    pub async fn forgotten_closures(&self) -> EngineResult<usize> {
        Ok(self.lifecycle.sweep_forgotten_closures().await?.len())
    }

    pub async fn expired_violations(&self) -> EngineResult<usize> {
        self.violations.expire_stale(self.clock.now()).await
    }

    /// Run every sweep once, in dependency order
    pub async fn run_once(&self) -> EngineResult<SweepReport> {
        let report = SweepReport {
            no_shows: self.no_shows().await?,
            forgotten_closures: self.forgotten_closures().await?,
            expired_violations: self.expired_violations().await?,
        };

        if !report.is_empty() {
            info!(
                "Sweep: {} no-show(s), {} forgotten closure(s), {} expired violation(s)",
                report.no_shows, report.forgotten_closures, report.expired_violations
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Engine, EngineStores};
    use chrono::{Duration, Utc};
    use rumbo_core::clock::ManualClock;
    use rumbo_core::rules::EngineRules;
    use rumbo_shared::ViolationType;
    use rumbo_store::{MemoryStore, RecordingNotificationSink};
    use uuid::Uuid;

    fn engine(clock: Arc<ManualClock>) -> Engine {
        Engine::new(
            EngineStores::from_shared(Arc::new(MemoryStore::new())),
            Arc::new(RecordingNotificationSink::new()),
            clock,
            EngineRules::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_quiet_pass_is_empty() {
        let engine = engine(Arc::new(ManualClock::new(Utc::now())));

        let report = engine.sweeper.run_once().await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_expired_violations_counted_once() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = engine(clock.clone());
        let driver_id = Uuid::new_v4();

        engine
            .violations
            .register(driver_id, None, ViolationType::MinorDelay, Some(12), "Late start")
            .await
            .unwrap();

        clock.advance(Duration::days(31));
        assert_eq!(engine.sweeper.expired_violations().await.unwrap(), 1);

        let report = engine.sweeper.run_once().await.unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
