pub mod history;
pub mod lifecycle;
pub mod reservations;
pub mod signals;
pub mod sweeps;
pub mod violations;

use std::sync::Arc;

use rumbo_core::clock::Clock;
use rumbo_core::notification::NotificationSink;
use rumbo_core::repository::{
    HistoryStore, ReservationLedger, ReservationStore, TripStore, ViolationStore,
};
use rumbo_core::rules::EngineRules;
use rumbo_core::signals::{SeatSignalHandler, TripReservations};
use rumbo_core::strikes::{LoggingStrikePolicy, StrikePolicy};
use rumbo_core::EngineResult;

pub use history::ReservationHistoryRecorder;
pub use lifecycle::{PublishTrip, TripLifecycleManager, TripTransition};
pub use reservations::{Decision, ReservationManager};
pub use signals::SignalRelay;
pub use sweeps::{SweepReport, Sweeper};
pub use violations::ViolationTracker;

/// Storage handles the engine is assembled from
#[derive(Clone)]
pub struct EngineStores {
    pub trips: Arc<dyn TripStore>,
    pub reservations: Arc<dyn ReservationStore>,
    pub history: Arc<dyn HistoryStore>,
    pub violations: Arc<dyn ViolationStore>,
    pub ledger: Arc<dyn ReservationLedger>,
}

impl EngineStores {
    /// Every handle backed by the same store
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: TripStore + ReservationStore + HistoryStore + ViolationStore + ReservationLedger + 'static,
    {
        Self {
            trips: store.clone(),
            reservations: store.clone(),
            history: store.clone(),
            violations: store.clone(),
            ledger: store,
        }
    }
}

/// The four managers wired together, plus the sweeper that drives the timed rules
pub struct Engine {
    pub reservations: Arc<ReservationManager>,
    pub trips: Arc<TripLifecycleManager>,
    pub violations: Arc<ViolationTracker>,
    pub history: Arc<ReservationHistoryRecorder>,
    pub sweeper: Sweeper,
}

impl Engine {
    pub fn new(
        stores: EngineStores,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        rules: EngineRules,
    ) -> EngineResult<Self> {
        Self::with_strike_policy(stores, notifier, clock, rules, Arc::new(LoggingStrikePolicy))
    }

    pub fn with_strike_policy(
        stores: EngineStores,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        rules: EngineRules,
        policy: Arc<dyn StrikePolicy>,
    ) -> EngineResult<Self> {
        rules.validate()?;
        let rules = Arc::new(rules);

        let history = Arc::new(ReservationHistoryRecorder::new(stores.history, clock.clone()));
        let violations = Arc::new(ViolationTracker::new(
            stores.violations,
            clock.clone(),
            rules.clone(),
            policy,
        ));

        // Reservations signal the lifecycle manager, which is only built afterwards
        let relay = Arc::new(SignalRelay::new());
        let reservations = Arc::new(ReservationManager::new(
            stores.trips.clone(),
            stores.reservations,
            stores.ledger,
            history.clone(),
            notifier.clone(),
            relay.clone(),
            clock.clone(),
            rules.clone(),
        ));

        let trip_reservations: Arc<dyn TripReservations> = reservations.clone();
        let trips = Arc::new(TripLifecycleManager::new(
            stores.trips,
            trip_reservations,
            violations.clone(),
            notifier,
            clock.clone(),
            rules,
        ));

        let handler: Arc<dyn SeatSignalHandler> = trips.clone();
        relay.connect(&handler);

        let sweeper = Sweeper::new(trips.clone(), violations.clone(), clock);

        Ok(Self {
            reservations,
            trips,
            violations,
            history,
            sweeper,
        })
    }
}
