use std::sync::Arc;

use chrono::{DateTime, Utc};
use rumbo_core::clock::Clock;
use rumbo_core::repository::HistoryStore;
use rumbo_core::EngineResult;
use rumbo_shared::{Reservation, ReservationHistoryEntry, ReservationState};
use tracing::debug;
use uuid::Uuid;

/// Append-only log of reservation state transitions.
///
/// The reservation manager builds entries with [`entry_for`](Self::entry_for) and hands
/// them to the ledger so they commit together with the reservation write.
pub struct ReservationHistoryRecorder {
    store: Arc<dyn HistoryStore>,
    clock: Arc<dyn Clock>,
}

impl ReservationHistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Build an entry without writing it. The store assigns `sequence` on append.
    pub fn entry_for(
        &self,
        reservation: &Reservation,
        driver_id: Uuid,
        prior: Option<ReservationState>,
        new: ReservationState,
        actor_id: Uuid,
        occurred_at: DateTime<Utc>,
    ) -> ReservationHistoryEntry {
        ReservationHistoryEntry {
            id: Uuid::new_v4(),
            sequence: 0,
            reservation_id: reservation.id,
            trip_id: reservation.trip_id,
            driver_id,
            traveler_id: reservation.traveler_id,
            actor_id,
            occurred_at,
            prior_state: prior,
            new_state: new,
        }
    }

    /// Append one transition on its own. No validation of the transition itself.
    pub async fn record(
        &self,
        reservation: &Reservation,
        driver_id: Uuid,
        prior: Option<ReservationState>,
        new: ReservationState,
        actor_id: Uuid,
    ) -> EngineResult<ReservationHistoryEntry> {
        let mut entry = self.entry_for(reservation, driver_id, prior, new, actor_id, self.clock.now());
        entry.sequence = self.store.append(&entry).await?;

        debug!(
            "Recorded reservation {} transition {:?} -> {}",
            entry.reservation_id, entry.prior_state, entry.new_state
        );
        Ok(entry)
    }

    /// Every transition of every reservation on the trip, oldest first
    pub async fn for_trip(&self, trip_id: Uuid) -> EngineResult<Vec<ReservationHistoryEntry>> {
        let mut entries = self.store.find_by_trip(trip_id).await?;
        entries.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(entries)
    }
}
