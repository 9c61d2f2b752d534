use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumbo_core::repository::{
    CommittedChange, HistoryStore, ReservationChange, ReservationLedger, ReservationStore,
    StoreError, StoreResult, TripStore, ViolationStore,
};
use rumbo_shared::{
    Attendance, ConductorViolation, PaymentStatus, Reservation, ReservationHistoryEntry,
    ReservationState, Trip, TripState,
};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    trips: HashMap<Uuid, Trip>,
    reservations: HashMap<Uuid, Reservation>,
    history: Vec<ReservationHistoryEntry>,
    violations: HashMap<Uuid, ConductorViolation>,
    next_sequence: i64,
}

impl Tables {
    fn append(&mut self, entry: &ReservationHistoryEntry) -> i64 {
        self.next_sequence += 1;
        let mut entry = entry.clone();
        entry.sequence = self.next_sequence;
        self.history.push(entry);
        self.next_sequence
    }

    fn confirmed_mut(&mut self, id: Uuid) -> StoreResult<&mut Reservation> {
        let stored = self.reservations.get_mut(&id).ok_or(StoreError::Missing {
            entity: "reservation",
            id,
        })?;
        if stored.state != ReservationState::Confirmed {
            return Err(StoreError::VersionConflict {
                entity: "reservation",
                id,
                expected: 0,
            });
        }
        Ok(stored)
    }
}

/// Every store trait over in-process tables behind one lock.
///
/// Holding a single lock for a whole ledger commit is what makes the commit atomic and
/// the per-traveler uniqueness check race-free.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_next_commit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next ledger commit fail with a backend error before writing anything
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub async fn trip(&self, id: Uuid) -> Option<Trip> {
        self.tables.lock().await.trips.get(&id).cloned()
    }

    pub async fn reservation(&self, id: Uuid) -> Option<Reservation> {
        self.tables.lock().await.reservations.get(&id).cloned()
    }

    /// Overwrite a trip as-is, version included
    pub async fn put_trip(&self, trip: Trip) {
        self.tables.lock().await.trips.insert(trip.id, trip);
    }
}

#[async_trait]
impl TripStore for MemoryStore {
    async fn insert(&self, trip: &Trip) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.trips.contains_key(&trip.id) {
            return Err(StoreError::UniqueViolation(format!("trip {}", trip.id)));
        }
        tables.trips.insert(trip.id, trip.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> StoreResult<Option<Trip>> {
        Ok(self.trip(id).await)
    }

    async fn save(&self, trip: &Trip, expected_version: i64) -> StoreResult<i64> {
        let mut tables = self.tables.lock().await;
        let stored = tables.trips.get_mut(&trip.id).ok_or(StoreError::Missing {
            entity: "trip",
            id: trip.id,
        })?;

        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                entity: "trip",
                id: trip.id,
                expected: expected_version,
            });
        }

        let mut updated = trip.clone();
        updated.version = expected_version + 1;
        *stored = updated;
        Ok(expected_version + 1)
    }

    async fn find_by_vehicle_and_state_in(
        &self,
        vehicle_id: Uuid,
        states: &[TripState],
    ) -> StoreResult<Vec<Trip>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .trips
            .values()
            .filter(|t| t.vehicle_id == vehicle_id && states.contains(&t.state))
            .cloned()
            .collect())
    }

    async fn find_by_driver(&self, driver_id: Uuid) -> StoreResult<Vec<Trip>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .trips
            .values()
            .filter(|t| t.driver_id == driver_id)
            .cloned()
            .collect())
    }

    async fn find_not_started_before(&self, deadline: DateTime<Utc>) -> StoreResult<Vec<Trip>> {
        let tables = self.tables.lock().await;
        let mut trips: Vec<_> = tables
            .trips
            .values()
            .filter(|t| t.state.is_open() && t.started_at.is_none() && t.departure_at < deadline)
            .cloned()
            .collect();
        trips.sort_by(|a, b| a.departure_at.cmp(&b.departure_at));
        Ok(trips)
    }

    async fn find_in_progress_started_before(
        &self,
        limit: DateTime<Utc>,
    ) -> StoreResult<Vec<Trip>> {
        let tables = self.tables.lock().await;
        let mut trips: Vec<_> = tables
            .trips
            .values()
            .filter(|t| {
                t.state == TripState::InProgress
                    && t.started_at.unwrap_or(t.departure_at) < limit
            })
            .cloned()
            .collect();
        trips.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(trips)
    }

    async fn count_auto_closed_by_driver(&self, driver_id: Uuid) -> StoreResult<u32> {
        let tables = self.tables.lock().await;
        Ok(tables
            .trips
            .values()
            .filter(|t| t.driver_id == driver_id && t.closed_automatically)
            .count() as u32)
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn load(&self, id: Uuid) -> StoreResult<Option<Reservation>> {
        Ok(self.reservation(id).await)
    }

    async fn set_attendance(&self, id: Uuid, attendance: Attendance) -> StoreResult<Reservation> {
        let mut tables = self.tables.lock().await;
        let stored = tables.confirmed_mut(id)?;
        stored.attendance = attendance;
        Ok(stored.clone())
    }

    async fn set_payment_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        new: PaymentStatus,
    ) -> StoreResult<Reservation> {
        let mut tables = self.tables.lock().await;
        let stored = tables.confirmed_mut(id)?;
        if stored.payment_status != expected {
            return Err(StoreError::VersionConflict {
                entity: "reservation",
                id,
                expected: 0,
            });
        }
        stored.payment_status = new;
        Ok(stored.clone())
    }

    async fn set_rating_eligible(&self, id: Uuid) -> StoreResult<Reservation> {
        let mut tables = self.tables.lock().await;
        let stored = tables.confirmed_mut(id)?;
        stored.rating_eligible = true;
        Ok(stored.clone())
    }

    async fn find_by_trip_and_traveler(
        &self,
        trip_id: Uuid,
        traveler_id: Uuid,
    ) -> StoreResult<Vec<Reservation>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .reservations
            .values()
            .filter(|r| r.trip_id == trip_id && r.traveler_id == traveler_id)
            .cloned()
            .collect())
    }

    async fn find_by_trip(&self, trip_id: Uuid) -> StoreResult<Vec<Reservation>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .reservations
            .values()
            .filter(|r| r.trip_id == trip_id)
            .cloned()
            .collect())
    }

    async fn find_by_traveler(&self, traveler_id: Uuid) -> StoreResult<Vec<Reservation>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .reservations
            .values()
            .filter(|r| r.traveler_id == traveler_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append(&self, entry: &ReservationHistoryEntry) -> StoreResult<i64> {
        Ok(self.tables.lock().await.append(entry))
    }

    async fn find_by_trip(&self, trip_id: Uuid) -> StoreResult<Vec<ReservationHistoryEntry>> {
        let tables = self.tables.lock().await;
        let mut entries: Vec<_> = tables
            .history
            .iter()
            .filter(|e| e.trip_id == trip_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(entries)
    }
}

#[async_trait]
impl ViolationStore for MemoryStore {
    async fn save(&self, violation: &ConductorViolation) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.violations.insert(violation.id, violation.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> StoreResult<Option<ConductorViolation>> {
        Ok(self.tables.lock().await.violations.get(&id).cloned())
    }

    async fn find_active_by_driver(&self, driver_id: Uuid) -> StoreResult<Vec<ConductorViolation>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .violations
            .values()
            .filter(|v| v.driver_id == driver_id && v.active)
            .cloned()
            .collect())
    }

    async fn find_expired_as_of(&self, at: DateTime<Utc>) -> StoreResult<Vec<ConductorViolation>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .violations
            .values()
            .filter(|v| v.active && v.is_expired_at(at))
            .cloned()
            .collect())
    }

    async fn find_by_driver(&self, driver_id: Uuid) -> StoreResult<Vec<ConductorViolation>> {
        let tables = self.tables.lock().await;
        let mut violations: Vec<_> = tables
            .violations
            .values()
            .filter(|v| v.driver_id == driver_id)
            .cloned()
            .collect();
        violations.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        Ok(violations)
    }
}

#[async_trait]
impl ReservationLedger for MemoryStore {
    async fn commit(&self, change: ReservationChange) -> StoreResult<CommittedChange> {
        let mut tables = self.tables.lock().await;
        let reservation = &change.reservation;

        // 1. Check everything before writing anything
        if let Some(update) = &change.trip_update {
            let stored = tables.trips.get(&update.trip.id).ok_or(StoreError::Missing {
                entity: "trip",
                id: update.trip.id,
            })?;
            if stored.version != update.expected_version {
                return Err(StoreError::VersionConflict {
                    entity: "trip",
                    id: update.trip.id,
                    expected: update.expected_version,
                });
            }
        }

        match change.expected_state {
            Some(expected) => {
                let stored = tables
                    .reservations
                    .get(&reservation.id)
                    .ok_or(StoreError::Missing {
                        entity: "reservation",
                        id: reservation.id,
                    })?;
                if stored.state != expected {
                    return Err(StoreError::VersionConflict {
                        entity: "reservation",
                        id: reservation.id,
                        expected: 0,
                    });
                }
            }
            None => {
                let duplicate = tables.reservations.values().any(|r| {
                    r.id == reservation.id
                        || (r.trip_id == reservation.trip_id
                            && r.traveler_id == reservation.traveler_id
                            && r.state.holds_slot())
                });
                if duplicate {
                    return Err(StoreError::UniqueViolation(format!(
                        "reservation for traveler {} on trip {}",
                        reservation.traveler_id, reservation.trip_id
                    )));
                }
            }
        }

        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("injected commit failure".into()));
        }

        // 2. Write
        let trip_version = change.trip_update.map(|update| {
            let version = update.expected_version + 1;
            let mut trip = update.trip;
            trip.version = version;
            tables.trips.insert(trip.id, trip);
            version
        });
        let stored = if change.expected_state.is_some() {
            // Payment, attendance and rating stay as stored
            let stored = tables
                .reservations
                .get_mut(&reservation.id)
                .ok_or(StoreError::Missing {
                    entity: "reservation",
                    id: reservation.id,
                })?;
            stored.state = reservation.state;
            stored.rejection_reason = reservation.rejection_reason.clone();
            if change.refund_if_paid && stored.payment_status == PaymentStatus::Paid {
                stored.payment_status = PaymentStatus::RefundPending;
            }
            stored.clone()
        } else {
            tables.reservations.insert(reservation.id, reservation.clone());
            reservation.clone()
        };
        let history_sequence = tables.append(&change.history);

        Ok(CommittedChange {
            reservation: stored,
            trip_version,
            history_sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rumbo_core::repository::TripUpdate;
    use rumbo_shared::{ReservationState, Route, ViolationType};

    fn trip() -> Trip {
        let now = Utc::now();
        Trip::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Route::new(Uuid::new_v4(), Uuid::new_v4()),
            now + Duration::hours(1),
            1200,
            2,
            now,
        )
    }

    fn entry(reservation: &Reservation, prior: Option<ReservationState>) -> ReservationHistoryEntry {
        ReservationHistoryEntry {
            id: Uuid::new_v4(),
            sequence: 0,
            reservation_id: reservation.id,
            trip_id: reservation.trip_id,
            driver_id: Uuid::new_v4(),
            traveler_id: reservation.traveler_id,
            actor_id: reservation.traveler_id,
            occurred_at: Utc::now(),
            prior_state: prior,
            new_state: reservation.state,
        }
    }

    fn new_reservation(reservation: &Reservation) -> ReservationChange {
        ReservationChange {
            reservation: reservation.clone(),
            expected_state: None,
            refund_if_paid: false,
            trip_update: None,
            history: entry(reservation, None),
        }
    }

    #[tokio::test]
    async fn test_trip_save_is_version_checked() {
        let store = MemoryStore::new();
        let trip = trip();
        store.insert(&trip).await.unwrap();

        assert_eq!(TripStore::save(&store, &trip, 0).await.unwrap(), 1);
        let err = TripStore::save(&store, &trip, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 0, .. }));
        assert_eq!(store.trip(trip.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_second_live_reservation_is_unique_violation() {
        let store = MemoryStore::new();
        let trip = trip();
        store.insert(&trip).await.unwrap();
        let traveler = Uuid::new_v4();

        let first = Reservation::new(trip.id, traveler, Utc::now());
        store.commit(new_reservation(&first)).await.unwrap();

        let second = Reservation::new(trip.id, traveler, Utc::now());
        let err = store.commit(new_reservation(&second)).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));

        // Cancelled reservations no longer hold the slot
        let mut cancelled = first.clone();
        cancelled.state = ReservationState::CancelledByTraveler;
        store
            .commit(ReservationChange {
                history: entry(&cancelled, Some(ReservationState::Pending)),
                reservation: cancelled,
                expected_state: Some(ReservationState::Pending),
                refund_if_paid: true,
                trip_update: None,
            })
            .await
            .unwrap();
        store.commit(new_reservation(&second)).await.unwrap();
    }

    #[tokio::test]
    async fn test_conflicting_commit_writes_nothing() {
        let store = MemoryStore::new();
        let mut trip = trip();
        store.insert(&trip).await.unwrap();

        let mut reservation = Reservation::new(trip.id, Uuid::new_v4(), Utc::now());
        store.commit(new_reservation(&reservation)).await.unwrap();

        trip.seats_remaining = 1;
        reservation.state = ReservationState::Confirmed;
        let err = store
            .commit(ReservationChange {
                history: entry(&reservation, Some(ReservationState::Pending)),
                reservation: reservation.clone(),
                expected_state: Some(ReservationState::Pending),
                refund_if_paid: false,
                trip_update: Some(TripUpdate {
                    trip,
                    expected_version: 7,
                }),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { entity: "trip", .. }));

        assert_eq!(store.reservation(reservation.id).await.unwrap().state, ReservationState::Pending);
        assert_eq!(HistoryStore::find_by_trip(&store, reservation.trip_id).await.unwrap().len(), 1);
    }

    async fn confirmed(store: &MemoryStore, trip: &Trip) -> Reservation {
        let pending = Reservation::new(trip.id, Uuid::new_v4(), Utc::now());
        store.commit(new_reservation(&pending)).await.unwrap();

        let mut confirmed = pending.clone();
        confirmed.state = ReservationState::Confirmed;
        store
            .commit(ReservationChange {
                history: entry(&confirmed, Some(ReservationState::Pending)),
                reservation: confirmed.clone(),
                expected_state: Some(ReservationState::Pending),
                refund_if_paid: false,
                trip_update: None,
            })
            .await
            .unwrap();
        confirmed
    }

    #[tokio::test]
    async fn test_field_setters_need_confirmed_reservation() {
        let store = MemoryStore::new();
        let trip = trip();
        store.insert(&trip).await.unwrap();

        let pending = Reservation::new(trip.id, Uuid::new_v4(), Utc::now());
        store.commit(new_reservation(&pending)).await.unwrap();
        let err = store.set_rating_eligible(pending.id).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { entity: "reservation", .. }));

        let reservation = confirmed(&store, &trip).await;
        let marked = store.set_attendance(reservation.id, Attendance::Present).await.unwrap();
        assert_eq!(marked.attendance, Attendance::Present);
        assert_eq!(marked.state, ReservationState::Confirmed);

        let err = store.set_attendance(Uuid::new_v4(), Attendance::Present).await.unwrap_err();
        assert!(matches!(err, StoreError::Missing { .. }));
    }

    #[tokio::test]
    async fn test_payment_status_is_compare_and_set() {
        let store = MemoryStore::new();
        let trip = trip();
        store.insert(&trip).await.unwrap();
        let reservation = confirmed(&store, &trip).await;

        store
            .set_payment_status(reservation.id, PaymentStatus::Unpaid, PaymentStatus::Paid)
            .await
            .unwrap();
        let err = store
            .set_payment_status(reservation.id, PaymentStatus::Unpaid, PaymentStatus::Paid)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        // Another field's write keeps the payment status
        store.set_attendance(reservation.id, Attendance::Absent).await.unwrap();
        assert_eq!(
            store.reservation(reservation.id).await.unwrap().payment_status,
            PaymentStatus::Paid
        );
    }

    #[tokio::test]
    async fn test_commit_refunds_payment_made_after_snapshot() {
        let store = MemoryStore::new();
        let trip = trip();
        store.insert(&trip).await.unwrap();
        let snapshot = confirmed(&store, &trip).await;

        store
            .set_payment_status(snapshot.id, PaymentStatus::Unpaid, PaymentStatus::Paid)
            .await
            .unwrap();

        let mut cancelled = snapshot.clone();
        cancelled.state = ReservationState::CancelledByTraveler;
        let committed = store
            .commit(ReservationChange {
                history: entry(&cancelled, Some(ReservationState::Confirmed)),
                reservation: cancelled,
                expected_state: Some(ReservationState::Confirmed),
                refund_if_paid: true,
                trip_update: None,
            })
            .await
            .unwrap();

        assert_eq!(committed.reservation.state, ReservationState::CancelledByTraveler);
        assert_eq!(committed.reservation.payment_status, PaymentStatus::RefundPending);
        assert_eq!(
            store.reservation(snapshot.id).await.unwrap().payment_status,
            PaymentStatus::RefundPending
        );
    }

    #[tokio::test]
    async fn test_expired_violation_queries() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let driver = Uuid::new_v4();
        let violation = ConductorViolation {
            id: Uuid::new_v4(),
            driver_id: driver,
            trip_id: None,
            kind: ViolationType::MinorDelay,
            weight: 1,
            occurred_at: now,
            minutes_late: Some(12),
            active: true,
            expires_at: now + Duration::days(30),
            description: "late".into(),
        };
        ViolationStore::save(&store, &violation).await.unwrap();

        assert!(store.find_expired_as_of(now + Duration::days(29)).await.unwrap().is_empty());
        assert_eq!(store.find_expired_as_of(now + Duration::days(31)).await.unwrap().len(), 1);
        assert_eq!(store.find_active_by_driver(driver).await.unwrap().len(), 1);
    }
}
