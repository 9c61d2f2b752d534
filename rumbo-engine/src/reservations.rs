use std::sync::Arc;

use async_trait::async_trait;
use rumbo_core::clock::Clock;
use rumbo_core::notification::NotificationSink;
use rumbo_core::repository::{
    ReservationChange, ReservationLedger, ReservationStore, StoreError, TripStore, TripUpdate,
};
use rumbo_core::rules::EngineRules;
use rumbo_core::signals::{SeatSignal, SeatSignalHandler, TripReservations};
use rumbo_core::{EngineError, EngineResult};
use rumbo_shared::{
    Attendance, NotificationIntent, NotificationKind, PaymentStatus, Reservation,
    ReservationState, Trip, TripState,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::history::ReservationHistoryRecorder;

/// Driver's answer to a pending reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Confirm,
    Reject { reason: String },
}

impl Decision {
    fn target_state(&self) -> ReservationState {
        match self {
            Decision::Confirm => ReservationState::Confirmed,
            Decision::Reject { .. } => ReservationState::Rejected,
        }
    }
}

/// Owns the reservation state machine and the seat bookkeeping that goes with it
pub struct ReservationManager {
    trips: Arc<dyn TripStore>,
    reservations: Arc<dyn ReservationStore>,
    ledger: Arc<dyn ReservationLedger>,
    history: Arc<ReservationHistoryRecorder>,
    notifier: Arc<dyn NotificationSink>,
    signals: Arc<dyn SeatSignalHandler>,
    clock: Arc<dyn Clock>,
    rules: Arc<EngineRules>,
}

impl ReservationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trips: Arc<dyn TripStore>,
        reservations: Arc<dyn ReservationStore>,
        ledger: Arc<dyn ReservationLedger>,
        history: Arc<ReservationHistoryRecorder>,
        notifier: Arc<dyn NotificationSink>,
        signals: Arc<dyn SeatSignalHandler>,
        clock: Arc<dyn Clock>,
        rules: Arc<EngineRules>,
    ) -> Self {
        Self {
            trips,
            reservations,
            ledger,
            history,
            notifier,
            signals,
            clock,
            rules,
        }
    }

    /// Ask for a seat on a trip. The seat is only taken once the driver confirms.
    pub async fn request(&self, trip_id: Uuid, traveler_id: Uuid) -> EngineResult<Reservation> {
        // 1. Trip and traveler present
        let trip = self.load_trip(trip_id).await?;
        if traveler_id.is_nil() {
            return Err(EngineError::Validation("Traveler id is required".into()));
        }
        if traveler_id == trip.driver_id {
            return Err(EngineError::Validation("Drivers cannot reserve their own trip".into()));
        }

        // 2. One live reservation per traveler and trip
        let existing = self
            .reservations
            .find_by_trip_and_traveler(trip_id, traveler_id)
            .await?;
        if existing.iter().any(|r| r.state.holds_slot()) {
            return Err(EngineError::AlreadyExists(format!(
                "Reservation for traveler {} on trip {}",
                traveler_id, trip_id
            )));
        }

        // 3. Seats left
        if trip.seats_remaining == 0 {
            return Err(EngineError::CapacityExhausted(trip_id));
        }

        // 4. Not departed yet
        let now = self.clock.now();
        if trip.has_departed(now) {
            return Err(EngineError::AlreadyDeparted(trip_id));
        }

        // 5. Still taking requests; a FULL trip with a seat back counts as open
        if !trip.state.is_open() {
            return Err(EngineError::invalid_transition(trip.state, ReservationState::Pending));
        }

        let reservation = Reservation::new(trip_id, traveler_id, now);
        let entry = self.history.entry_for(
            &reservation,
            trip.driver_id,
            None,
            ReservationState::Pending,
            traveler_id,
            now,
        );

        self.ledger
            .commit(ReservationChange {
                reservation: reservation.clone(),
                expected_state: None,
                refund_if_paid: false,
                trip_update: None,
                history: entry,
            })
            .await?;

        info!(
            "Reservation {} requested by traveler {} on trip {}",
            reservation.id, traveler_id, trip_id
        );
        self.notifier.emit(
            NotificationIntent::for_trip(trip.driver_id, NotificationKind::ReservationRequested, trip_id, now)
                .with_reservation(reservation.id)
                .with_payload(serde_json::json!({ "traveler_id": traveler_id })),
        );

        Ok(reservation)
    }

    /// Confirm or reject a pending reservation as the trip's driver
    pub async fn decide(
        &self,
        reservation_id: Uuid,
        driver_id: Uuid,
        decision: Decision,
    ) -> EngineResult<Reservation> {
        let reservation = self.load_reservation(reservation_id).await?;
        let trip = self.load_trip(reservation.trip_id).await?;

        if trip.driver_id != driver_id {
            return Err(EngineError::Unauthorized(format!(
                "Driver {} does not own trip {}",
                driver_id, trip.id
            )));
        }
        if reservation.state != ReservationState::Pending {
            return Err(EngineError::invalid_transition(reservation.state, decision.target_state()));
        }

        match decision {
            Decision::Confirm => self.confirm(reservation, driver_id).await,
            Decision::Reject { reason } => self.reject(reservation, &trip, driver_id, reason).await,
        }
    }

    async fn confirm(&self, reservation: Reservation, driver_id: Uuid) -> EngineResult<Reservation> {
        let trip_id = reservation.trip_id;

        for attempt in 0..=self.rules.version_retry_limit {
            // Re-read on every attempt so a lost race sees the winner's seat count
            let mut trip = self.load_trip(trip_id).await?;
            if trip.seats_remaining == 0 {
                return Err(EngineError::CapacityExhausted(trip_id));
            }
            if !trip.state.is_open() {
                return Err(EngineError::invalid_transition(trip.state, ReservationState::Confirmed));
            }

            let expected_version = trip.version;
            trip.take_seat();
            trip.sync_seat_state();

            let now = self.clock.now();
            let mut confirmed = reservation.clone();
            confirmed.state = ReservationState::Confirmed;

            let entry = self.history.entry_for(
                &confirmed,
                trip.driver_id,
                Some(ReservationState::Pending),
                ReservationState::Confirmed,
                driver_id,
                now,
            );

            let result = self
                .ledger
                .commit(ReservationChange {
                    reservation: confirmed.clone(),
                    expected_state: Some(ReservationState::Pending),
                    refund_if_paid: false,
                    trip_update: Some(TripUpdate {
                        trip: trip.clone(),
                        expected_version,
                    }),
                    history: entry,
                })
                .await;

            match result {
                Ok(committed) => {
                    let confirmed = committed.reservation;
                    info!(
                        "Reservation {} confirmed on trip {} ({} seat(s) left)",
                        confirmed.id, trip_id, trip.seats_remaining
                    );

                    if trip.seats_remaining == 0 {
                        self.send_signal(SeatSignal::SeatsExhausted { trip_id }).await;
                    }

                    self.notifier.emit(
                        NotificationIntent::for_trip(
                            confirmed.traveler_id,
                            NotificationKind::ReservationApproved,
                            trip_id,
                            now,
                        )
                        .with_reservation(confirmed.id),
                    );
                    return Ok(confirmed);
                }
                Err(StoreError::VersionConflict { entity: "trip", .. }) => {
                    debug!(
                        "Trip {} changed under confirmation of {} (attempt {})",
                        trip_id,
                        confirmed.id,
                        attempt + 1
                    );
                }
                Err(StoreError::VersionConflict { .. }) => {
                    return Err(self.moved_on(confirmed.id, ReservationState::Confirmed).await);
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            "Giving up confirming reservation {} after {} version conflicts",
            reservation.id,
            self.rules.version_retry_limit + 1
        );
        Err(EngineError::ConcurrentModification {
            entity: "trip",
            id: trip_id,
        })
    }

    async fn reject(
        &self,
        reservation: Reservation,
        trip: &Trip,
        driver_id: Uuid,
        reason: String,
    ) -> EngineResult<Reservation> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Validation("A rejection reason is required".into()));
        }

        let now = self.clock.now();
        let mut rejected = reservation;
        rejected.state = ReservationState::Rejected;
        rejected.rejection_reason = Some(reason.to_string());

        let entry = self.history.entry_for(
            &rejected,
            trip.driver_id,
            Some(ReservationState::Pending),
            ReservationState::Rejected,
            driver_id,
            now,
        );

        let result = self
            .ledger
            .commit(ReservationChange {
                reservation: rejected.clone(),
                expected_state: Some(ReservationState::Pending),
                refund_if_paid: false,
                trip_update: None,
                history: entry,
            })
            .await;

        let rejected = match result {
            Ok(committed) => committed.reservation,
            Err(StoreError::VersionConflict { .. }) => {
                return Err(self.moved_on(rejected.id, ReservationState::Rejected).await);
            }
            Err(e) => return Err(e.into()),
        };

        info!("Reservation {} rejected on trip {}", rejected.id, trip.id);
        self.notifier.emit(
            NotificationIntent::for_trip(
                rejected.traveler_id,
                NotificationKind::ReservationRejected,
                trip.id,
                now,
            )
            .with_reservation(rejected.id)
            .with_payload(serde_json::json!({ "reason": reason })),
        );

        Ok(rejected)
    }

    /// Withdraw a pending or confirmed reservation as its traveler
    pub async fn cancel_by_traveler(
        &self,
        reservation_id: Uuid,
        traveler_id: Uuid,
    ) -> EngineResult<Reservation> {
        let reservation = self.load_reservation(reservation_id).await?;

        if reservation.traveler_id != traveler_id {
            return Err(EngineError::Unauthorized(format!(
                "Traveler {} does not own reservation {}",
                traveler_id, reservation_id
            )));
        }
        if !reservation.is_active() {
            return Err(EngineError::invalid_transition(
                reservation.state,
                ReservationState::CancelledByTraveler,
            ));
        }

        let prior = reservation.state;
        let releases_seat = prior == ReservationState::Confirmed;
        let trip_id = reservation.trip_id;

        for attempt in 0..=self.rules.version_retry_limit {
            let mut trip = self.load_trip(trip_id).await?;
            if matches!(trip.state, TripState::InProgress | TripState::Finished) {
                return Err(EngineError::AlreadyDeparted(trip_id));
            }

            let now = self.clock.now();
            let trip_update = if releases_seat {
                let expected_version = trip.version;
                if !trip.release_seat() {
                    warn!("Trip {} already at full capacity while releasing a seat", trip_id);
                }
                if !trip.has_departed(now) {
                    trip.sync_seat_state();
                }
                Some(TripUpdate {
                    trip: trip.clone(),
                    expected_version,
                })
            } else {
                None
            };

            let mut cancelled = reservation.clone();
            cancelled.state = ReservationState::CancelledByTraveler;

            let entry = self.history.entry_for(
                &cancelled,
                trip.driver_id,
                Some(prior),
                ReservationState::CancelledByTraveler,
                traveler_id,
                now,
            );

            let result = self
                .ledger
                .commit(ReservationChange {
                    reservation: cancelled.clone(),
                    expected_state: Some(prior),
                    refund_if_paid: true,
                    trip_update,
                    history: entry,
                })
                .await;

            match result {
                Ok(committed) => {
                    let cancelled = committed.reservation;
                    info!(
                        "Reservation {} cancelled by traveler {} (was {})",
                        cancelled.id, traveler_id, prior
                    );

                    if releases_seat {
                        self.send_signal(SeatSignal::SeatReleased { trip_id }).await;
                    }

                    self.notifier.emit(
                        NotificationIntent::for_trip(
                            trip.driver_id,
                            NotificationKind::ReservationCancelled,
                            trip_id,
                            now,
                        )
                        .with_reservation(cancelled.id)
                        .with_payload(serde_json::json!({
                            "traveler_id": traveler_id,
                            "refund_pending": cancelled.payment_status == PaymentStatus::RefundPending,
                        })),
                    );
                    return Ok(cancelled);
                }
                Err(StoreError::VersionConflict { entity: "trip", .. }) => {
                    debug!(
                        "Trip {} changed under cancellation of {} (attempt {})",
                        trip_id,
                        cancelled.id,
                        attempt + 1
                    );
                }
                Err(StoreError::VersionConflict { .. }) => {
                    return Err(self
                        .moved_on(cancelled.id, ReservationState::CancelledByTraveler)
                        .await);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::ConcurrentModification {
            entity: "trip",
            id: trip_id,
        })
    }

    /// Travelers holding a confirmed seat on the trip
    pub async fn confirmed_travelers(&self, trip_id: Uuid) -> EngineResult<Vec<Uuid>> {
        self.load_trip(trip_id).await?;
        let reservations = self.reservations.find_by_trip(trip_id).await?;

        Ok(reservations
            .into_iter()
            .filter(|r| r.state == ReservationState::Confirmed)
            .map(|r| r.traveler_id)
            .collect())
    }

    /// Driver marks whether a confirmed traveler showed up
    pub async fn mark_attendance(
        &self,
        reservation_id: Uuid,
        driver_id: Uuid,
        attendance: Attendance,
    ) -> EngineResult<Reservation> {
        if attendance == Attendance::Unmarked {
            return Err(EngineError::Validation("Attendance must be PRESENT or ABSENT".into()));
        }

        let reservation = self.load_reservation(reservation_id).await?;
        let trip = self.load_trip(reservation.trip_id).await?;

        if trip.driver_id != driver_id {
            return Err(EngineError::Unauthorized(format!(
                "Driver {} does not own trip {}",
                driver_id, trip.id
            )));
        }
        if reservation.state != ReservationState::Confirmed {
            return Err(EngineError::invalid_transition(reservation.state, attendance));
        }

        let opens_at = trip.departure_at - self.rules.attendance_window();
        if self.clock.now() < opens_at {
            return Err(EngineError::Validation(format!(
                "Attendance for trip {} opens at {}",
                trip.id, opens_at
            )));
        }

        let marked = match self.reservations.set_attendance(reservation_id, attendance).await {
            Ok(marked) => marked,
            Err(StoreError::VersionConflict { .. }) => {
                return Err(self.moved_on(reservation_id, attendance).await);
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Reservation {} marked {}", marked.id, attendance);

        Ok(marked)
    }

    /// Traveler reports having paid for a confirmed seat
    pub async fn confirm_payment(
        &self,
        reservation_id: Uuid,
        traveler_id: Uuid,
    ) -> EngineResult<Reservation> {
        let reservation = self.load_reservation(reservation_id).await?;

        if reservation.traveler_id != traveler_id {
            return Err(EngineError::Unauthorized(format!(
                "Traveler {} does not own reservation {}",
                traveler_id, reservation_id
            )));
        }
        if let Some(err) = payment_refused(&reservation) {
            return Err(err);
        }

        let trip = self.load_trip(reservation.trip_id).await?;

        let reservation = match self
            .reservations
            .set_payment_status(reservation_id, PaymentStatus::Unpaid, PaymentStatus::Paid)
            .await
        {
            Ok(paid) => paid,
            Err(StoreError::VersionConflict { .. }) => {
                let current = self.load_reservation(reservation_id).await?;
                return Err(payment_refused(&current).unwrap_or(EngineError::ConcurrentModification {
                    entity: "reservation",
                    id: reservation_id,
                }));
            }
            Err(e) => return Err(e.into()),
        };
        info!("Payment received for reservation {}", reservation.id);

        self.notifier.emit(
            NotificationIntent::for_trip(
                trip.driver_id,
                NotificationKind::PaymentReceived,
                trip.id,
                self.clock.now(),
            )
            .with_reservation(reservation.id)
            .with_payload(serde_json::json!({ "traveler_id": traveler_id })),
        );

        Ok(reservation)
    }

    /// True when the traveler has a pending or confirmed reservation on the trip
    pub async fn has_active_reservation(&self, traveler_id: Uuid, trip_id: Uuid) -> EngineResult<bool> {
        let reservations = self
            .reservations
            .find_by_trip_and_traveler(trip_id, traveler_id)
            .await?;
        Ok(reservations.iter().any(Reservation::is_active))
    }

    /// Reservations still needing the traveler's attention, soonest departure first:
    /// pending, rejected, and confirmed but unpaid.
    pub async fn active_for_traveler(&self, traveler_id: Uuid) -> EngineResult<Vec<Reservation>> {
        let reservations = self.reservations.find_by_traveler(traveler_id).await?;

        let mut dated = Vec::new();
        for reservation in reservations {
            let wanted = match reservation.state {
                ReservationState::Pending | ReservationState::Rejected => true,
                ReservationState::Confirmed => reservation.payment_status == PaymentStatus::Unpaid,
                ReservationState::CancelledByTraveler => false,
            };
            if !wanted {
                continue;
            }
            let trip = self.load_trip(reservation.trip_id).await?;
            dated.push((trip.departure_at, reservation));
        }

        dated.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(dated.into_iter().map(|(_, r)| r).collect())
    }

    pub async fn confirmed_for_traveler(&self, traveler_id: Uuid) -> EngineResult<Vec<Reservation>> {
        self.for_traveler_in(traveler_id, ReservationState::Confirmed).await
    }

    pub async fn cancelled_for_traveler(&self, traveler_id: Uuid) -> EngineResult<Vec<Reservation>> {
        self.for_traveler_in(traveler_id, ReservationState::CancelledByTraveler).await
    }

    /// Every reservation on the trip regardless of state
    pub async fn for_trip(&self, trip_id: Uuid) -> EngineResult<Vec<Reservation>> {
        let mut reservations = self.reservations.find_by_trip(trip_id).await?;
        reservations.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(reservations)
    }

    pub async fn get(&self, reservation_id: Uuid) -> EngineResult<Reservation> {
        self.load_reservation(reservation_id).await
    }

    async fn for_traveler_in(
        &self,
        traveler_id: Uuid,
        state: ReservationState,
    ) -> EngineResult<Vec<Reservation>> {
        let mut reservations: Vec<_> = self
            .reservations
            .find_by_traveler(traveler_id)
            .await?
            .into_iter()
            .filter(|r| r.state == state)
            .collect();
        reservations.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(reservations)
    }

    /// FULL/AVAILABLE already moved with the seat write; a failed signal is only logged
    async fn send_signal(&self, signal: SeatSignal) {
        if let Err(e) = self.signals.on_seat_signal(signal).await {
            warn!("Seat signal {:?} was not applied: {}", signal, e);
        }
    }

    /// Error for a reservation whose stored state changed between read and write
    async fn moved_on(&self, reservation_id: Uuid, target: impl ToString + Send) -> EngineError {
        match self.reservations.load(reservation_id).await {
            Ok(Some(current)) => EngineError::invalid_transition(current.state, target),
            Ok(None) => EngineError::NotFound {
                entity: "reservation",
                id: reservation_id,
            },
            Err(e) => e.into(),
        }
    }

    async fn load_trip(&self, trip_id: Uuid) -> EngineResult<Trip> {
        self.trips.load(trip_id).await?.ok_or(EngineError::NotFound {
            entity: "trip",
            id: trip_id,
        })
    }

    async fn load_reservation(&self, reservation_id: Uuid) -> EngineResult<Reservation> {
        self.reservations
            .load(reservation_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "reservation",
                id: reservation_id,
            })
    }

    async fn confirmed_of(&self, trip_id: Uuid) -> EngineResult<Vec<Reservation>> {
        Ok(self
            .reservations
            .find_by_trip(trip_id)
            .await?
            .into_iter()
            .filter(|r| r.state == ReservationState::Confirmed)
            .collect())
    }
}

/// Why a payment cannot be recorded against the reservation as it stands, if it cannot
fn payment_refused(reservation: &Reservation) -> Option<EngineError> {
    if reservation.state != ReservationState::Confirmed {
        return Some(EngineError::invalid_transition(reservation.state, PaymentStatus::Paid));
    }
    match reservation.payment_status {
        PaymentStatus::Unpaid => None,
        PaymentStatus::Paid => Some(EngineError::AlreadyExists(format!(
            "Payment for reservation {}",
            reservation.id
        ))),
        PaymentStatus::RefundPending => Some(EngineError::invalid_transition(
            PaymentStatus::RefundPending,
            PaymentStatus::Paid,
        )),
    }
}

#[async_trait]
impl TripReservations for ReservationManager {
    async fn confirmed_on(&self, trip_id: Uuid) -> EngineResult<Vec<Reservation>> {
        self.confirmed_of(trip_id).await
    }

    async fn open_on(&self, trip_id: Uuid) -> EngineResult<Vec<Reservation>> {
        Ok(self
            .reservations
            .find_by_trip(trip_id)
            .await?
            .into_iter()
            .filter(Reservation::is_active)
            .collect())
    }

    async fn mark_rating_eligible(&self, trip_id: Uuid) -> EngineResult<Vec<Reservation>> {
        let mut eligible = Vec::new();
        for reservation in self.confirmed_of(trip_id).await? {
            if reservation.rating_eligible {
                eligible.push(reservation);
                continue;
            }
            match self.reservations.set_rating_eligible(reservation.id).await {
                Ok(marked) => eligible.push(marked),
                Err(StoreError::VersionConflict { .. }) => {
                    debug!("Reservation {} left CONFIRMED before rating", reservation.id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!("{} reservation(s) on trip {} now rating eligible", eligible.len(), trip_id);
        Ok(eligible)
    }

    async fn flag_refunds(&self, trip_id: Uuid) -> EngineResult<Vec<Reservation>> {
        let mut flagged = Vec::new();
        for reservation in self.confirmed_of(trip_id).await? {
            if reservation.payment_status != PaymentStatus::Paid {
                continue;
            }
            match self
                .reservations
                .set_payment_status(reservation.id, PaymentStatus::Paid, PaymentStatus::RefundPending)
                .await
            {
                Ok(flagged_row) => flagged.push(flagged_row),
                Err(StoreError::VersionConflict { .. }) => {
                    debug!("Reservation {} changed before its refund was flagged", reservation.id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !flagged.is_empty() {
            info!("{} paid reservation(s) on trip {} pending refund", flagged.len(), trip_id);
        }
        Ok(flagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalRelay;
    use chrono::{Duration, Utc};
    use rumbo_core::clock::ManualClock;
    use rumbo_core::repository::StoreResult;
    use rumbo_shared::Route;
    use rumbo_store::{MemoryStore, RecordingNotificationSink};
    use std::sync::Mutex;

    #[derive(Default)]
    struct SignalLog {
        seen: Mutex<Vec<SeatSignal>>,
    }

    #[async_trait]
    impl SeatSignalHandler for SignalLog {
        async fn on_seat_signal(&self, signal: SeatSignal) -> EngineResult<()> {
            self.seen.lock().unwrap().push(signal);
            Ok(())
        }
    }

    /// Signal handler whose trip write always fails
    struct RefusingSignals;

    #[async_trait]
    impl SeatSignalHandler for RefusingSignals {
        async fn on_seat_signal(&self, _signal: SeatSignal) -> EngineResult<()> {
            Err(EngineError::Storage("trip write refused".into()))
        }
    }

    /// Reservation store that moves the stored payment status once, right after handing
    /// out a snapshot, as a concurrent payment or refund would
    struct PaymentAfterLoad {
        inner: Arc<MemoryStore>,
        change: Mutex<Option<(PaymentStatus, PaymentStatus)>>,
    }

    impl PaymentAfterLoad {
        fn new(inner: Arc<MemoryStore>, from: PaymentStatus, to: PaymentStatus) -> Self {
            Self {
                inner,
                change: Mutex::new(Some((from, to))),
            }
        }
    }

    #[async_trait]
    impl ReservationStore for PaymentAfterLoad {
        async fn load(&self, id: Uuid) -> StoreResult<Option<Reservation>> {
            let snapshot = self.inner.reservation(id).await;
            let change = self.change.lock().unwrap().take();
            if let Some((from, to)) = change {
                self.inner.set_payment_status(id, from, to).await?;
            }
            Ok(snapshot)
        }

        async fn set_attendance(&self, id: Uuid, attendance: Attendance) -> StoreResult<Reservation> {
            self.inner.set_attendance(id, attendance).await
        }

        async fn set_payment_status(
            &self,
            id: Uuid,
            expected: PaymentStatus,
            new: PaymentStatus,
        ) -> StoreResult<Reservation> {
            self.inner.set_payment_status(id, expected, new).await
        }

        async fn set_rating_eligible(&self, id: Uuid) -> StoreResult<Reservation> {
            self.inner.set_rating_eligible(id).await
        }

        async fn find_by_trip_and_traveler(
            &self,
            trip_id: Uuid,
            traveler_id: Uuid,
        ) -> StoreResult<Vec<Reservation>> {
            self.inner.find_by_trip_and_traveler(trip_id, traveler_id).await
        }

        async fn find_by_trip(&self, trip_id: Uuid) -> StoreResult<Vec<Reservation>> {
            ReservationStore::find_by_trip(&*self.inner, trip_id).await
        }

        async fn find_by_traveler(&self, traveler_id: Uuid) -> StoreResult<Vec<Reservation>> {
            self.inner.find_by_traveler(traveler_id).await
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        sink: Arc<RecordingNotificationSink>,
        signals: Arc<SignalLog>,
        manager: ReservationManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sink = Arc::new(RecordingNotificationSink::new());
        let signals = Arc::new(SignalLog::default());
        let history = Arc::new(ReservationHistoryRecorder::new(store.clone(), clock.clone()));

        let manager = ReservationManager::new(
            store.clone(),
            store.clone(),
            store.clone(),
            history,
            sink.clone(),
            signals.clone(),
            clock.clone(),
            Arc::new(EngineRules::default()),
        );

        Fixture {
            store,
            clock,
            sink,
            signals,
            manager,
        }
    }

    /// A second manager over the fixture's store with its own reservation view and signals
    fn manager_with(
        fx: &Fixture,
        reservations: Arc<dyn ReservationStore>,
        signals: Arc<dyn SeatSignalHandler>,
    ) -> ReservationManager {
        ReservationManager::new(
            fx.store.clone(),
            reservations,
            fx.store.clone(),
            Arc::new(ReservationHistoryRecorder::new(fx.store.clone(), fx.clock.clone())),
            fx.sink.clone(),
            signals,
            fx.clock.clone(),
            Arc::new(EngineRules::default()),
        )
    }

    async fn seed_trip(fx: &Fixture, seats: u32) -> Trip {
        let now = fx.clock.now();
        let trip = Trip::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Route::new(Uuid::new_v4(), Uuid::new_v4()),
            now + Duration::hours(3),
            2500,
            seats,
            now,
        );
        fx.store.insert(&trip).await.unwrap();
        trip
    }

    #[tokio::test]
    async fn test_request_creates_pending_without_taking_seat() {
        let fx = fixture();
        let trip = seed_trip(&fx, 2).await;
        let traveler = Uuid::new_v4();

        let reservation = fx.manager.request(trip.id, traveler).await.unwrap();

        assert_eq!(reservation.state, ReservationState::Pending);
        assert_eq!(fx.store.trip(trip.id).await.unwrap().seats_remaining, 2);

        let sent = fx.sink.intents();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient_id, trip.driver_id);
        assert_eq!(sent[0].kind, NotificationKind::ReservationRequested);
    }

    #[tokio::test]
    async fn test_request_preconditions_in_order() {
        let fx = fixture();
        let trip = seed_trip(&fx, 1).await;
        let traveler = Uuid::new_v4();

        let err = fx.manager.request(Uuid::new_v4(), traveler).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "trip", .. }));

        fx.manager.request(trip.id, traveler).await.unwrap();
        let err = fx.manager.request(trip.id, traveler).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));

        fx.clock.advance(Duration::hours(4));
        let err = fx.manager.request(trip.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyDeparted(_)));
    }

    #[tokio::test]
    async fn test_confirm_takes_seat_and_signals_exhaustion() {
        let fx = fixture();
        let trip = seed_trip(&fx, 1).await;
        let reservation = fx.manager.request(trip.id, Uuid::new_v4()).await.unwrap();

        let confirmed = fx
            .manager
            .decide(reservation.id, trip.driver_id, Decision::Confirm)
            .await
            .unwrap();

        assert_eq!(confirmed.state, ReservationState::Confirmed);
        let stored = fx.store.trip(trip.id).await.unwrap();
        assert_eq!(stored.seats_remaining, 0);
        assert_eq!(stored.state, TripState::Full);
        assert_eq!(stored.version, 1);
        assert_eq!(
            fx.signals.seen.lock().unwrap().as_slice(),
            &[SeatSignal::SeatsExhausted { trip_id: trip.id }]
        );

        let err = fx.manager.request(trip.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::CapacityExhausted(_)));
    }

    #[tokio::test]
    async fn test_decide_requires_trip_driver_and_pending() {
        let fx = fixture();
        let trip = seed_trip(&fx, 2).await;
        let reservation = fx.manager.request(trip.id, Uuid::new_v4()).await.unwrap();

        let err = fx
            .manager
            .decide(reservation.id, Uuid::new_v4(), Decision::Confirm)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        fx.manager
            .decide(reservation.id, trip.driver_id, Decision::Confirm)
            .await
            .unwrap();
        let err = fx
            .manager
            .decide(
                reservation.id,
                trip.driver_id,
                Decision::Reject { reason: "changed my mind".into() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_reject_needs_reason_and_keeps_seats() {
        let fx = fixture();
        let trip = seed_trip(&fx, 2).await;
        let reservation = fx.manager.request(trip.id, Uuid::new_v4()).await.unwrap();

        let err = fx
            .manager
            .decide(reservation.id, trip.driver_id, Decision::Reject { reason: "   ".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let rejected = fx
            .manager
            .decide(
                reservation.id,
                trip.driver_id,
                Decision::Reject { reason: "Luggage will not fit".into() },
            )
            .await
            .unwrap();

        assert_eq!(rejected.state, ReservationState::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("Luggage will not fit"));
        assert_eq!(fx.store.trip(trip.id).await.unwrap().seats_remaining, 2);

        // A rejected traveler still holds the slot for this trip
        let err = fx.manager.request(trip.id, rejected.traveler_id).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_cancel_confirmed_releases_seat_and_flags_refund() {
        let fx = fixture();
        let trip = seed_trip(&fx, 1).await;
        let traveler = Uuid::new_v4();
        let reservation = fx.manager.request(trip.id, traveler).await.unwrap();
        fx.manager
            .decide(reservation.id, trip.driver_id, Decision::Confirm)
            .await
            .unwrap();
        fx.manager.confirm_payment(reservation.id, traveler).await.unwrap();

        let err = fx
            .manager
            .cancel_by_traveler(reservation.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        let cancelled = fx.manager.cancel_by_traveler(reservation.id, traveler).await.unwrap();
        assert_eq!(cancelled.state, ReservationState::CancelledByTraveler);
        assert_eq!(cancelled.payment_status, PaymentStatus::RefundPending);
        assert_eq!(fx.store.trip(trip.id).await.unwrap().seats_remaining, 1);
        assert_eq!(
            fx.signals.seen.lock().unwrap().last(),
            Some(&SeatSignal::SeatReleased { trip_id: trip.id })
        );

        // Cancelled reservations free the slot for a fresh request
        assert!(!fx.manager.has_active_reservation(traveler, trip.id).await.unwrap());
        fx.manager.request(trip.id, traveler).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_pending_does_not_touch_seats() {
        let fx = fixture();
        let trip = seed_trip(&fx, 2).await;
        let traveler = Uuid::new_v4();
        let reservation = fx.manager.request(trip.id, traveler).await.unwrap();

        fx.manager.cancel_by_traveler(reservation.id, traveler).await.unwrap();

        let stored = fx.store.trip(trip.id).await.unwrap();
        assert_eq!(stored.seats_remaining, 2);
        assert_eq!(stored.version, 0);
        assert!(fx.signals.seen.lock().unwrap().is_empty());

        let err = fx.manager.cancel_by_traveler(reservation.id, traveler).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_failed_commit_writes_nothing() {
        let fx = fixture();
        let trip = seed_trip(&fx, 2).await;
        let reservation = fx.manager.request(trip.id, Uuid::new_v4()).await.unwrap();

        fx.store.fail_next_commit();
        let err = fx
            .manager
            .decide(reservation.id, trip.driver_id, Decision::Confirm)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));

        let stored = fx.store.trip(trip.id).await.unwrap();
        assert_eq!(stored.seats_remaining, 2);
        assert_eq!(fx.manager.get(reservation.id).await.unwrap().state, ReservationState::Pending);
        assert_eq!(fx.manager.history.for_trip(trip.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_attendance_window_and_ownership() {
        let fx = fixture();
        let trip = seed_trip(&fx, 2).await;
        let traveler = Uuid::new_v4();
        let reservation = fx.manager.request(trip.id, traveler).await.unwrap();
        fx.manager
            .decide(reservation.id, trip.driver_id, Decision::Confirm)
            .await
            .unwrap();

        let err = fx
            .manager
            .mark_attendance(reservation.id, trip.driver_id, Attendance::Present)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        fx.clock.set(trip.departure_at - Duration::minutes(20));

        let err = fx
            .manager
            .mark_attendance(reservation.id, trip.driver_id, Attendance::Unmarked)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = fx
            .manager
            .mark_attendance(reservation.id, traveler, Attendance::Present)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        let marked = fx
            .manager
            .mark_attendance(reservation.id, trip.driver_id, Attendance::Absent)
            .await
            .unwrap();
        assert_eq!(marked.attendance, Attendance::Absent);
        assert_eq!(marked.state, ReservationState::Confirmed);

        // Attendance is not a state transition
        assert_eq!(fx.manager.history.for_trip(trip.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_confirm_payment_once() {
        let fx = fixture();
        let trip = seed_trip(&fx, 2).await;
        let traveler = Uuid::new_v4();
        let reservation = fx.manager.request(trip.id, traveler).await.unwrap();

        let err = fx.manager.confirm_payment(reservation.id, traveler).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

        fx.manager
            .decide(reservation.id, trip.driver_id, Decision::Confirm)
            .await
            .unwrap();
        let paid = fx.manager.confirm_payment(reservation.id, traveler).await.unwrap();
        assert_eq!(paid.payment_status, PaymentStatus::Paid);

        let err = fx.manager.confirm_payment(reservation.id, traveler).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));

        let last = fx.sink.intents().pop().unwrap();
        assert_eq!(last.kind, NotificationKind::PaymentReceived);
        assert_eq!(last.recipient_id, trip.driver_id);
    }

    #[tokio::test]
    async fn test_traveler_listings() {
        let fx = fixture();
        let traveler = Uuid::new_v4();
        let later = seed_trip(&fx, 2).await;
        fx.clock.advance(Duration::minutes(1));
        let sooner = {
            let now = fx.clock.now();
            let trip = Trip::new(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Route::new(Uuid::new_v4(), Uuid::new_v4()),
                now + Duration::hours(1),
                1800,
                2,
                now,
            );
            fx.store.insert(&trip).await.unwrap();
            trip
        };
        let paid_trip = seed_trip(&fx, 2).await;

        let on_later = fx.manager.request(later.id, traveler).await.unwrap();
        let on_sooner = fx.manager.request(sooner.id, traveler).await.unwrap();
        let on_paid = fx.manager.request(paid_trip.id, traveler).await.unwrap();
        fx.manager
            .decide(on_paid.id, paid_trip.driver_id, Decision::Confirm)
            .await
            .unwrap();
        fx.manager.confirm_payment(on_paid.id, traveler).await.unwrap();

        let active: Vec<_> = fx
            .manager
            .active_for_traveler(traveler)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(active, vec![on_sooner.id, on_later.id]);

        let confirmed = fx.manager.confirmed_for_traveler(traveler).await.unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].id, on_paid.id);

        fx.manager.cancel_by_traveler(on_later.id, traveler).await.unwrap();
        let cancelled = fx.manager.cancelled_for_traveler(traveler).await.unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, on_later.id);

        assert_eq!(
            fx.manager.confirmed_travelers(paid_trip.id).await.unwrap(),
            vec![traveler]
        );
    }

    #[tokio::test]
    async fn test_unconnected_relay_does_not_fail_confirmation() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let history = Arc::new(ReservationHistoryRecorder::new(store.clone(), clock.clone()));
        let manager = ReservationManager::new(
            store.clone(),
            store.clone(),
            store.clone(),
            history,
            Arc::new(RecordingNotificationSink::new()),
            Arc::new(SignalRelay::new()),
            clock.clone(),
            Arc::new(EngineRules::default()),
        );

        let now = clock.now();
        let trip = Trip::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Route::new(Uuid::new_v4(), Uuid::new_v4()),
            now + Duration::hours(2),
            1000,
            1,
            now,
        );
        store.insert(&trip).await.unwrap();

        let reservation = manager.request(trip.id, Uuid::new_v4()).await.unwrap();
        let confirmed = manager
            .decide(reservation.id, trip.driver_id, Decision::Confirm)
            .await
            .unwrap();
        assert_eq!(confirmed.state, ReservationState::Confirmed);
    }

    #[tokio::test]
    async fn test_seat_state_moves_with_seats_when_signals_fail() {
        let fx = fixture();
        let trip = seed_trip(&fx, 1).await;
        let manager = manager_with(&fx, fx.store.clone(), Arc::new(RefusingSignals));
        let traveler = Uuid::new_v4();

        let reservation = manager.request(trip.id, traveler).await.unwrap();
        manager
            .decide(reservation.id, trip.driver_id, Decision::Confirm)
            .await
            .unwrap();
        assert_eq!(fx.store.trip(trip.id).await.unwrap().state, TripState::Full);

        manager.cancel_by_traveler(reservation.id, traveler).await.unwrap();
        let reopened = fx.store.trip(trip.id).await.unwrap();
        assert_eq!(reopened.state, TripState::Available);
        assert_eq!(reopened.seats_remaining, 1);

        manager.request(trip.id, Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_trip_with_free_seat_still_books() {
        let fx = fixture();
        let trip = seed_trip(&fx, 2).await;

        let mut stuck = trip.clone();
        stuck.state = TripState::Full;
        stuck.seats_remaining = 2;
        fx.store.put_trip(stuck).await;

        let reservation = fx.manager.request(trip.id, Uuid::new_v4()).await.unwrap();
        fx.manager
            .decide(reservation.id, trip.driver_id, Decision::Confirm)
            .await
            .unwrap();

        let repaired = fx.store.trip(trip.id).await.unwrap();
        assert_eq!(repaired.seats_remaining, 1);
        assert_eq!(repaired.state, TripState::Available);
    }

    #[tokio::test]
    async fn test_payment_landing_during_cancel_is_refunded() {
        let fx = fixture();
        let trip = seed_trip(&fx, 2).await;
        let traveler = Uuid::new_v4();
        let reservation = fx.manager.request(trip.id, traveler).await.unwrap();
        fx.manager
            .decide(reservation.id, trip.driver_id, Decision::Confirm)
            .await
            .unwrap();

        let pays = Arc::new(PaymentAfterLoad::new(
            fx.store.clone(),
            PaymentStatus::Unpaid,
            PaymentStatus::Paid,
        ));
        let manager = manager_with(&fx, pays, fx.signals.clone());

        let cancelled = manager.cancel_by_traveler(reservation.id, traveler).await.unwrap();
        assert_eq!(cancelled.state, ReservationState::CancelledByTraveler);
        assert_eq!(cancelled.payment_status, PaymentStatus::RefundPending);

        let stored = fx.store.reservation(reservation.id).await.unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::RefundPending);
    }

    #[tokio::test]
    async fn test_attendance_keeps_refund_flagged_meanwhile() {
        let fx = fixture();
        let trip = seed_trip(&fx, 2).await;
        let traveler = Uuid::new_v4();
        let reservation = fx.manager.request(trip.id, traveler).await.unwrap();
        fx.manager
            .decide(reservation.id, trip.driver_id, Decision::Confirm)
            .await
            .unwrap();
        fx.manager.confirm_payment(reservation.id, traveler).await.unwrap();
        fx.clock.set(trip.departure_at - Duration::minutes(10));

        let refunds = Arc::new(PaymentAfterLoad::new(
            fx.store.clone(),
            PaymentStatus::Paid,
            PaymentStatus::RefundPending,
        ));
        let manager = manager_with(&fx, refunds, fx.signals.clone());

        let marked = manager
            .mark_attendance(reservation.id, trip.driver_id, Attendance::Present)
            .await
            .unwrap();
        assert_eq!(marked.attendance, Attendance::Present);
        assert_eq!(marked.payment_status, PaymentStatus::RefundPending);

        let stored = fx.store.reservation(reservation.id).await.unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::RefundPending);
    }

    #[tokio::test]
    async fn test_payment_racing_a_refund_is_refused() {
        let fx = fixture();
        let trip = seed_trip(&fx, 2).await;
        let traveler = Uuid::new_v4();
        let reservation = fx.manager.request(trip.id, traveler).await.unwrap();
        fx.manager
            .decide(reservation.id, trip.driver_id, Decision::Confirm)
            .await
            .unwrap();

        // Someone else records the payment between our read and our write
        let pays = Arc::new(PaymentAfterLoad::new(
            fx.store.clone(),
            PaymentStatus::Unpaid,
            PaymentStatus::Paid,
        ));
        let manager = manager_with(&fx, pays, fx.signals.clone());

        let err = manager.confirm_payment(reservation.id, traveler).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }
}
