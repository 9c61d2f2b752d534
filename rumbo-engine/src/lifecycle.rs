use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumbo_core::clock::Clock;
use rumbo_core::notification::NotificationSink;
use rumbo_core::repository::{StoreError, TripStore};
use rumbo_core::rules::EngineRules;
use rumbo_core::signals::{SeatSignal, SeatSignalHandler, TripReservations};
use rumbo_core::{EngineError, EngineResult};
use rumbo_shared::{
    ConductorViolation, NotificationIntent, NotificationKind, PaymentStatus, Route, Trip,
    TripState, ViolationType,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::violations::ViolationTracker;

/// Everything needed to publish a trip
#[derive(Debug, Clone)]
pub struct PublishTrip {
    pub driver_id: Uuid,
    pub vehicle_id: Uuid,
    /// Seats in the vehicle including the driver's
    pub vehicle_capacity: u32,
    pub route: Route,
    pub departure_at: DateTime<Utc>,
    pub price_cents: i64,
    pub seats: u32,
}

/// A trip transition together with the infraction it produced, if any
#[derive(Debug, Clone, Serialize)]
pub struct TripTransition {
    pub trip: Trip,
    pub violation: Option<ConductorViolation>,
}

/// Owns the trip state machine
pub struct TripLifecycleManager {
    trips: Arc<dyn TripStore>,
    reservations: Arc<dyn TripReservations>,
    violations: Arc<ViolationTracker>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    rules: Arc<EngineRules>,
}

impl TripLifecycleManager {
    pub fn new(
        trips: Arc<dyn TripStore>,
        reservations: Arc<dyn TripReservations>,
        violations: Arc<ViolationTracker>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        rules: Arc<EngineRules>,
    ) -> Self {
        Self {
            trips,
            reservations,
            violations,
            notifier,
            clock,
            rules,
        }
    }

    pub async fn publish(&self, request: PublishTrip) -> EngineResult<Trip> {
        let now = self.clock.now();

        // 1. Input
        if request.seats == 0 || request.seats >= request.vehicle_capacity {
            return Err(EngineError::Validation(format!(
                "Seats must be between 1 and {} for this vehicle",
                request.vehicle_capacity.saturating_sub(1)
            )));
        }
        if request.price_cents <= 0 {
            return Err(EngineError::Validation("Price must be positive".into()));
        }
        if request.departure_at <= now {
            return Err(EngineError::Validation("Departure must be in the future".into()));
        }
        if request.route.origin_id == request.route.destination_id {
            return Err(EngineError::Validation("Origin and destination must differ".into()));
        }

        // 2. No duplicate open trip for the driver on the same endpoints
        let published = self.trips.find_by_driver(request.driver_id).await?;
        if published
            .iter()
            .any(|t| t.state.is_open() && t.route.same_endpoints(&request.route))
        {
            return Err(EngineError::AlreadyExists(format!(
                "Open trip for driver {} on this route",
                request.driver_id
            )));
        }

        // 3. Vehicle not already committed at that instant
        let committed = self
            .trips
            .find_by_vehicle_and_state_in(
                request.vehicle_id,
                &[TripState::Available, TripState::Full, TripState::InProgress],
            )
            .await?;
        if committed.iter().any(|t| t.departure_at == request.departure_at) {
            return Err(EngineError::AlreadyExists(format!(
                "Vehicle {} already has a trip departing at {}",
                request.vehicle_id, request.departure_at
            )));
        }

        let trip = Trip::new(
            request.driver_id,
            request.vehicle_id,
            request.route,
            request.departure_at,
            request.price_cents,
            request.seats,
            now,
        );
        self.trips.insert(&trip).await?;

        info!(
            "Trip {} published by driver {} with {} seat(s), departing {}",
            trip.id, trip.driver_id, trip.total_seats, trip.departure_at
        );
        Ok(trip)
    }

    /// Move the departure of a trip nobody has filled yet
    pub async fn reschedule(
        &self,
        trip_id: Uuid,
        driver_id: Uuid,
        departure_at: DateTime<Utc>,
    ) -> EngineResult<Trip> {
        let mut trip = self.load_owned(trip_id, driver_id).await?;

        if trip.state != TripState::Available {
            return Err(EngineError::invalid_transition(trip.state, "RESCHEDULED"));
        }
        let now = self.clock.now();
        if departure_at <= now {
            return Err(EngineError::Validation("Departure must be in the future".into()));
        }

        let previous = trip.departure_at;
        trip.departure_at = departure_at;
        trip.version = self.trips.save(&trip, trip.version).await?;
        info!("Trip {} rescheduled from {} to {}", trip.id, previous, departure_at);

        for reservation in self.reservations.open_on(trip.id).await? {
            self.notifier.emit(
                NotificationIntent::for_trip(reservation.traveler_id, NotificationKind::TripEdited, trip.id, now)
                    .with_reservation(reservation.id)
                    .with_payload(serde_json::json!({
                        "previous_departure": previous,
                        "departure": departure_at,
                    })),
            );
        }

        Ok(trip)
    }

    /// AVAILABLE | FULL -> IN_PROGRESS, recording a delay infraction when late
    pub async fn start(&self, trip_id: Uuid, driver_id: Uuid) -> EngineResult<TripTransition> {
        let mut trip = self.load_owned(trip_id, driver_id).await?;

        if !trip.state.is_open() {
            return Err(EngineError::invalid_transition(trip.state, TripState::InProgress));
        }

        let now = self.clock.now();
        let earliest = trip.departure_at - self.rules.start_grace();
        if now < earliest {
            return Err(EngineError::Validation(format!(
                "Trip {} cannot start before {}",
                trip.id, earliest
            )));
        }

        trip.state = TripState::InProgress;
        trip.started_at = Some(now);
        trip.version = self.trips.save(&trip, trip.version).await?;

        let minutes_late = trip.minutes_late(now);
        let delay = if minutes_late >= self.rules.major_delay_minutes {
            Some(ViolationType::MajorDelay)
        } else if minutes_late >= self.rules.minor_delay_minutes {
            Some(ViolationType::MinorDelay)
        } else {
            None
        };

        let violation = match delay {
            Some(kind) => Some(
                self.violations
                    .register(
                        trip.driver_id,
                        Some(trip.id),
                        kind,
                        Some(minutes_late),
                        format!("Trip started {} minute(s) after scheduled departure", minutes_late),
                    )
                    .await?,
            ),
            None => None,
        };

        info!("Trip {} started ({} minute(s) late)", trip.id, minutes_late.max(0));

        for reservation in self.reservations.confirmed_on(trip.id).await? {
            self.notifier.emit(
                NotificationIntent::for_trip(reservation.traveler_id, NotificationKind::TripStarted, trip.id, now)
                    .with_reservation(reservation.id),
            );
        }

        Ok(TripTransition { trip, violation })
    }

    /// IN_PROGRESS -> FINISHED by the driver
    pub async fn finish(&self, trip_id: Uuid, driver_id: Uuid) -> EngineResult<Trip> {
        let mut trip = self.load_owned(trip_id, driver_id).await?;

        if trip.state != TripState::InProgress {
            return Err(EngineError::invalid_transition(trip.state, TripState::Finished));
        }

        let now = self.clock.now();
        trip.state = TripState::Finished;
        trip.finished_at = Some(now);
        trip.version = self.trips.save(&trip, trip.version).await?;
        info!("Trip {} finished by driver {}", trip.id, driver_id);

        self.prompt_ratings(&trip, now).await?;
        Ok(trip)
    }

    /// AVAILABLE | FULL -> CANCELLED by the driver
    pub async fn cancel(&self, trip_id: Uuid, driver_id: Uuid) -> EngineResult<Trip> {
        let trip = self.load_owned(trip_id, driver_id).await?;
        self.cancel_open(trip, "driver").await
    }

    /// Cancel a trip whose driver never started it and record the no-show
    pub async fn mark_no_show(&self, trip_id: Uuid) -> EngineResult<TripTransition> {
        let trip = self.load(trip_id).await?;

        let deadline = trip.departure_at + self.rules.no_show_deadline();
        if trip.state.is_open() && self.clock.now() < deadline {
            return Err(EngineError::Validation(format!(
                "Trip {} is not a no-show before {}",
                trip.id, deadline
            )));
        }

        // The transition goes first so a trip is never both running and a no-show
        let trip = self.cancel_open(trip, "no-show").await?;

        let violation = self
            .violations
            .register(
                trip.driver_id,
                Some(trip.id),
                ViolationType::NoShow,
                None,
                format!("Trip not started within {} minute(s) of departure", self.rules.no_show_deadline_minutes),
            )
            .await?;

        warn!("Driver {} did not show up for trip {}", trip.driver_id, trip.id);
        Ok(TripTransition {
            trip,
            violation: Some(violation),
        })
    }

    /// Close a trip left IN_PROGRESS past the maximum duration on the driver's behalf
    pub async fn close_forgotten(&self, trip_id: Uuid) -> EngineResult<TripTransition> {
        let mut trip = self.load(trip_id).await?;

        if trip.state != TripState::InProgress {
            return Err(EngineError::invalid_transition(trip.state, TripState::Finished));
        }
        let now = self.clock.now();
        let started_at = trip.started_at.unwrap_or(trip.departure_at);
        if now < started_at + self.rules.max_trip_duration() {
            return Err(EngineError::Validation(format!(
                "Trip {} has not exceeded the maximum duration",
                trip.id
            )));
        }

        trip.state = TripState::Finished;
        trip.finished_at = Some(now);
        trip.closed_automatically = true;
        trip.version = self.trips.save(&trip, trip.version).await?;
        info!("Trip {} closed automatically after exceeding the maximum duration", trip.id);

        // Counts this closure too
        let lapses = self.trips.count_auto_closed_by_driver(trip.driver_id).await?;
        let violation = if lapses % self.rules.forgotten_closure_threshold == 0 {
            Some(
                self.violations
                    .register(
                        trip.driver_id,
                        Some(trip.id),
                        ViolationType::ForgottenClosure,
                        None,
                        format!("{} trips left open past the maximum duration", lapses),
                    )
                    .await?,
            )
        } else {
            debug!("Driver {} has {} forgotten closure(s)", trip.driver_id, lapses);
            None
        };

        self.prompt_ratings(&trip, now).await?;
        Ok(TripTransition { trip, violation })
    }

    /// Mark every open trip past the no-show deadline. Trips that change underneath are skipped.
    pub async fn sweep_no_shows(&self) -> EngineResult<Vec<TripTransition>> {
        let deadline = self.clock.now() - self.rules.no_show_deadline();
        let candidates = self.trips.find_not_started_before(deadline).await?;

        let mut handled = Vec::new();
        for trip in candidates {
            match self.mark_no_show(trip.id).await {
                Ok(transition) => handled.push(transition),
                Err(
                    e @ (EngineError::ConcurrentModification { .. }
                    | EngineError::InvalidStateTransition { .. }),
                ) => {
                    debug!("Skipping no-show for trip {}: {}", trip.id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(handled)
    }

    /// Close every trip in progress for longer than the maximum duration
    pub async fn sweep_forgotten_closures(&self) -> EngineResult<Vec<TripTransition>> {
        let limit = self.clock.now() - self.rules.max_trip_duration();
        let candidates = self.trips.find_in_progress_started_before(limit).await?;

        let mut handled = Vec::new();
        for trip in candidates {
            match self.close_forgotten(trip.id).await {
                Ok(transition) => handled.push(transition),
                Err(
                    e @ (EngineError::ConcurrentModification { .. }
                    | EngineError::InvalidStateTransition { .. }),
                ) => {
                    debug!("Skipping forgotten closure for trip {}: {}", trip.id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(handled)
    }

    pub async fn trips_for_driver(&self, driver_id: Uuid) -> EngineResult<Vec<Trip>> {
        let mut trips = self.trips.find_by_driver(driver_id).await?;
        trips.sort_by(|a, b| a.departure_at.cmp(&b.departure_at));
        Ok(trips)
    }

    pub async fn state_of(&self, trip_id: Uuid) -> EngineResult<TripState> {
        Ok(self.load(trip_id).await?.state)
    }

    pub async fn get(&self, trip_id: Uuid) -> EngineResult<Trip> {
        self.load(trip_id).await
    }

    async fn cancel_open(&self, mut trip: Trip, cause: &str) -> EngineResult<Trip> {
        if !trip.state.is_open() {
            return Err(EngineError::invalid_transition(trip.state, TripState::Cancelled));
        }

        let now = self.clock.now();
        trip.state = TripState::Cancelled;
        trip.version = self.trips.save(&trip, trip.version).await?;
        info!("Trip {} cancelled ({})", trip.id, cause);

        self.reservations.flag_refunds(trip.id).await?;

        for reservation in self.reservations.open_on(trip.id).await? {
            self.notifier.emit(
                NotificationIntent::for_trip(reservation.traveler_id, NotificationKind::TripCancelled, trip.id, now)
                    .with_reservation(reservation.id)
                    .with_payload(serde_json::json!({
                        "cause": cause,
                        "refund_pending": reservation.payment_status == PaymentStatus::RefundPending,
                    })),
            );
        }

        Ok(trip)
    }

    async fn prompt_ratings(&self, trip: &Trip, now: DateTime<Utc>) -> EngineResult<()> {
        let eligible = self.reservations.mark_rating_eligible(trip.id).await?;

        self.notifier.emit(
            NotificationIntent::for_trip(trip.driver_id, NotificationKind::RatingPending, trip.id, now)
                .with_payload(serde_json::json!({ "travelers": eligible.len() })),
        );
        for reservation in &eligible {
            self.notifier.emit(
                NotificationIntent::for_trip(reservation.traveler_id, NotificationKind::RatingPending, trip.id, now)
                    .with_reservation(reservation.id),
            );
        }
        Ok(())
    }

    async fn load(&self, trip_id: Uuid) -> EngineResult<Trip> {
        self.trips.load(trip_id).await?.ok_or(EngineError::NotFound {
            entity: "trip",
            id: trip_id,
        })
    }

    async fn load_owned(&self, trip_id: Uuid, driver_id: Uuid) -> EngineResult<Trip> {
        let trip = self.load(trip_id).await?;
        if trip.driver_id != driver_id {
            return Err(EngineError::Unauthorized(format!(
                "Driver {} does not own trip {}",
                driver_id, trip_id
            )));
        }
        Ok(trip)
    }

    /// Apply a seat-driven state change, re-reading on version conflicts
    async fn apply_seat_change(
        &self,
        trip_id: Uuid,
        applies: impl Fn(&Trip, DateTime<Utc>) -> bool + Send + Sync,
        to: TripState,
    ) -> EngineResult<()> {
        for attempt in 0..=self.rules.version_retry_limit {
            let mut trip = self.load(trip_id).await?;
            if !applies(&trip, self.clock.now()) {
                debug!("Trip {} left as {} on seat signal", trip_id, trip.state);
                return Ok(());
            }

            let from = trip.state;
            trip.state = to;
            match self.trips.save(&trip, trip.version).await {
                Ok(_) => {
                    info!("Trip {} moved from {} to {}", trip_id, from, to);
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!("Trip {} changed during seat signal (attempt {})", trip_id, attempt + 1);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::ConcurrentModification {
            entity: "trip",
            id: trip_id,
        })
    }
}

/// Seat writes already carry FULL/AVAILABLE, so this only repairs trips written without it
#[async_trait]
impl SeatSignalHandler for TripLifecycleManager {
    async fn on_seat_signal(&self, signal: SeatSignal) -> EngineResult<()> {
        match signal {
            SeatSignal::SeatsExhausted { trip_id } => {
                self.apply_seat_change(
                    trip_id,
                    |trip, _| trip.state == TripState::Available && trip.seats_remaining == 0,
                    TripState::Full,
                )
                .await
            }
            SeatSignal::SeatReleased { trip_id } => {
                self.apply_seat_change(
                    trip_id,
                    |trip, now| {
                        trip.state == TripState::Full
                            && trip.seats_remaining > 0
                            && !trip.has_departed(now)
                    },
                    TripState::Available,
                )
                .await
            }
        }
    }
}
