use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use rumbo_shared::{
    Attendance, ConductorViolation, PaymentStatus, Reservation, ReservationHistoryEntry,
    ReservationState, Trip, TripState,
};

/// Storage-layer failures the engine needs to tell apart
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Version conflict on {entity} {id}: expected version {expected}")]
    VersionConflict {
        entity: &'static str,
        id: Uuid,
        expected: i64,
    },

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("{entity} missing from store: {id}")]
    Missing { entity: &'static str, id: Uuid },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Repository trait for trip data access
#[async_trait]
pub trait TripStore: Send + Sync {
    async fn insert(&self, trip: &Trip) -> StoreResult<()>;

    async fn load(&self, id: Uuid) -> StoreResult<Option<Trip>>;

    /// Write `trip` only if the stored version still equals `expected_version`.
    /// Returns the new version.
    async fn save(&self, trip: &Trip, expected_version: i64) -> StoreResult<i64>;

    async fn find_by_vehicle_and_state_in(
        &self,
        vehicle_id: Uuid,
        states: &[TripState],
    ) -> StoreResult<Vec<Trip>>;

    async fn find_by_driver(&self, driver_id: Uuid) -> StoreResult<Vec<Trip>>;

    /// Open trips (AVAILABLE or FULL) never started whose departure is before `deadline`
    async fn find_not_started_before(&self, deadline: DateTime<Utc>) -> StoreResult<Vec<Trip>>;

    /// IN_PROGRESS trips started before `limit`
    async fn find_in_progress_started_before(
        &self,
        limit: DateTime<Utc>,
    ) -> StoreResult<Vec<Trip>>;

    /// How many of the driver's trips were closed by the forgotten-closure sweep
    async fn count_auto_closed_by_driver(&self, driver_id: Uuid) -> StoreResult<u32>;
}

/// Repository trait for reservation data access.
///
/// State changes go through [`ReservationLedger`]. The setters below each write a single
/// post-confirmation field, only while the stored reservation is CONFIRMED, and return
/// the stored row. A reservation in another state (or, for payment, with another payment
/// status than `expected`) is a [`StoreError::VersionConflict`].
#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn load(&self, id: Uuid) -> StoreResult<Option<Reservation>>;

    async fn set_attendance(&self, id: Uuid, attendance: Attendance) -> StoreResult<Reservation>;

    async fn set_payment_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        new: PaymentStatus,
    ) -> StoreResult<Reservation>;

    async fn set_rating_eligible(&self, id: Uuid) -> StoreResult<Reservation>;

    async fn find_by_trip_and_traveler(
        &self,
        trip_id: Uuid,
        traveler_id: Uuid,
    ) -> StoreResult<Vec<Reservation>>;

    async fn find_by_trip(&self, trip_id: Uuid) -> StoreResult<Vec<Reservation>>;

    async fn find_by_traveler(&self, traveler_id: Uuid) -> StoreResult<Vec<Reservation>>;
}

/// Repository trait for the append-only reservation history
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append and return the assigned sequence number
    async fn append(&self, entry: &ReservationHistoryEntry) -> StoreResult<i64>;

    /// Entries for the trip in (occurred_at, sequence) order
    async fn find_by_trip(&self, trip_id: Uuid) -> StoreResult<Vec<ReservationHistoryEntry>>;
}

/// Repository trait for driver violations
#[async_trait]
pub trait ViolationStore: Send + Sync {
    async fn save(&self, violation: &ConductorViolation) -> StoreResult<()>;

    async fn load(&self, id: Uuid) -> StoreResult<Option<ConductorViolation>>;

    async fn find_active_by_driver(&self, driver_id: Uuid) -> StoreResult<Vec<ConductorViolation>>;

    /// Violations still flagged active whose expiration is before `at`
    async fn find_expired_as_of(&self, at: DateTime<Utc>) -> StoreResult<Vec<ConductorViolation>>;

    /// Every violation of the driver, newest first
    async fn find_by_driver(&self, driver_id: Uuid) -> StoreResult<Vec<ConductorViolation>>;
}

/// Trip write that rides along with a reservation change
#[derive(Debug, Clone)]
pub struct TripUpdate {
    pub trip: Trip,
    pub expected_version: i64,
}

/// Everything one reservation state transition writes.
///
/// `expected_state` is `None` for a new reservation; otherwise the store rejects the
/// change with [`StoreError::VersionConflict`] if the stored state moved on. Updates
/// write `state` and `rejection_reason` only. With `refund_if_paid` the store moves a
/// stored PAID status to REFUND_PENDING in the same write.
#[derive(Debug, Clone)]
pub struct ReservationChange {
    pub reservation: Reservation,
    pub expected_state: Option<ReservationState>,
    pub refund_if_paid: bool,
    pub trip_update: Option<TripUpdate>,
    pub history: ReservationHistoryEntry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommittedChange {
    /// The reservation as stored after the commit
    pub reservation: Reservation,
    pub trip_version: Option<i64>,
    pub history_sequence: i64,
}

/// Atomic unit for reservation transitions: the trip write, the reservation write and
/// the history append all land or none do.
#[async_trait]
pub trait ReservationLedger: Send + Sync {
    async fn commit(&self, change: ReservationChange) -> StoreResult<CommittedChange>;
}
