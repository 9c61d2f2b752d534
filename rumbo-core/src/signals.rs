//! Seams between the reservation side and the trip side of the engine.
//!
//! The reservation manager never calls the lifecycle manager directly: it emits a
//! [`SeatSignal`] to whatever [`SeatSignalHandler`] it was built with. In the other
//! direction the lifecycle manager reads and touches reservations only through
//! [`TripReservations`].

use async_trait::async_trait;
use rumbo_shared::Reservation;
use uuid::Uuid;

use crate::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatSignal {
    /// The last seat of the trip was just confirmed
    SeatsExhausted { trip_id: Uuid },
    /// A confirmed seat was given back
    SeatReleased { trip_id: Uuid },
}

impl SeatSignal {
    pub fn trip_id(&self) -> Uuid {
        match self {
            SeatSignal::SeatsExhausted { trip_id } | SeatSignal::SeatReleased { trip_id } => *trip_id,
        }
    }
}

#[async_trait]
pub trait SeatSignalHandler: Send + Sync {
    async fn on_seat_signal(&self, signal: SeatSignal) -> EngineResult<()>;
}

/// Reservation views and post-trip bookkeeping needed by the trip lifecycle
#[async_trait]
pub trait TripReservations: Send + Sync {
    /// CONFIRMED reservations of the trip
    async fn confirmed_on(&self, trip_id: Uuid) -> EngineResult<Vec<Reservation>>;

    /// PENDING or CONFIRMED reservations of the trip
    async fn open_on(&self, trip_id: Uuid) -> EngineResult<Vec<Reservation>>;

    /// Flag every confirmed reservation of a finished trip for post-trip rating
    async fn mark_rating_eligible(&self, trip_id: Uuid) -> EngineResult<Vec<Reservation>>;

    /// Move paid confirmed reservations of a cancelled trip to refund-pending
    async fn flag_refunds(&self, trip_id: Uuid) -> EngineResult<Vec<Reservation>>;
}
