use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// Trip status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripState {
    Available,
    Full,
    InProgress,
    Finished,
    Cancelled,
}

labelled_enum!(TripState, "trip state", {
    Available => "AVAILABLE",
    Full => "FULL",
    InProgress => "IN_PROGRESS",
    Finished => "FINISHED",
    Cancelled => "CANCELLED",
});

impl TripState {
    /// Published and not yet started: the only states a trip can be started or cancelled from.
    pub fn is_open(&self) -> bool {
        matches!(self, TripState::Available | TripState::Full)
    }
}

/// Origin, destination and intermediate stops, as references resolved elsewhere
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub origin_id: Uuid,
    pub destination_id: Uuid,
    pub stop_ids: Vec<Uuid>,
}

impl Route {
    pub fn new(origin_id: Uuid, destination_id: Uuid) -> Self {
        Self {
            origin_id,
            destination_id,
            stop_ids: Vec::new(),
        }
    }

    pub fn with_stops(mut self, stop_ids: Vec<Uuid>) -> Self {
        self.stop_ids = stop_ids;
        self
    }

    pub fn same_endpoints(&self, other: &Route) -> bool {
        self.origin_id == other.origin_id && self.destination_id == other.destination_id
    }
}

/// A ride published by one driver with one vehicle.
///
/// `seats_remaining` is the contested inventory counter; every write of a trip is
/// conditional on `version` being unchanged since it was read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trip {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub vehicle_id: Uuid,
    pub route: Route,
    pub departure_at: DateTime<Utc>,
    pub price_cents: i64,
    pub total_seats: u32,
    pub seats_remaining: u32,
    pub state: TripState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub closed_automatically: bool,
    pub version: i64,
}

impl Trip {
    pub fn new(
        driver_id: Uuid,
        vehicle_id: Uuid,
        route: Route,
        departure_at: DateTime<Utc>,
        price_cents: i64,
        total_seats: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            driver_id,
            vehicle_id,
            route,
            departure_at,
            price_cents,
            total_seats,
            seats_remaining: total_seats,
            state: TripState::Available,
            created_at,
            started_at: None,
            finished_at: None,
            closed_automatically: false,
            version: 0,
        }
    }

    pub fn has_departed(&self, now: DateTime<Utc>) -> bool {
        self.departure_at <= now
    }

    /// Whole minutes elapsed since the scheduled departure (negative when early)
    pub fn minutes_late(&self, at: DateTime<Utc>) -> i64 {
        (at - self.departure_at).num_minutes()
    }

    /// Take one seat; returns false when none are left
    pub fn take_seat(&mut self) -> bool {
        if self.seats_remaining == 0 {
            return false;
        }
        self.seats_remaining -= 1;
        true
    }

    /// Give one seat back; returns false when the trip is already at capacity
    pub fn release_seat(&mut self) -> bool {
        if self.seats_remaining >= self.total_seats {
            return false;
        }
        self.seats_remaining += 1;
        true
    }

    /// Bring FULL/AVAILABLE in line with the seat count; other states are left alone
    pub fn sync_seat_state(&mut self) {
        match self.state {
            TripState::Available if self.seats_remaining == 0 => self.state = TripState::Full,
            TripState::Full if self.seats_remaining > 0 => self.state = TripState::Available,
            _ => {}
        }
    }
}
