use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// Reservation status in the approval lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    Pending,
    Confirmed,
    Rejected,
    CancelledByTraveler,
}

labelled_enum!(ReservationState, "reservation state", {
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
    Rejected => "REJECTED",
    CancelledByTraveler => "CANCELLED_BY_TRAVELER",
});

impl ReservationState {
    /// Pending or confirmed: the traveler still expects to ride
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationState::Pending | ReservationState::Confirmed)
    }

    /// Counts against the one-reservation-per-traveler-per-trip rule
    pub fn holds_slot(&self) -> bool {
        !matches!(self, ReservationState::CancelledByTraveler)
    }
}

/// Payment flag carried as data only
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    RefundPending,
}

labelled_enum!(PaymentStatus, "payment status", {
    Unpaid => "UNPAID",
    Paid => "PAID",
    RefundPending => "REFUND_PENDING",
});

/// Whether the traveler showed up, as marked by the driver
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Attendance {
    Unmarked,
    Present,
    Absent,
}

labelled_enum!(Attendance, "attendance", {
    Unmarked => "UNMARKED",
    Present => "PRESENT",
    Absent => "ABSENT",
});

/// One traveler's claim on one seat of one trip
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reservation {
    pub id: Uuid,
    pub trip_id: Uuid,
    pub traveler_id: Uuid,
    pub state: ReservationState,
    pub requested_at: DateTime<Utc>,
    pub rejection_reason: Option<String>,
    pub payment_status: PaymentStatus,
    pub attendance: Attendance,
    pub rating_eligible: bool,
}

impl Reservation {
    pub fn new(trip_id: Uuid, traveler_id: Uuid, requested_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trip_id,
            traveler_id,
            state: ReservationState::Pending,
            requested_at,
            rejection_reason: None,
            payment_status: PaymentStatus::Unpaid,
            attendance: Attendance::Unmarked,
            rating_eligible: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}
