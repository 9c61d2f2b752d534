pub mod models;

pub use models::{
    Attendance, ConductorViolation, NotificationIntent, NotificationKind, PaymentStatus,
    Reservation, ReservationHistoryEntry, ReservationState, Route, Trip, TripState,
    ViolationType,
};

/// Error returned when a stored enum label does not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl std::fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}
