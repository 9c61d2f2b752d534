/// Implements `as_str`, `Display` and `FromStr` over the SCREAMING_SNAKE_CASE labels
/// used both on the wire and in storage.
macro_rules! labelled_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $label,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = crate::UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($ty::$variant),)+
                    other => Err(crate::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

pub mod trip;
pub mod reservation;
pub mod history;
pub mod violation;
pub mod events;

pub use trip::{Route, Trip, TripState};
pub use reservation::{Attendance, PaymentStatus, Reservation, ReservationState};
pub use history::ReservationHistoryEntry;
pub use violation::{ConductorViolation, ViolationType};
pub use events::{NotificationIntent, NotificationKind};
