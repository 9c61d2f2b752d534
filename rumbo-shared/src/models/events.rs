use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    ReservationRequested,
    ReservationApproved,
    ReservationRejected,
    ReservationCancelled,
    PaymentReceived,
    TripStarted,
    TripEdited,
    TripCancelled,
    RatingPending,
}

labelled_enum!(NotificationKind, "notification kind", {
    ReservationRequested => "RESERVATION_REQUESTED",
    ReservationApproved => "RESERVATION_APPROVED",
    ReservationRejected => "RESERVATION_REJECTED",
    ReservationCancelled => "RESERVATION_CANCELLED",
    PaymentReceived => "PAYMENT_RECEIVED",
    TripStarted => "TRIP_STARTED",
    TripEdited => "TRIP_EDITED",
    TripCancelled => "TRIP_CANCELLED",
    RatingPending => "RATING_PENDING",
});

/// A request to tell someone about something; delivery is somebody else's job
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct NotificationIntent {
    pub recipient_id: Uuid,
    pub kind: NotificationKind,
    pub trip_id: Uuid,
    pub reservation_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

impl NotificationIntent {
    pub fn for_trip(
        recipient_id: Uuid,
        kind: NotificationKind,
        trip_id: Uuid,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            recipient_id,
            kind,
            trip_id,
            reservation_id: None,
            payload: serde_json::Value::Null,
            emitted_at,
        }
    }

    pub fn with_reservation(mut self, reservation_id: Uuid) -> Self {
        self.reservation_id = Some(reservation_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
