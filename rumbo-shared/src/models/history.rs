use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

use super::reservation::ReservationState;

/// Immutable audit record of one reservation state transition.
///
/// `sequence` is assigned by the store on append and breaks ties between entries
/// recorded within the same instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReservationHistoryEntry {
    pub id: Uuid,
    pub sequence: i64,
    pub reservation_id: Uuid,
    pub trip_id: Uuid,
    pub driver_id: Uuid,
    pub traveler_id: Uuid,
    pub actor_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub prior_state: Option<ReservationState>,
    pub new_state: ReservationState,
}
