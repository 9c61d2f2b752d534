use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// Kinds of driver infraction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationType {
    MinorDelay,
    MajorDelay,
    ForgottenClosure,
    NoShow,
}

labelled_enum!(ViolationType, "violation type", {
    MinorDelay => "MINOR_DELAY",
    MajorDelay => "MAJOR_DELAY",
    ForgottenClosure => "FORGOTTEN_CLOSURE",
    NoShow => "NO_SHOW",
});

/// One recorded infraction by a driver.
///
/// `weight` is copied from the strike table when the violation is recorded so later
/// table changes do not rewrite past strikes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConductorViolation {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub trip_id: Option<Uuid>,
    pub kind: ViolationType,
    pub weight: u32,
    pub occurred_at: DateTime<Utc>,
    pub minutes_late: Option<i64>,
    pub active: bool,
    pub expires_at: DateTime<Utc>,
    pub description: String,
}

impl ConductorViolation {
    /// Counts toward the driver's strike total at `now`
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.active && now < self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_activity_follows_expiration() {
        let now = Utc::now();
        let mut violation = ConductorViolation {
            id: Uuid::new_v4(),
            driver_id: Uuid::new_v4(),
            trip_id: None,
            kind: ViolationType::NoShow,
            weight: 2,
            occurred_at: now,
            minutes_late: None,
            active: true,
            expires_at: now + Duration::days(30),
            description: String::new(),
        };

        assert!(violation.is_active_at(now + Duration::days(29)));
        assert!(!violation.is_active_at(now + Duration::days(31)));

        violation.active = false;
        assert!(!violation.is_active_at(now));
    }
}
