use chrono::Duration;
use serde::Deserialize;

use crate::strikes::StrikeWeights;
use crate::{EngineError, EngineResult};

/// Tunable thresholds for the trip and reservation rules.
///
/// Every field has a default so a partial `[rules]` table is enough.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineRules {
    /// How early before departure a driver may start the trip
    #[serde(default = "default_start_grace_minutes")]
    pub start_grace_minutes: i64,
    #[serde(default = "default_minor_delay_minutes")]
    pub minor_delay_minutes: i64,
    #[serde(default = "default_major_delay_minutes")]
    pub major_delay_minutes: i64,
    /// Minutes after departure before an unstarted trip counts as a no-show
    #[serde(default = "default_no_show_deadline_minutes")]
    pub no_show_deadline_minutes: i64,
    /// Hours in progress after which a trip is considered forgotten
    #[serde(default = "default_max_trip_duration_hours")]
    pub max_trip_duration_hours: i64,
    /// Every Nth automatic closure of a driver's trip is an infraction
    #[serde(default = "default_forgotten_closure_threshold")]
    pub forgotten_closure_threshold: u32,
    #[serde(default = "default_violation_retention_days")]
    pub violation_retention_days: i64,
    /// How early before departure the driver may mark attendance
    #[serde(default = "default_attendance_window_minutes")]
    pub attendance_window_minutes: i64,
    /// Extra attempts after an optimistic version conflict
    #[serde(default = "default_version_retry_limit")]
    pub version_retry_limit: u32,
    #[serde(default)]
    pub strike_weights: StrikeWeights,
}

fn default_start_grace_minutes() -> i64 { 15 }
fn default_minor_delay_minutes() -> i64 { 10 }
fn default_major_delay_minutes() -> i64 { 15 }
fn default_no_show_deadline_minutes() -> i64 { 60 }
fn default_max_trip_duration_hours() -> i64 { 12 }
fn default_forgotten_closure_threshold() -> u32 { 3 }
fn default_violation_retention_days() -> i64 { 30 }
fn default_attendance_window_minutes() -> i64 { 30 }
fn default_version_retry_limit() -> u32 { 3 }

impl Default for EngineRules {
    fn default() -> Self {
        Self {
            start_grace_minutes: default_start_grace_minutes(),
            minor_delay_minutes: default_minor_delay_minutes(),
            major_delay_minutes: default_major_delay_minutes(),
            no_show_deadline_minutes: default_no_show_deadline_minutes(),
            max_trip_duration_hours: default_max_trip_duration_hours(),
            forgotten_closure_threshold: default_forgotten_closure_threshold(),
            violation_retention_days: default_violation_retention_days(),
            attendance_window_minutes: default_attendance_window_minutes(),
            version_retry_limit: default_version_retry_limit(),
            strike_weights: StrikeWeights::default(),
        }
    }
}

impl EngineRules {
    pub fn validate(&self) -> EngineResult<()> {
        if self.start_grace_minutes < 0 {
            return Err(EngineError::Validation("start_grace_minutes must not be negative".into()));
        }
        if self.minor_delay_minutes <= 0 || self.minor_delay_minutes >= self.major_delay_minutes {
            return Err(EngineError::Validation(format!(
                "Delay thresholds must satisfy 0 < minor ({}) < major ({})",
                self.minor_delay_minutes, self.major_delay_minutes
            )));
        }
        if self.no_show_deadline_minutes <= 0 {
            return Err(EngineError::Validation("no_show_deadline_minutes must be positive".into()));
        }
        if self.max_trip_duration_hours <= 0 {
            return Err(EngineError::Validation("max_trip_duration_hours must be positive".into()));
        }
        if self.forgotten_closure_threshold == 0 {
            return Err(EngineError::Validation("forgotten_closure_threshold must be at least 1".into()));
        }
        if self.violation_retention_days <= 0 {
            return Err(EngineError::Validation("violation_retention_days must be positive".into()));
        }
        if self.attendance_window_minutes < 0 {
            return Err(EngineError::Validation("attendance_window_minutes must not be negative".into()));
        }
        Ok(())
    }

    pub fn start_grace(&self) -> Duration {
        Duration::minutes(self.start_grace_minutes)
    }

    pub fn no_show_deadline(&self) -> Duration {
        Duration::minutes(self.no_show_deadline_minutes)
    }

    pub fn max_trip_duration(&self) -> Duration {
        Duration::hours(self.max_trip_duration_hours)
    }

    pub fn violation_retention(&self) -> Duration {
        Duration::days(self.violation_retention_days)
    }

    pub fn attendance_window(&self) -> Duration {
        Duration::minutes(self.attendance_window_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumbo_shared::ViolationType;

    #[test]
    fn test_defaults() {
        let rules = EngineRules::default();
        assert_eq!(rules.start_grace_minutes, 15);
        assert_eq!(rules.minor_delay_minutes, 10);
        assert_eq!(rules.major_delay_minutes, 15);
        assert_eq!(rules.no_show_deadline_minutes, 60);
        assert_eq!(rules.max_trip_duration_hours, 12);
        assert_eq!(rules.forgotten_closure_threshold, 3);
        assert_eq!(rules.violation_retention_days, 30);
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn test_partial_override_merges_onto_defaults() {
        let rules: EngineRules = serde_json::from_value(serde_json::json!({
            "major_delay_minutes": 20,
            "strike_weights": { "NO_SHOW": 4 }
        }))
        .unwrap();

        assert_eq!(rules.major_delay_minutes, 20);
        assert_eq!(rules.minor_delay_minutes, 10);
        assert_eq!(rules.strike_weights.weight_for(ViolationType::NoShow), 4);
        assert_eq!(rules.strike_weights.weight_for(ViolationType::MajorDelay), 2);
        assert_eq!(rules.strike_weights.weight_for(ViolationType::MinorDelay), 1);
    }

    #[test]
    fn test_inverted_delay_thresholds_rejected() {
        let rules = EngineRules {
            minor_delay_minutes: 20,
            major_delay_minutes: 15,
            ..EngineRules::default()
        };
        assert!(matches!(rules.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_zero_closure_threshold_rejected() {
        let rules = EngineRules {
            forgotten_closure_threshold: 0,
            ..EngineRules::default()
        };
        assert!(rules.validate().is_err());
    }
}
