use std::sync::Arc;

use chrono::{DateTime, Utc};
use rumbo_core::clock::Clock;
use rumbo_core::repository::ViolationStore;
use rumbo_core::rules::EngineRules;
use rumbo_core::strikes::StrikePolicy;
use rumbo_core::{EngineError, EngineResult};
use rumbo_shared::{ConductorViolation, ViolationType};
use tracing::{debug, info};
use uuid::Uuid;

/// Records driver infractions and answers "how many strikes right now".
pub struct ViolationTracker {
    store: Arc<dyn ViolationStore>,
    clock: Arc<dyn Clock>,
    rules: Arc<EngineRules>,
    policy: Arc<dyn StrikePolicy>,
}

impl ViolationTracker {
    pub fn new(
        store: Arc<dyn ViolationStore>,
        clock: Arc<dyn Clock>,
        rules: Arc<EngineRules>,
        policy: Arc<dyn StrikePolicy>,
    ) -> Self {
        Self {
            store,
            clock,
            rules,
            policy,
        }
    }

    /// Record a new active infraction. No deduplication: two calls make two strikes.
    pub async fn register(
        &self,
        driver_id: Uuid,
        trip_id: Option<Uuid>,
        kind: ViolationType,
        minutes_late: Option<i64>,
        description: impl Into<String>,
    ) -> EngineResult<ConductorViolation> {
        let now = self.clock.now();
        let violation = ConductorViolation {
            id: Uuid::new_v4(),
            driver_id,
            trip_id,
            kind,
            weight: self.rules.strike_weights.weight_for(kind),
            occurred_at: now,
            minutes_late,
            active: true,
            expires_at: now + self.rules.violation_retention(),
            description: description.into(),
        };

        self.store.save(&violation).await?;
        info!(
            "Registered {} (weight {}) for driver {} on trip {:?}",
            violation.kind, violation.weight, driver_id, trip_id
        );

        let weight = self.active_weight(driver_id).await?;
        self.policy.on_weight_changed(driver_id, weight);

        Ok(violation)
    }

    /// Sum of weights of the driver's violations that are flagged active and not yet expired
    pub async fn active_weight(&self, driver_id: Uuid) -> EngineResult<u32> {
        let now = self.clock.now();
        let violations = self.store.find_active_by_driver(driver_id).await?;

        Ok(violations
            .iter()
            .filter(|v| v.is_active_at(now))
            .map(|v| v.weight)
            .sum())
    }

    pub async fn count_active_of_type(
        &self,
        driver_id: Uuid,
        kind: ViolationType,
    ) -> EngineResult<usize> {
        let now = self.clock.now();
        let violations = self.store.find_active_by_driver(driver_id).await?;

        Ok(violations
            .iter()
            .filter(|v| v.kind == kind && v.is_active_at(now))
            .count())
    }

    /// Flip `active` off for everything whose expiration is before `now`. Returns how many.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let stale = self.store.find_expired_as_of(now).await?;
        let mut expired = 0;

        for mut violation in stale {
            if !violation.active {
                continue;
            }
            violation.active = false;
            self.store.save(&violation).await?;
            debug!("Expired violation {} of driver {}", violation.id, violation.driver_id);
            expired += 1;
        }

        if expired > 0 {
            info!("Expired {} stale violation(s)", expired);
        }
        Ok(expired)
    }

    /// Every violation of the driver, newest first
    pub async fn history_for(&self, driver_id: Uuid) -> EngineResult<Vec<ConductorViolation>> {
        let mut violations = self.store.find_by_driver(driver_id).await?;
        violations.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        Ok(violations)
    }

    /// Administrative override; deactivating twice is a no-op
    pub async fn deactivate(&self, violation_id: Uuid) -> EngineResult<ConductorViolation> {
        let mut violation = self
            .store
            .load(violation_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "violation",
                id: violation_id,
            })?;

        if violation.active {
            violation.active = false;
            self.store.save(&violation).await?;
            info!("Deactivated violation {} of driver {}", violation.id, violation.driver_id);

            let weight = self.active_weight(violation.driver_id).await?;
            self.policy.on_weight_changed(violation.driver_id, weight);
        }

        Ok(violation)
    }
}
