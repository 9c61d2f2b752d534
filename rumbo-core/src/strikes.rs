use std::collections::BTreeMap;

use rumbo_shared::ViolationType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lookup table from infraction type to strike weight.
///
/// Deserializes from a map such as `{ NO_SHOW = 3 }` laid over the default table, so
/// unlisted types keep their default weight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "BTreeMap<ViolationType, u32>", into = "BTreeMap<ViolationType, u32>")]
pub struct StrikeWeights(BTreeMap<ViolationType, u32>);

impl StrikeWeights {
    pub fn new(table: BTreeMap<ViolationType, u32>) -> Self {
        Self(table)
    }

    pub fn weight_for(&self, kind: ViolationType) -> u32 {
        self.0.get(&kind).copied().unwrap_or(1)
    }

    pub fn set(&mut self, kind: ViolationType, weight: u32) {
        self.0.insert(kind, weight);
    }

    /// Lay `overrides` over the current table
    pub fn merge(&mut self, overrides: BTreeMap<ViolationType, u32>) {
        self.0.extend(overrides);
    }
}

impl From<BTreeMap<ViolationType, u32>> for StrikeWeights {
    fn from(overrides: BTreeMap<ViolationType, u32>) -> Self {
        let mut weights = Self::default();
        weights.merge(overrides);
        weights
    }
}

impl From<StrikeWeights> for BTreeMap<ViolationType, u32> {
    fn from(weights: StrikeWeights) -> Self {
        weights.0
    }
}

impl Default for StrikeWeights {
    fn default() -> Self {
        Self(BTreeMap::from([
            (ViolationType::MinorDelay, 1),
            (ViolationType::MajorDelay, 2),
            (ViolationType::ForgottenClosure, 1),
            (ViolationType::NoShow, 2),
        ]))
    }
}

/// Hook consulted after every recorded violation with the driver's new active total.
///
/// What crossing a threshold means (warning, suspension) belongs to the implementor.
pub trait StrikePolicy: Send + Sync {
    fn on_weight_changed(&self, driver_id: Uuid, active_weight: u32);
}

/// Logs the new total and does nothing else
pub struct LoggingStrikePolicy;

impl StrikePolicy for LoggingStrikePolicy {
    fn on_weight_changed(&self, driver_id: Uuid, active_weight: u32) {
        tracing::info!("Driver {} now carries {} active strike(s)", driver_id, active_weight);
    }
}
