pub mod clock;
pub mod notification;
pub mod repository;
pub mod rules;
pub mod signals;
pub mod strikes;

use uuid::Uuid;

pub use repository::{StoreError, StoreResult};

/// Failure kinds surfaced by engine operations.
///
/// Callers branch on the variant, never on the message text.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("No seats remaining on trip {0}")]
    CapacityExhausted(Uuid),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Trip {0} has already departed")]
    AlreadyDeparted(Uuid),

    #[error("{entity} {id} was modified concurrently")]
    ConcurrentModification { entity: &'static str, id: Uuid },

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        EngineError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { entity, id, .. } => {
                EngineError::ConcurrentModification { entity, id }
            }
            StoreError::UniqueViolation(what) => EngineError::AlreadyExists(what),
            StoreError::Missing { entity, id } => EngineError::NotFound { entity, id },
            StoreError::Backend(msg) => EngineError::Storage(msg),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
