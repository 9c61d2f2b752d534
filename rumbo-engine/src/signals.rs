use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use rumbo_core::signals::{SeatSignal, SeatSignalHandler};
use rumbo_core::{EngineError, EngineResult};

/// Forwards seat signals to a handler attached after construction.
///
/// The reservation manager is built before the lifecycle manager that handles its
/// signals, and the lifecycle manager holds the reservation manager. The relay keeps
/// only a weak reference so the two never own each other.
#[derive(Default)]
pub struct SignalRelay {
    target: OnceLock<Weak<dyn SeatSignalHandler>>,
}

impl SignalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the handler. Only the first call has any effect.
    pub fn connect(&self, handler: &Arc<dyn SeatSignalHandler>) -> bool {
        self.target.set(Arc::downgrade(handler)).is_ok()
    }
}

#[async_trait]
impl SeatSignalHandler for SignalRelay {
    async fn on_seat_signal(&self, signal: SeatSignal) -> EngineResult<()> {
        let handler = self
            .target
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| EngineError::Internal("Seat signal handler is not connected".into()))?;

        handler.on_seat_signal(signal).await
    }
}
