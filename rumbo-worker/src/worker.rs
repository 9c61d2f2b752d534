use std::time::Duration;

use rumbo_core::EngineResult;
use rumbo_engine::Sweeper;
use rumbo_shared::NotificationIntent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    NoShows,
    ForgottenClosures,
    ViolationExpiry,
}

impl SweepKind {
    pub fn label(&self) -> &'static str {
        match self {
            SweepKind::NoShows => "no-show",
            SweepKind::ForgottenClosures => "forgotten-closure",
            SweepKind::ViolationExpiry => "violation-expiry",
        }
    }
}

/// Run one sweep and return how many records it touched
pub async fn sweep_once(sweeper: &Sweeper, kind: SweepKind) -> EngineResult<usize> {
    match kind {
        SweepKind::NoShows => sweeper.no_shows().await,
        SweepKind::ForgottenClosures => sweeper.forgotten_closures().await,
        SweepKind::ViolationExpiry => sweeper.expired_violations().await,
    }
}

/// Repeat a sweep every `period`. Failures are logged and the loop carries on.
pub fn spawn_sweep_worker(sweeper: Sweeper, kind: SweepKind, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("{} worker started, every {:?}", kind.label(), period);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match sweep_once(&sweeper, kind).await {
                Ok(0) => debug!("{} sweep found nothing", kind.label()),
                Ok(n) => info!("{} sweep handled {} record(s)", kind.label(), n),
                Err(e) => error!("{} sweep failed: {}", kind.label(), e),
            }
        }
    })
}

/// Stand-in dispatcher: writes every intent to the log as JSON
pub fn spawn_notification_logger(mut rx: broadcast::Receiver<NotificationIntent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(intent) => match serde_json::to_string(&intent) {
                    Ok(json) => info!("Notification intent: {}", json),
                    Err(e) => error!("Failed to serialize notification intent: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Notification logger lagged, {} intent(s) skipped", skipped)
                }
                Err(RecvError::Closed) => {
                    info!("Notification channel closed");
                    break;
                }
            }
        }
    })
}
