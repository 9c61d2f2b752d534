use std::sync::Mutex;

use rumbo_core::notification::NotificationSink;
use rumbo_shared::NotificationIntent;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Publishes intents on a broadcast channel for whatever dispatchers are subscribed
#[derive(Clone)]
pub struct BroadcastNotificationSink {
    tx: broadcast::Sender<NotificationIntent>,
}

impl BroadcastNotificationSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationIntent> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastNotificationSink {
    fn emit(&self, intent: NotificationIntent) {
        let kind = intent.kind;
        let recipient = intent.recipient_id;
        match self.tx.send(intent) {
            Ok(receivers) => debug!("Sent {} for {} to {} dispatcher(s)", kind, recipient, receivers),
            Err(_) => info!("No dispatcher listening, dropped {} for {}", kind, recipient),
        }
    }
}

/// Keeps every intent in memory, in emission order
#[derive(Default)]
pub struct RecordingNotificationSink {
    intents: Mutex<Vec<NotificationIntent>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intents(&self) -> Vec<NotificationIntent> {
        self.intents.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl NotificationSink for RecordingNotificationSink {
    fn emit(&self, intent: NotificationIntent) {
        self.intents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(intent);
    }
}
