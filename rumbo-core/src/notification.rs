use rumbo_shared::NotificationIntent;

/// Outbound notification intents.
///
/// Fire-and-forget: implementations must not block and must swallow their own delivery
/// failures, so a lost notification never rolls back a committed state change.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, intent: NotificationIntent);
}

/// Drops every intent
pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {
    fn emit(&self, intent: NotificationIntent) {
        tracing::trace!("Dropping {} notification for {}", intent.kind, intent.recipient_id);
    }
}
