use async_trait::async_trait;

/// Lifecycle events the scheduler reports to the chat front-end (§6).
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    Dispatched { request_id: String },
    Confirmed { request_id: String, court: u32, confirmation_id: String },
    Failed { request_id: String, reason: String },
    Expired { request_id: String },
}

/// Injected capability for delivering notifications; the core depends
/// only on this contract (§6, §9 "duck-typed collaborators").
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &str, event: NotificationEvent);
}

/// Default no-op implementation, used in tests and wherever notification
/// delivery is not wired up.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _user_id: &str, _event: NotificationEvent) {}
}
