use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Events pushed to the admin channel when the pipeline hands an offer to a
/// human. Dispatch is fire-and-forget: a downed notifier never affects the
/// state transition that produced the event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Escalation {
        offer_id: Uuid,
        reason: String,
        notes: String,
    },
    PipelineFailure {
        offer_id: Uuid,
        error: String,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: Notification);
}

/// Default notifier: structured log lines the admin dashboard tails.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: Notification) {
        match &event {
            Notification::Escalation {
                offer_id,
                reason,
                notes,
            } => {
                warn!(
                    target = "pawnshop.notify",
                    offer_id = %offer_id,
                    reason,
                    notes,
                    "escalation notification"
                );
            }
            Notification::PipelineFailure { offer_id, error } => {
                warn!(
                    target = "pawnshop.notify",
                    offer_id = %offer_id,
                    error,
                    "pipeline failure notification"
                );
            }
        }
    }
}

/// Spawns delivery on the runtime and returns immediately.
pub fn dispatch(notifier: Arc<dyn Notifier>, event: Notification) {
    tokio::spawn(async move {
        notifier.notify(event).await;
    });
}
