//! In-process event bus backed by a broadcast channel.

use apphub_application::{CoreEvent, EventBus};
use apphub_core::AppResult;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Broadcast-channel implementation of the event bus port for inline mode
/// and tests.
pub struct InProcessEventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl InProcessEventBus {
    /// Creates a bus with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn publish(&self, event: CoreEvent) -> AppResult<()> {
        // A send error only means no subscriber is connected yet.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use apphub_application::{CoreEvent, EventBus};
    use apphub_core::{RunId, WorkflowId};

    use super::InProcessEventBus;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = InProcessEventBus::default();
        let mut receiver = bus.subscribe();

        let event = CoreEvent::WorkflowRunCompleted {
            run_id: RunId::new(),
            workflow_definition_id: WorkflowId::new(),
            status: apphub_application::WorkflowRunStatus::Succeeded,
            trigger_type: "manual".to_owned(),
        };

        let published = bus.publish(event.clone()).await;
        assert!(published.is_ok());
        assert_eq!(receiver.recv().await.ok(), Some(event));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_not_an_error() {
        let bus = InProcessEventBus::default();
        let published = bus
            .publish(CoreEvent::WorkflowDefinitionUpdated {
                workflow_definition_id: WorkflowId::new(),
                slug: "orders".to_owned(),
                version: 1,
            })
            .await;
        assert!(published.is_ok());
    }
}
