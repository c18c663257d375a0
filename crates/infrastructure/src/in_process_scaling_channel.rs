//! In-process scaling channel for inline deployments and tests.

use apphub_application::{ScalingChannel, ScalingMessage};
use apphub_core::AppResult;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Broadcast-channel implementation of the scaling channel port.
pub struct InProcessScalingChannel {
    sender: broadcast::Sender<ScalingMessage>,
}

impl Default for InProcessScalingChannel {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }
}

impl InProcessScalingChannel {
    /// Creates a channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScalingChannel for InProcessScalingChannel {
    async fn publish(&self, message: ScalingMessage) -> AppResult<()> {
        let _ = self.sender.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ScalingMessage> {
        self.sender.subscribe()
    }
}
