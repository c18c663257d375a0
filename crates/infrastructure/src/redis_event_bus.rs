//! Redis pub/sub event bus for distributed deployments.

use apphub_application::{CoreEvent, EventBus};
use apphub_core::{AppError, AppResult};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::warn;

/// Redis implementation of the event bus port.
///
/// Publishes serialized events to one pub/sub channel; a background task
/// forwards received messages into a local broadcast channel so subscribers
/// keep the same interface as the in-process bus. Published events come back
/// through the broker, so every process (this one included) observes one
/// copy.
pub struct RedisEventBus {
    client: redis::Client,
    channel: String,
    sender: broadcast::Sender<CoreEvent>,
}

impl RedisEventBus {
    /// Creates a bus and starts the subscription forwarder.
    pub fn new(client: redis::Client, channel: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(256);
        let bus = Self {
            client,
            channel: channel.into(),
            sender,
        };
        bus.spawn_forwarder();
        bus
    }

    fn spawn_forwarder(&self) {
        let client = self.client.clone();
        let channel = self.channel.clone();
        let sender = self.sender.clone();

        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(error) => {
                        warn!(error = %error, "event bus pubsub connection failed; retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                        continue;
                    }
                };

                if let Err(error) = pubsub.subscribe(channel.as_str()).await {
                    warn!(error = %error, "event bus channel subscribe failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    continue;
                }

                let mut stream = pubsub.on_message();
                while let Some(message) = stream.next().await {
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(error) => {
                            warn!(error = %error, "event bus message payload unreadable");
                            continue;
                        }
                    };

                    match serde_json::from_str::<CoreEvent>(payload.as_str()) {
                        Ok(event) => {
                            let _ = sender.send(event);
                        }
                        Err(error) => {
                            warn!(error = %error, "event bus message failed to decode");
                        }
                    }
                }

                warn!("event bus pubsub stream ended; reconnecting");
            }
        });
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: CoreEvent) -> AppResult<()> {
        let payload = serde_json::to_string(&event).map_err(|error| {
            AppError::Internal(format!("failed to encode bus event: {error}"))
        })?;

        let mut connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| {
                AppError::RetryableExternal(format!("failed to connect to redis: {error}"))
            })?;

        connection
            .publish::<_, _, ()>(self.channel.as_str(), payload)
            .await
            .map_err(|error| {
                AppError::RetryableExternal(format!("failed to publish bus event: {error}"))
            })?;

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}
