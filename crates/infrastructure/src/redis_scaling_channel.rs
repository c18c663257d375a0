//! Redis pub/sub channel multicasting runtime-scaling messages to workers.

use apphub_application::{ScalingChannel, ScalingMessage};
use apphub_core::{AppError, AppResult};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::warn;

/// Redis implementation of the scaling channel port.
pub struct RedisScalingChannel {
    client: redis::Client,
    channel: String,
    sender: broadcast::Sender<ScalingMessage>,
}

impl RedisScalingChannel {
    /// Creates a channel and starts the subscription forwarder.
    pub fn new(client: redis::Client, channel: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(64);
        let scaling = Self {
            client,
            channel: channel.into(),
            sender,
        };
        scaling.spawn_forwarder();
        scaling
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
                        warn!(error = %error, "scaling pubsub connection failed; retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                        continue;
                    }
                };

                if let Err(error) = pubsub.subscribe(channel.as_str()).await {
                    warn!(error = %error, "scaling channel subscribe failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    continue;
                }

                let mut stream = pubsub.on_message();
                while let Some(message) = stream.next().await {
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(error) => {
                            warn!(error = %error, "scaling message payload unreadable");
                            continue;
                        }
                    };

                    match serde_json::from_str::<ScalingMessage>(payload.as_str()) {
                        Ok(message) => {
                            let _ = sender.send(message);
                        }
                        Err(error) => {
                            warn!(error = %error, "scaling message failed to decode");
                        }
                    }
                }

                warn!("scaling pubsub stream ended; reconnecting");
            }
        });
    }
}

#[async_trait]
impl ScalingChannel for RedisScalingChannel {
    async fn publish(&self, message: ScalingMessage) -> AppResult<()> {
        let payload = serde_json::to_string(&message).map_err(|error| {
            AppError::Internal(format!("failed to encode scaling message: {error}"))
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
                AppError::RetryableExternal(format!("failed to publish scaling message: {error}"))
            })?;

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ScalingMessage> {
        self.sender.subscribe()
    }
}
