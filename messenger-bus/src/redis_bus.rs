use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use messenger_core::redis::{CacheRetry, RedisPool};
use messenger_core::{MessengerError, MessengerResult};
use redis::aio::{ConnectionManager, PubSub};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing;
use uuid::Uuid;

use crate::channel::Channel;
use crate::envelope::BusEnvelope;
use crate::EventBus;

enum SubscriptionCommand {
    Subscribe(String),
    Unsubscribe(String),
}

enum Next {
    Command(Option<SubscriptionCommand>),
    Message(Option<redis::Msg>),
}

/// Redis pub/sub bus. Publishing goes through the shared multiplexed
/// connection; receiving is done by one listener task that owns a dedicated
/// pub/sub connection and is driven by subscribe/unsubscribe commands.
pub struct RedisEventBus {
    process_id: Uuid,
    publisher: ConnectionManager,
    retry: CacheRetry,
    commands: mpsc::UnboundedSender<SubscriptionCommand>,
}

impl RedisEventBus {
    /// Starts the listener task. Envelopes received from other processes
    /// arrive on the returned receiver.
    pub fn start(
        process_id: Uuid,
        pool: RedisPool,
        publisher: ConnectionManager,
        retry: CacheRetry,
    ) -> (Self, mpsc::UnboundedReceiver<BusEnvelope>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let listener = tokio::spawn(run_listener(pool, command_rx, inbound_tx));

        let bus = RedisEventBus {
            process_id,
            publisher,
            retry,
            commands: command_tx,
        };
        (bus, inbound_rx, listener)
    }

    fn send_command(&self, command: SubscriptionCommand) -> MessengerResult<()> {
        self.commands
            .send(command)
            .map_err(|_| MessengerError::BrokerUnavailable("event bus listener has stopped".to_string()))
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    fn process_id(&self) -> Uuid {
        self.process_id
    }

    async fn publish(&self, envelope: &BusEnvelope) -> MessengerResult<usize> {
        let payload = envelope.to_bytes()?;
        let channel = envelope.target.name();

        let receivers = self
            .retry
            .run("PUBLISH", || {
                let mut conn = self.publisher.clone();
                let channel = channel.as_str();
                let payload = payload.as_slice();
                async move {
                    let receivers: usize = redis::cmd("PUBLISH")
                        .arg(channel)
                        .arg(payload)
                        .query_async(&mut conn)
                        .await?;
                    Ok(receivers)
                }
            })
            .await
            .map_err(|e| MessengerError::BrokerUnavailable(e.to_string()))?;

        tracing::debug!(
            channel = %channel,
            receivers,
            event = envelope.event.kind(),
            "Published bus envelope"
        );
        Ok(receivers)
    }

    async fn subscribe(&self, channel: Channel) -> MessengerResult<()> {
        self.send_command(SubscriptionCommand::Subscribe(channel.name()))
    }

    async fn unsubscribe(&self, channel: Channel) -> MessengerResult<()> {
        self.send_command(SubscriptionCommand::Unsubscribe(channel.name()))
    }
}

async fn run_listener(
    pool: RedisPool,
    mut commands: mpsc::UnboundedReceiver<SubscriptionCommand>,
    inbound: mpsc::UnboundedSender<BusEnvelope>,
) {
    tracing::info!("Starting event bus listener");

    let mut channels: HashSet<String> = HashSet::new();
    let mut error_count = 0u32;

    loop {
        let pubsub = match connect(&pool, &channels).await {
            Ok(pubsub) => {
                if error_count > 0 {
                    tracing::info!("Event bus listener reconnected, {} channels restored", channels.len());
                }
                error_count = 0;
                pubsub
            }
            Err(e) => {
                error_count += 1;
                tracing::warn!("Event bus connect failed (error count: {}): {}", error_count, e);
                tokio::time::sleep(backoff(error_count)).await;
                continue;
            }
        };

        match pump(pubsub, &mut commands, &inbound, &mut channels).await {
            Ok(()) => {
                tracing::info!("Event bus listener stopped");
                return;
            }
            Err(e) => {
                error_count += 1;
                tracing::warn!("Event bus connection lost (error count: {}): {}", error_count, e);
                tokio::time::sleep(backoff(error_count)).await;
            }
        }
    }
}

// 1s, 2s, 4s ... capped at 30s
fn backoff(error_count: u32) -> Duration {
    Duration::from_secs(1 << error_count.min(5)).min(Duration::from_secs(30))
}

async fn connect(pool: &RedisPool, channels: &HashSet<String>) -> Result<PubSub> {
    let mut pubsub = pool
        .get_async_pubsub()
        .await
        .map_err(|e| anyhow!("Failed to open pub/sub connection: {}", e))?;
    for channel in channels {
        pubsub.subscribe(channel.as_str()).await?;
    }
    Ok(pubsub)
}

/// Returns `Ok` only when the bus itself was dropped.
async fn pump(
    mut pubsub: PubSub,
    commands: &mut mpsc::UnboundedReceiver<SubscriptionCommand>,
    inbound: &mpsc::UnboundedSender<BusEnvelope>,
    channels: &mut HashSet<String>,
) -> Result<()> {
    loop {
        let next = {
            let mut messages = std::pin::pin!(pubsub.on_message());
            tokio::select! {
                command = commands.recv() => Next::Command(command),
                message = messages.next() => Next::Message(message),
            }
        };

        match next {
            Next::Command(None) => return Ok(()),
            Next::Command(Some(SubscriptionCommand::Subscribe(channel))) => {
                // Tracked before the call so a failed subscribe is retried on reconnect.
                if channels.insert(channel.clone()) {
                    pubsub.subscribe(channel.as_str()).await?;
                    tracing::debug!("Subscribed to {}", channel);
                }
            }
            Next::Command(Some(SubscriptionCommand::Unsubscribe(channel))) => {
                if channels.remove(&channel) {
                    pubsub.unsubscribe(channel.as_str()).await?;
                    tracing::debug!("Unsubscribed from {}", channel);
                }
            }
            Next::Message(None) => return Err(anyhow!("pub/sub stream closed")),
            Next::Message(Some(message)) => match BusEnvelope::from_bytes(message.get_payload_bytes()) {
                Ok(envelope) => {
                    if inbound.send(envelope).is_err() {
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Dropping undecodable envelope on {}: {}",
                        message.get_channel_name(),
                        e
                    );
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::backoff;
    use std::time::Duration;

    #[test]
    fn reconnect_backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(10), Duration::from_secs(30));
    }
}
