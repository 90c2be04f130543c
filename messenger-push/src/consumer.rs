use anyhow::Result;
use messenger_core::redpanda::PUSH_REQUESTS_TOPIC;
use messenger_core::types::PushSignal;
use messenger_core::MessengerContext;
use rdkafka::consumer::Consumer;
use rdkafka::Message;
use std::time::{Duration, Instant};
use tracing;

use crate::dispatcher::PushDispatcher;

const CONSUMER_GROUP: &str = "messenger-push";
const QUIET_PERIOD: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub async fn run(ctx: MessengerContext, dispatcher: PushDispatcher) -> Result<()> {
    let consumer = ctx.create_consumer(Some(CONSUMER_GROUP))?;
    consumer.subscribe(&[PUSH_REQUESTS_TOPIC])?;
    tracing::info!("Push consumer listening on {}", PUSH_REQUESTS_TOPIC);

    let mut failures = 0u32;
    let mut last_warned: Option<Instant> = None;

    loop {
        let message = match consumer.recv().await {
            Ok(message) => message,
            Err(e) => {
                failures += 1;
                // At most one warning per 30s while the broker is away
                if last_warned.map_or(true, |at| at.elapsed() >= QUIET_PERIOD) {
                    tracing::warn!("Push consumer cannot read from the broker ({} failures): {}", failures, e);
                    last_warned = Some(Instant::now());
                }
                tokio::time::sleep(backoff(failures)).await;
                continue;
            }
        };
        failures = 0;

        let Some(payload) = message.payload() else {
            tracing::debug!("Skipping empty record at offset {}", message.offset());
            continue;
        };
        if let Err(e) = handle_signal(&dispatcher, payload).await {
            tracing::error!("Dropping push signal: {}", e);
        }
    }
}

/// 2s, 4s, 8s ... capped at 30s.
fn backoff(failures: u32) -> Duration {
    Duration::from_secs(1 << failures.min(5)).min(MAX_BACKOFF)
}

async fn handle_signal(dispatcher: &PushDispatcher, payload: &[u8]) -> Result<()> {
    let signal: PushSignal = serde_json::from_slice(payload)?;
    let report = dispatcher.dispatch(&signal).await?;
    if report.failed > 0 {
        tracing::warn!(
            "Push for message {} failed on {} of {} devices",
            signal.message_id,
            report.failed,
            report.sent + report.removed + report.failed
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use chrono::Utc;
    use messenger_core::config::PushConfig;
    use messenger_core::storage::MemoryStorage;
    use std::sync::Arc;

    #[test]
    fn backoff_doubles_up_to_thirty_seconds() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(4), Duration::from_secs(16));
        assert_eq!(backoff(9), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn undecodable_signal_is_an_error_not_a_panic() {
        let dispatcher = PushDispatcher::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(FakeTransport::default()),
            PushConfig::default(),
        );
        assert!(handle_signal(&dispatcher, b"{not json").await.is_err());

        let signal = PushSignal {
            recipient: 4,
            recipient_role: messenger_core::types::Role::Scout,
            chat_id: 1,
            chat_type: messenger_core::types::ChatType::Match,
            message_id: 9,
            sender_id: None,
            preview: "kick-off".to_string(),
            created_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&signal).unwrap();
        assert!(handle_signal(&dispatcher, &payload).await.is_ok());
    }
}
