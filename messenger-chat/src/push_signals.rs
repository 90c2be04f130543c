use async_trait::async_trait;
use messenger_core::redpanda::{produce_message, PUSH_REQUESTS_TOPIC};
use messenger_core::types::PushSignal;
use messenger_core::{MessengerResult, RedpandaProducer};

/// Where push signals for unreachable recipients go. The push dispatcher
/// consumes them on the other side.
#[async_trait]
pub trait PushSignalSink: Send + Sync {
    async fn submit(&self, signal: &PushSignal) -> MessengerResult<()>;
}

pub struct BrokerPushSignals {
    producer: RedpandaProducer,
}

impl BrokerPushSignals {
    pub fn new(producer: RedpandaProducer) -> Self {
        BrokerPushSignals { producer }
    }
}

#[async_trait]
impl PushSignalSink for BrokerPushSignals {
    async fn submit(&self, signal: &PushSignal) -> MessengerResult<()> {
        let payload = serde_json::to_vec(signal)?;
        // Keyed by recipient so one user's signals stay ordered.
        let key = signal.recipient.to_string();
        produce_message(&self.producer, PUSH_REQUESTS_TOPIC, Some(&key), &payload).await
    }
}
