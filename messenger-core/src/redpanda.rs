//! Broker clients. The only topic carries push signals from the fan-out to
//! the push consumer.

use anyhow::{anyhow, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::StreamConsumer;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing;

use crate::config::RedpandaConfig;
use crate::error::{MessengerError, MessengerResult};

pub type RedpandaProducer = Arc<FutureProducer>;
pub type RedpandaConsumer = Arc<StreamConsumer>;

/// Push signals for recipients that had no live connection.
pub const PUSH_REQUESTS_TOPIC: &str = "messenger.push.requests";

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

fn base_client_config(config: &RedpandaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("socket.keepalive.enable", "true")
        .set("socket.timeout.ms", "30000")
        .set("metadata.request.timeout.ms", "30000")
        .set("broker.address.family", "v4");

    if let Some(ssl) = &config.ssl {
        client.set("security.protocol", "ssl");
        let files = [
            ("ssl.ca.location", &ssl.ca_location),
            ("ssl.certificate.location", &ssl.cert_location),
            ("ssl.key.location", &ssl.key_location),
        ];
        for (key, value) in files {
            if let Some(path) = value {
                client.set(key, path);
            }
        }
    }
    client
}

pub fn create_producer(config: &RedpandaConfig) -> Result<RedpandaProducer> {
    tracing::info!(
        "Creating push signal producer for {} (tls: {})",
        config.brokers,
        config.ssl.is_some()
    );

    let producer: FutureProducer = base_client_config(config)
        .set("acks", "all")
        .set("retries", "3")
        .set("message.timeout.ms", "5000")
        .create()
        .map_err(|e| anyhow!("Failed to create producer for {}: {}", config.brokers, e))?;

    Ok(Arc::new(producer))
}

pub fn create_consumer(config: &RedpandaConfig, group_id: Option<&str>) -> Result<RedpandaConsumer> {
    let group = group_id.unwrap_or(&config.consumer_group);
    tracing::info!("Creating consumer in group {} for {}", group, config.brokers);

    let consumer: StreamConsumer = base_client_config(config)
        .set("group.id", group)
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "true")
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "30000")
        .create()
        .map_err(|e| anyhow!("Failed to create consumer in group {}: {}", group, e))?;

    Ok(Arc::new(consumer))
}

/// Sends one record and waits for the broker's acknowledgement.
pub async fn produce_message(
    producer: &RedpandaProducer,
    topic: &str,
    key: Option<&str>,
    payload: &[u8],
) -> MessengerResult<()> {
    let record = FutureRecord::to(topic).payload(payload);
    let record = match key {
        Some(k) => record.key(k),
        None => record,
    };

    producer
        .send(record, DELIVERY_TIMEOUT)
        .await
        .map(|(partition, offset)| {
            tracing::debug!("Produced to {}[{}] at offset {}", topic, partition, offset);
        })
        .map_err(|(e, _)| {
            tracing::warn!("Broker rejected record for {}: {}", topic, e);
            MessengerError::BrokerUnavailable(format!("{}: {}", topic, e))
        })
}
