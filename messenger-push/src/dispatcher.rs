//! Sends one push signal to every live device of its recipient.

use chrono::{Duration as ChronoDuration, Utc};
use messenger_core::config::PushConfig;
use messenger_core::types::{PushSignal, PushSubscription};
use messenger_core::{MessengerResult, Storage};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing;

use crate::payload::NotificationPayload;
use crate::webpush::{PushError, PushTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    pub sent: usize,
    /// Subscriptions deleted after a permanent rejection.
    pub removed: usize,
    pub failed: usize,
}

pub struct PushDispatcher {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn PushTransport>,
    config: PushConfig,
}

impl PushDispatcher {
    pub fn new(storage: Arc<dyn Storage>, transport: Arc<dyn PushTransport>, config: PushConfig) -> Self {
        PushDispatcher {
            storage,
            transport,
            config,
        }
    }

    pub async fn dispatch(&self, signal: &PushSignal) -> MessengerResult<DispatchReport> {
        let alive_since = Utc::now() - liveness(&self.config);
        let devices = self
            .storage
            .live_push_subscriptions(signal.recipient, alive_since)
            .await?;

        let mut report = DispatchReport::default();
        if devices.is_empty() {
            tracing::debug!("No live devices for user {}", signal.recipient);
            return Ok(report);
        }

        let payload = NotificationPayload::from_signal(signal).to_bytes()?;
        for device in &devices {
            match self.send_with_retry(device, &payload).await {
                Ok(()) => report.sent += 1,
                Err(PushError::Rejected(reason)) => {
                    tracing::info!(
                        "Removing push subscription {} of user {}: {}",
                        device.device_id,
                        device.user_id,
                        reason
                    );
                    match self.storage.remove_push_subscription(device.device_id).await {
                        Ok(_) => report.removed += 1,
                        Err(e) => {
                            tracing::error!("Failed to remove push subscription {}: {}", device.device_id, e);
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Dropping push for message {} to device {}: {}",
                        signal.message_id,
                        device.device_id,
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            "Push for message {} to user {}: {} sent, {} removed, {} failed",
            signal.message_id,
            signal.recipient,
            report.sent,
            report.removed,
            report.failed
        );
        Ok(report)
    }

    async fn send_with_retry(&self, device: &PushSubscription, payload: &[u8]) -> Result<(), PushError> {
        let strategy = ExponentialBackoff::from_millis(self.config.retry_base_ms.max(1))
            .max_delay(Duration::from_millis(self.config.retry_max_ms))
            .map(jitter)
            .take(self.config.max_attempts.saturating_sub(1));

        RetryIf::spawn(
            strategy,
            || self.transport.send(device, payload, self.config.notification_ttl_secs),
            |e: &PushError| matches!(e, PushError::Transient(_)),
        )
        .await
    }
}

pub(crate) fn liveness(config: &PushConfig) -> ChronoDuration {
    ChronoDuration::seconds(config.device_liveness_secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use messenger_core::storage::MemoryStorage;
    use messenger_core::types::{ChatType, Role};
    use uuid::Uuid;

    fn device(user_id: i64, endpoint: &str, days_since_alive: i64) -> PushSubscription {
        let now = Utc::now();
        PushSubscription {
            device_id: Uuid::new_v4(),
            user_id,
            endpoint: endpoint.to_string(),
            p256dh: "p256dh".to_string(),
            auth: "auth".to_string(),
            created_at: now - ChronoDuration::days(days_since_alive),
            last_alive_at: now - ChronoDuration::days(days_since_alive),
        }
    }

    fn signal(recipient: i64) -> PushSignal {
        PushSignal {
            recipient,
            recipient_role: Role::Bookmaker,
            chat_id: 10,
            chat_type: ChatType::Personal,
            message_id: 1,
            sender_id: Some(1),
            preview: "hello".to_string(),
            created_at: Utc::now(),
        }
    }

    fn fast_config() -> PushConfig {
        PushConfig {
            retry_base_ms: 1,
            retry_max_ms: 2,
            ..PushConfig::default()
        }
    }

    #[tokio::test]
    async fn only_live_devices_are_pushed() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_subscription(device(2, "https://push/fresh", 1)).await;
        storage.insert_subscription(device(2, "https://push/stale", 45)).await;
        storage.insert_subscription(device(3, "https://push/other", 1)).await;
        let transport = Arc::new(FakeTransport::default());

        let dispatcher = PushDispatcher::new(storage, transport.clone(), fast_config());
        let report = dispatcher.dispatch(&signal(2)).await.unwrap();

        assert_eq!(report, DispatchReport { sent: 1, removed: 0, failed: 0 });
        assert_eq!(transport.delivered().await, vec!["https://push/fresh".to_string()]);
    }

    #[tokio::test]
    async fn rejected_subscription_is_removed() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_subscription(device(2, "https://push/gone", 0)).await;
        let transport = Arc::new(FakeTransport::default());
        transport.reject("https://push/gone").await;

        let dispatcher = PushDispatcher::new(storage.clone(), transport, fast_config());
        let report = dispatcher.dispatch(&signal(2)).await.unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(storage.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_subscription(device(2, "https://push/flaky", 0)).await;
        storage.insert_subscription(device(2, "https://push/down", 0)).await;
        let transport = Arc::new(FakeTransport::default());
        transport.fail_times("https://push/flaky", 2).await;
        transport.fail_times("https://push/down", usize::MAX).await;

        let config = fast_config();
        let max_attempts = config.max_attempts;
        let dispatcher = PushDispatcher::new(storage.clone(), transport.clone(), config);
        let report = dispatcher.dispatch(&signal(2)).await.unwrap();

        assert_eq!(report, DispatchReport { sent: 1, removed: 0, failed: 1 });
        assert_eq!(transport.attempts("https://push/flaky").await, 3);
        assert_eq!(transport.attempts("https://push/down").await, max_attempts);
        // Transient failures never remove a device.
        assert_eq!(storage.subscription_count().await, 2);
    }
}
