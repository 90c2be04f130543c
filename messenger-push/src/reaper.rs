use anyhow::Result;
use chrono::Utc;
use messenger_core::config::PushConfig;
use messenger_core::Storage;
use std::sync::Arc;
use tracing;

use crate::dispatcher::liveness;

/// Deletes subscriptions that missed heartbeats for longer than the
/// liveness window. Returns how many went.
pub async fn reap_once(storage: &dyn Storage, config: &PushConfig) -> Result<u64> {
    let stale_before = Utc::now() - liveness(config);
    let removed = storage.reap_push_subscriptions(stale_before).await?;
    if removed > 0 {
        tracing::info!("Reaped {} stale push subscriptions", removed);
    }
    Ok(removed)
}

pub async fn run(storage: Arc<dyn Storage>, config: PushConfig) -> Result<()> {
    tracing::info!(
        "Starting push subscription reaper (every {}s, liveness {}s)",
        config.reap_interval_secs,
        config.device_liveness_secs
    );

    let mut interval = tokio::time::interval(config.reap_interval());
    loop {
        interval.tick().await;
        if let Err(e) = reap_once(storage.as_ref(), &config).await {
            tracing::error!("Error reaping push subscriptions: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use messenger_core::storage::MemoryStorage;
    use messenger_core::types::PushSubscription;
    use uuid::Uuid;

    #[tokio::test]
    async fn devices_past_liveness_are_removed() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        for days in [1, 29, 31, 90] {
            storage
                .insert_subscription(PushSubscription {
                    device_id: Uuid::new_v4(),
                    user_id: 1,
                    endpoint: format!("https://push/{}", days),
                    p256dh: "k".to_string(),
                    auth: "a".to_string(),
                    created_at: now - Duration::days(days),
                    last_alive_at: now - Duration::days(days),
                })
                .await;
        }

        let removed = reap_once(&storage, &PushConfig::default()).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(storage.subscription_count().await, 2);
    }
}
