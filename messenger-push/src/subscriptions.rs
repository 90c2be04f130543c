//! Device registration for Web Push. Every operation is scoped to the
//! authenticated user; a device id belonging to someone else looks missing.

use chrono::Utc;
use messenger_core::types::{DeviceId, NewPushSubscription, PushSubscription, UserId};
use messenger_core::{MessengerError, MessengerResult, Storage};
use std::sync::Arc;
use tracing;

const MAX_ENDPOINT_LEN: usize = 2048;

#[derive(Clone)]
pub struct SubscriptionService {
    storage: Arc<dyn Storage>,
}

impl SubscriptionService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        SubscriptionService { storage }
    }

    /// Registers a device. Re-subscribing the same endpoint returns the
    /// existing device id.
    pub async fn subscribe(
        &self,
        user_id: UserId,
        endpoint: String,
        p256dh: String,
        auth: String,
    ) -> MessengerResult<PushSubscription> {
        validate_endpoint(&endpoint)?;
        if p256dh.is_empty() || auth.is_empty() {
            return Err(MessengerError::Validation("subscription keys are required".to_string()));
        }

        let subscription = self
            .storage
            .upsert_push_subscription(NewPushSubscription {
                user_id,
                endpoint,
                p256dh,
                auth,
            })
            .await?;
        tracing::info!("Push device {} registered for user {}", subscription.device_id, user_id);
        Ok(subscription)
    }

    pub async fn unsubscribe(&self, user_id: UserId, device_id: DeviceId) -> MessengerResult<()> {
        self.owned(user_id, device_id).await?;
        self.storage.remove_push_subscription(device_id).await?;
        tracing::info!("Push device {} removed by user {}", device_id, user_id);
        Ok(())
    }

    /// Heartbeat from the service worker.
    pub async fn mark_alive(&self, user_id: UserId, device_id: DeviceId) -> MessengerResult<()> {
        self.owned(user_id, device_id).await?;
        if !self.storage.touch_push_subscription(device_id, Utc::now()).await? {
            return Err(not_found(device_id));
        }
        Ok(())
    }

    /// Finds the device id a browser was given for `endpoint`.
    pub async fn recover(&self, user_id: UserId, endpoint: &str) -> MessengerResult<DeviceId> {
        validate_endpoint(endpoint)?;
        self.storage
            .find_push_subscription_by_endpoint(user_id, endpoint)
            .await?
            .map(|s| s.device_id)
            .ok_or_else(|| MessengerError::NotFound("push subscription".to_string()))
    }

    async fn owned(&self, user_id: UserId, device_id: DeviceId) -> MessengerResult<PushSubscription> {
        match self.storage.get_push_subscription(device_id).await? {
            Some(subscription) if subscription.user_id == user_id => Ok(subscription),
            _ => Err(not_found(device_id)),
        }
    }
}

fn not_found(device_id: DeviceId) -> MessengerError {
    MessengerError::NotFound(format!("push device {}", device_id))
}

fn validate_endpoint(endpoint: &str) -> MessengerResult<()> {
    if !endpoint.starts_with("https://") || endpoint.len() > MAX_ENDPOINT_LEN {
        return Err(MessengerError::Validation(
            "endpoint must be an https URL".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use messenger_core::storage::MemoryStorage;

    fn service() -> SubscriptionService {
        SubscriptionService::new(Arc::new(MemoryStorage::new()))
    }

    async fn subscribe(service: &SubscriptionService, user_id: UserId, endpoint: &str) -> PushSubscription {
        service
            .subscribe(user_id, endpoint.to_string(), "p256dh".to_string(), "auth".to_string())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn same_endpoint_keeps_its_device_id() {
        let service = service();
        let first = subscribe(&service, 1, "https://push.example/a").await;
        let again = subscribe(&service, 1, "https://push.example/a").await;
        assert_eq!(first.device_id, again.device_id);

        let recovered = service.recover(1, "https://push.example/a").await.unwrap();
        assert_eq!(recovered, first.device_id);
    }

    #[tokio::test]
    async fn other_users_cannot_touch_a_device() {
        let service = service();
        let device = subscribe(&service, 1, "https://push.example/b").await;

        assert!(matches!(
            service.unsubscribe(2, device.device_id).await,
            Err(MessengerError::NotFound(_))
        ));
        assert!(service.mark_alive(2, device.device_id).await.is_err());
        assert!(service.recover(2, "https://push.example/b").await.is_err());

        service.mark_alive(1, device.device_id).await.unwrap();
        service.unsubscribe(1, device.device_id).await.unwrap();
        assert!(service.mark_alive(1, device.device_id).await.is_err());
    }

    #[tokio::test]
    async fn plain_http_endpoints_are_rejected() {
        let service = service();
        let result = service
            .subscribe(1, "http://push.example/c".to_string(), "k".to_string(), "a".to_string())
            .await;
        assert!(matches!(result, Err(MessengerError::Validation(_))));
    }
}
