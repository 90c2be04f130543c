use anyhow::{anyhow, Result};
use async_trait::async_trait;
use messenger_core::config::PushConfig;
use messenger_core::types::PushSubscription;
use std::fs;
use thiserror::Error;
use tracing;
use web_push::{
    ContentEncoding, IsahcWebPushClient, PartialVapidSignatureBuilder, SubscriptionInfo, Urgency,
    VapidSignatureBuilder, WebPushClient, WebPushError, WebPushMessageBuilder,
};

#[derive(Debug, Error)]
pub enum PushError {
    /// The push service no longer accepts this subscription.
    #[error("subscription rejected: {0}")]
    Rejected(String),

    #[error("transient push failure: {0}")]
    Transient(String),

    #[error("push failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8], ttl: u32) -> Result<(), PushError>;
}

pub struct WebPushTransport {
    client: IsahcWebPushClient,
    vapid: Option<PartialVapidSignatureBuilder>,
    subject: Option<String>,
}

impl WebPushTransport {
    pub fn new(config: &PushConfig) -> Result<Self> {
        let client = IsahcWebPushClient::new().map_err(|e| anyhow!("Failed to create Web Push client: {}", e))?;

        let key_pem = if let Some(key_content_base64) = &config.vapid_private_key_content {
            use base64::Engine;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(key_content_base64)
                .map_err(|e| anyhow!("Failed to decode base64 VAPID key: {}", e))?;
            Some(decoded)
        } else if let Some(key_path) = &config.vapid_private_key_path {
            let pem = fs::read(key_path).map_err(|e| anyhow!("Failed to read VAPID key file {}: {}", key_path, e))?;
            Some(pem)
        } else {
            None
        };

        let vapid = match key_pem {
            Some(pem) => {
                tracing::info!("Initializing Web Push VAPID signer");
                let builder = VapidSignatureBuilder::from_pem_no_sub(pem.as_slice())
                    .map_err(|e| anyhow!("Failed to parse VAPID key: {}", e))?;
                tracing::info!("Web Push VAPID signer initialized successfully");
                Some(builder)
            }
            None => {
                tracing::warn!("Web Push delivery disabled (missing VAPID key)");
                None
            }
        };

        Ok(Self {
            client,
            vapid,
            subject: config.vapid_subject.clone(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.vapid.is_some()
    }
}

/// Sorts push service failures into what the dispatcher acts on.
pub fn classify(error: &WebPushError) -> PushError {
    match error.short_description() {
        "endpoint_not_valid" | "endpoint_not_found" => PushError::Rejected(error.to_string()),
        "server_error" | "timeout" | "io_error" | "unspecified" => PushError::Transient(error.to_string()),
        _ => PushError::Other(error.to_string()),
    }
}

#[async_trait]
impl PushTransport for WebPushTransport {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8], ttl: u32) -> Result<(), PushError> {
        let vapid = match &self.vapid {
            Some(v) => v,
            None => {
                tracing::debug!("Web Push not configured, skipping");
                return Ok(());
            }
        };

        let info = SubscriptionInfo::new(&subscription.endpoint, &subscription.p256dh, &subscription.auth);

        let mut signature = vapid.clone().add_sub_info(&info);
        if let Some(subject) = &self.subject {
            signature.add_claim("sub", subject.as_str());
        }
        let signature = signature.build().map_err(|e| PushError::Other(e.to_string()))?;

        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(signature);
        builder.set_ttl(ttl);
        builder.set_urgency(Urgency::High);
        let message = builder.build().map_err(|e| PushError::Other(e.to_string()))?;

        self.client.send(message).await.map_err(|e| classify(&e))?;

        tracing::debug!("Web Push notification sent to device {}", subscription.device_id);
        Ok(())
    }
}
