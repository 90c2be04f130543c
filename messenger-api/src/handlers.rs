use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Json,
};
use messenger_core::redis::ping;
use messenger_core::types::{ChatType, DeviceId, TicketStatus};
use messenger_core::MessengerError;
use serde::{Deserialize, Serialize};
use tracing;

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::server::AppState;

pub async fn health(Extension(state): Extension<AppState>) -> Json<serde_json::Value> {
    let redis = match state.redis.clone() {
        Some(mut conn) => match ping(&mut conn).await {
            Ok(()) => "ok",
            Err(e) => {
                tracing::warn!("Health check could not reach Redis: {}", e);
                "unavailable"
            }
        },
        None => "disabled",
    };
    let stats = state.registry.stats().await;

    Json(serde_json::json!({
        "status": "ok",
        "service": "messenger-api",
        "redis": redis,
        "connections": stats.connections,
    }))
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTypeCounts {
    pub personal: i64,
    #[serde(rename = "match")]
    pub match_: i64,
    pub ticket: i64,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketStatusCounts {
    pub new: i64,
    pub in_progress: i64,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnreadCountersResponse {
    pub total: i64,
    pub by_chat_type: ChatTypeCounts,
    pub by_ticket_status: TicketStatusCounts,
    /// Set when the cache could not be read; the counts are then zero.
    pub indeterminate: bool,
}

pub async fn get_unread_counters(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<UnreadCountersResponse>, ApiError> {
    let mut response = UnreadCountersResponse::default();

    match state.counters.get(user.user_id).await {
        Ok(counters) => {
            response.total = counters.total;
            response.by_chat_type = ChatTypeCounts {
                personal: counters.for_chat_type(ChatType::Personal),
                match_: counters.for_chat_type(ChatType::Match),
                ticket: counters.for_chat_type(ChatType::Ticket),
            };
        }
        Err(MessengerError::CacheUnavailable(e)) => {
            tracing::warn!("Unread counters for user {} are indeterminate: {}", user.user_id, e);
            response.indeterminate = true;
        }
        Err(e) => return Err(e.into()),
    }

    let tickets = state.storage.ticket_counters(user.user_id).await?;
    response.by_ticket_status = TicketStatusCounts {
        new: tickets.get(&TicketStatus::New).copied().unwrap_or(0),
        in_progress: tickets.get(&TicketStatus::InProgress).copied().unwrap_or(0),
    };

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceResponse {
    pub device_id: DeviceId,
}

pub async fn subscribe(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<SubscribeRequest>,
) -> Result<Json<DeviceResponse>, ApiError> {
    let subscription = state
        .subscriptions
        .subscribe(user.user_id, request.endpoint, request.keys.p256dh, request.keys.auth)
        .await?;
    Ok(Json(DeviceResponse {
        device_id: subscription.device_id,
    }))
}

pub async fn unsubscribe(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(device_id): Path<DeviceId>,
) -> Result<StatusCode, ApiError> {
    state.subscriptions.unsubscribe(user.user_id, device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn device_alive(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(device_id): Path<DeviceId>,
) -> Result<StatusCode, ApiError> {
    state.subscriptions.mark_alive(user.user_id, device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RecoverQuery {
    pub endpoint: String,
}

pub async fn recover_subscription(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(params): Query<RecoverQuery>,
) -> Result<Json<DeviceResponse>, ApiError> {
    let device_id = state.subscriptions.recover(user.user_id, &params.endpoint).await?;
    Ok(Json(DeviceResponse { device_id }))
}
