use anyhow::Result;
use axum::{
    extract::Extension,
    middleware,
    routing::{delete, get, post},
    Router,
};
use messenger_chat::{ConnectionRegistry, Dispatcher};
use messenger_core::config::ServerConfig;
use messenger_core::Storage;
use messenger_presence::UnreadCounterStore;
use messenger_push::SubscriptionService;
use redis::aio::ConnectionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing;

use crate::auth::{self, CredentialValidator};
use crate::handlers;
use crate::websocket;

/// Everything a request handler or a connection task needs.
#[derive(Clone)]
pub struct AppState {
    pub validator: Arc<dyn CredentialValidator>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub counters: Arc<dyn UnreadCounterStore>,
    pub storage: Arc<dyn Storage>,
    pub subscriptions: SubscriptionService,
    /// Pinged by the health check; `None` when running without Redis.
    pub redis: Option<ConnectionManager>,
}

/// Configure CORS - allow specific origins or all if none are configured
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some(origins) => {
            let mut cors = CorsLayer::new();
            for origin in origins.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
                if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                    cors = cors.allow_origin(parsed);
                } else {
                    tracing::warn!("Ignoring invalid CORS origin: {}", origin);
                }
            }
            cors.allow_methods(Any).allow_headers(Any)
        }
        None => {
            // Default to permissive for development, but log warning
            tracing::warn!("CORS_ORIGINS not set, using permissive CORS. Set CORS_ORIGINS for production!");
            CorsLayer::permissive()
        }
    }
}

pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(websocket::websocket_handler))
        .route("/api/v1/unread-counters", get(handlers::get_unread_counters))
        .route("/api/v1/push/subscriptions", post(handlers::subscribe))
        .route("/api/v1/push/subscriptions/recover", get(handlers::recover_subscription))
        .route("/api/v1/push/subscriptions/:device_id", delete(handlers::unsubscribe))
        .route("/api/v1/push/subscriptions/:device_id/alive", post(handlers::device_alive))
        .layer(
            ServiceBuilder::new()
                .layer(Extension(state))
                .layer(middleware::from_fn(auth::auth_middleware))
                .layer(cors),
        )
}

pub async fn run(state: AppState, config: &ServerConfig) -> Result<()> {
    let app = router(state, cors_layer(config.cors_origins.as_deref()));

    let addr: SocketAddr = format!("{}:{}", config.host, config.api_port).parse()?;
    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
