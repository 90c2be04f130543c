use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Extension, Query,
    },
    http::{HeaderMap, StatusCode},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use messenger_chat::{CommandContext, ConnectionHandle, ConnectionRegistry, Dispatcher};
use messenger_core::protocol::{decode_body, encode_event, Activity, ClientCommand, FrameDecoder, ProtocolError, ServerEvent};
use messenger_core::types::ConnectionId;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing;

use crate::auth::{token_from_request, AuthenticatedUser};
use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, StatusCode> {
    let user = authenticate_handshake(&state, &headers, query.token.as_deref()).await?;
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user, remote_addr, state)))
}

/// Rejects the handshake before the upgrade when the credential is missing
/// or invalid.
pub async fn authenticate_handshake(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<AuthenticatedUser, StatusCode> {
    let token = token_from_request(headers, query_token).ok_or_else(|| {
        tracing::debug!("WebSocket handshake without credentials");
        StatusCode::UNAUTHORIZED
    })?;
    state.validator.validate(&token).await
}

async fn handle_socket(socket: WebSocket, user: AuthenticatedUser, remote_addr: Option<SocketAddr>, state: AppState) {
    let (handle, mut outbound) = ConnectionHandle::new(user.user_id, user.role, remote_addr);
    let handle = Arc::new(handle);
    let connection_id = handle.id;

    if let Err(e) = state.registry.register(handle.clone()).await {
        tracing::error!("Failed to register connection for user {}: {}", user.user_id, e);
        return;
    }
    let guard = RegistrationGuard::new(state.registry.clone(), connection_id);

    tracing::info!("WebSocket connection {} established for user {}", connection_id, user.user_id);

    handle.send(ServerEvent::Connected {
        connection_id,
        user_id: user.user_id,
    });

    let (mut sender, mut receiver) = socket.split();

    // Drain the connection's queue onto the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let bytes = match encode_event(&event) {
                Ok(b) => b,
                Err(e) => {
                    tracing::error!("Failed to encode {} for connection {}: {}", event.kind(), connection_id, e);
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Binary(bytes.to_vec())).await {
                tracing::debug!("Failed to send WebSocket message on {}: {}", connection_id, e);
                break;
            }
        }
        let _ = sender.close().await;
    });

    let ctx = CommandContext {
        connection_id,
        user_id: user.user_id,
        role: user.role,
    };
    let dispatcher = state.dispatcher.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if let Err(e) = process_chunk(&dispatcher, &ctx, &mut decoder, &data).await {
                        tracing::warn!("Closing connection {}: {}", connection_id, e);
                        break;
                    }
                }
                Ok(Message::Ping(_)) => {
                    // Counts as activity
                    dispatcher
                        .dispatch(&ctx, ClientCommand::Activity(Activity { chat_id: None }))
                        .await;
                }
                Ok(Message::Text(_)) => {
                    dispatcher
                        .reject_frame(&ctx, "text messages are not supported".to_string())
                        .await;
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!("WebSocket read error on {}: {}", connection_id, e);
                    break;
                }
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    guard.release().await;
    tracing::info!("WebSocket connection {} closed for user {}", connection_id, user.user_id);
}

/// Feeds one binary message into the decoder and dispatches every complete
/// frame in order. Only a fatal protocol error is returned; a frame that
/// fails to decode is reported to the client and skipped.
pub async fn process_chunk(
    dispatcher: &Dispatcher,
    ctx: &CommandContext,
    decoder: &mut FrameDecoder,
    chunk: &[u8],
) -> Result<usize, ProtocolError> {
    decoder.extend(chunk);
    let mut dispatched = 0;
    while let Some(body) = decoder.next_frame()? {
        match decode_body::<ClientCommand>(&body) {
            Ok(command) => {
                dispatcher.dispatch(ctx, command).await;
                dispatched += 1;
            }
            Err(e) => dispatcher.reject_frame(ctx, e.to_string()).await,
        }
    }
    Ok(dispatched)
}

/// Unregisters the connection when the socket task ends, including when the
/// task is dropped before reaching its own cleanup.
struct RegistrationGuard {
    registry: Arc<ConnectionRegistry>,
    connection_id: ConnectionId,
    released: bool,
}

impl RegistrationGuard {
    fn new(registry: Arc<ConnectionRegistry>, connection_id: ConnectionId) -> Self {
        RegistrationGuard {
            registry,
            connection_id,
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        self.registry.unregister(self.connection_id).await;
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let registry = self.registry.clone();
        let connection_id = self.connection_id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    registry.unregister(connection_id).await;
                });
            }
            Err(_) => {
                tracing::warn!("No runtime to unregister connection {}", connection_id);
            }
        }
    }
}
