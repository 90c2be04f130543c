//! Live connections held by this process.
//!
//! The table is process-local. A user with connections on several processes
//! appears in each process's registry only with the connections that
//! process holds; the event bus bridges the rest.

use messenger_bus::{BusEnvelope, Channel, EventBus};
use messenger_core::protocol::ServerEvent;
use messenger_core::types::{ConnectionId, Role, UserId};
use messenger_core::MessengerResult;
use messenger_presence::PresenceStore;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing;
use uuid::Uuid;

pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub role: Role,
    pub remote_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    /// New handle plus the receiving end its writer task drains.
    pub fn new(
        user_id: UserId,
        role: Role,
        remote_addr: Option<SocketAddr>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id: Uuid::new_v4(),
            user_id,
            role,
            remote_addr,
            outbound,
        };
        (handle, rx)
    }

    /// Queues the event for the writer. False once the writer has gone away.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.outbound.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

#[derive(Default)]
struct Table {
    connections: HashMap<ConnectionId, Arc<ConnectionHandle>>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// First connection of this user on this process.
    pub first_local: bool,
    /// The user had no presence before this connection.
    pub came_online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub connections: usize,
    pub users: usize,
}

pub struct ConnectionRegistry {
    table: RwLock<Table>,
    bus: Arc<dyn EventBus>,
    presence: Arc<dyn PresenceStore>,
}

impl ConnectionRegistry {
    pub fn new(bus: Arc<dyn EventBus>, presence: Arc<dyn PresenceStore>) -> Self {
        ConnectionRegistry {
            table: RwLock::new(Table::default()),
            bus,
            presence,
        }
    }

    pub fn process_id(&self) -> Uuid {
        self.bus.process_id()
    }

    /// Adds the connection, subscribes this process to the user's channel
    /// when it is the user's first local connection and marks the user
    /// active.
    pub async fn register(&self, handle: Arc<ConnectionHandle>) -> MessengerResult<Registration> {
        let (user_id, role, connection_id) = (handle.user_id, handle.role, handle.id);

        let first_local = {
            // Bus commands are issued under the lock so a concurrent
            // unregister of the same user cannot reorder them.
            let mut table = self.table.write().await;
            let first_local = table.by_user.get(&user_id).map_or(true, |ids| ids.is_empty());
            self.subscribe_channels(user_id, connection_id, first_local).await?;

            table.connections.insert(connection_id, handle);
            table.by_user.entry(user_id).or_default().insert(connection_id);
            first_local
        };

        let came_online = match self.presence.set_active(user_id, role).await {
            Ok(came_online) => came_online,
            Err(e) => {
                tracing::warn!(user_id, "Failed to mark user active on connect: {}", e);
                false
            }
        };

        if came_online {
            let envelope = BusEnvelope::new(
                Channel::Broadcast,
                ServerEvent::PresenceChanged { user_id, role, online: true },
            );
            if let Err(e) = self.bus.publish(&envelope).await {
                tracing::warn!(user_id, "Failed to broadcast presence: {}", e);
            }
        }

        let stats = self.stats().await;
        tracing::info!(
            "Connection {} registered for user {} ({} connections, {} users)",
            connection_id,
            user_id,
            stats.connections,
            stats.users
        );

        Ok(Registration { first_local, came_online })
    }

    /// Either both channels end up subscribed or neither does.
    async fn subscribe_channels(&self, user_id: UserId, connection_id: ConnectionId, first_local: bool) -> MessengerResult<()> {
        if first_local {
            self.bus.subscribe(Channel::User(user_id)).await?;
        }
        if let Err(e) = self.bus.subscribe(Channel::Connection(connection_id)).await {
            if first_local {
                if let Err(e) = self.bus.unsubscribe(Channel::User(user_id)).await {
                    tracing::warn!(user_id, "Failed to roll back user channel: {}", e);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Removes the connection. Idempotent; returns the removed handle the
    /// first time only.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let mut table = self.table.write().await;
        let handle = table.connections.remove(&connection_id)?;
        let user_id = handle.user_id;

        let last_local = match table.by_user.get_mut(&user_id) {
            Some(ids) => {
                ids.remove(&connection_id);
                ids.is_empty()
            }
            None => true,
        };
        if last_local {
            table.by_user.remove(&user_id);
        }

        if let Err(e) = self.bus.unsubscribe(Channel::Connection(connection_id)).await {
            tracing::warn!("Failed to unsubscribe connection channel {}: {}", connection_id, e);
        }
        if last_local {
            if let Err(e) = self.bus.unsubscribe(Channel::User(user_id)).await {
                tracing::warn!(user_id, "Failed to unsubscribe user channel: {}", e);
            }
        }

        tracing::info!(
            "Connection {} unregistered for user {} ({} connections, {} users)",
            connection_id,
            user_id,
            table.connections.len(),
            table.by_user.len()
        );
        Some(handle)
    }

    /// Connections of `user_id` on this process.
    pub async fn list(&self, user_id: UserId) -> Vec<Arc<ConnectionHandle>> {
        let table = self.table.read().await;
        table
            .by_user
            .get(&user_id)
            .map(|ids| ids.iter().filter_map(|id| table.connections.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn get(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.table.read().await.connections.get(&connection_id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.table.read().await.connections.values().cloned().collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let table = self.table.read().await;
        RegistryStats {
            connections: table.connections.len(),
            users: table.by_user.len(),
        }
    }

    /// Hands the event to every local connection of the user except `skip`.
    /// Returns how many accepted it.
    pub async fn deliver_to_user(&self, user_id: UserId, event: &ServerEvent, skip: Option<ConnectionId>) -> usize {
        deliver(self.list(user_id).await, event, skip)
    }

    pub async fn deliver_to_connection(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        match self.get(connection_id).await {
            Some(handle) => handle.send(event),
            None => false,
        }
    }

    pub async fn deliver_to_all(&self, event: &ServerEvent, skip: Option<ConnectionId>) -> usize {
        deliver(self.all().await, event, skip)
    }
}

fn deliver(handles: Vec<Arc<ConnectionHandle>>, event: &ServerEvent, skip: Option<ConnectionId>) -> usize {
    let mut delivered = 0;
    for handle in handles {
        if Some(handle.id) == skip {
            continue;
        }
        if handle.send(event.clone()) {
            delivered += 1;
        } else {
            tracing::debug!("Connection {} writer is gone, skipping", handle.id);
        }
    }
    delivered
}
