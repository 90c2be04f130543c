//! In-memory application state for handler tests.

use messenger_bus::{BusEnvelope, LocalBusHub};
use messenger_chat::{ChatServices, CommandContext, ConnectionHandle, ConnectionRegistry, Dispatcher, Fanout, PushSignalSink};
use messenger_core::config::ChatConfig;
use messenger_core::protocol::ServerEvent;
use messenger_core::storage::MemoryStorage;
use messenger_core::types::{Chat, ChatId, ChatMembership, ChatPermissions, ChatType, PushSignal, Role, UserId};
use messenger_core::MessengerResult;
use messenger_presence::{MemoryCounters, MemoryPresence, MemoryReplayGuard};
use messenger_push::SubscriptionService;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{generate_token, JwtValidator};
use crate::server::AppState;

pub const SECRET: &str = "test-secret";
pub const CHAT: ChatId = 10;
pub const SCOUT: UserId = 1;
pub const BOOKMAKER: UserId = 2;

struct DiscardPushSignals;

#[async_trait::async_trait]
impl PushSignalSink for DiscardPushSignals {
    async fn submit(&self, _signal: &PushSignal) -> MessengerResult<()> {
        Ok(())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub storage: Arc<MemoryStorage>,
    pub counters: Arc<MemoryCounters>,
    _inbound: mpsc::UnboundedReceiver<BusEnvelope>,
}

impl TestApp {
    pub async fn new() -> Self {
        let hub = LocalBusHub::new();
        let (bus, inbound) = hub.attach(Uuid::new_v4()).await;
        let bus = Arc::new(bus);

        let storage = Arc::new(MemoryStorage::new());
        storage
            .add_chat(Chat { id: CHAT, chat_type: ChatType::Personal, match_id: None })
            .await;
        for (user_id, role) in [(SCOUT, Role::Scout), (BOOKMAKER, Role::Bookmaker)] {
            storage
                .add_member(ChatMembership {
                    chat_id: CHAT,
                    user_id,
                    role,
                    permissions: ChatPermissions::MEMBER,
                    is_primary: true,
                    last_read_message_id: None,
                })
                .await;
        }

        let presence = Arc::new(MemoryPresence::default());
        let counters = Arc::new(MemoryCounters::new(None));
        let registry = Arc::new(ConnectionRegistry::new(bus.clone(), presence.clone()));
        let fanout = Arc::new(Fanout::new(
            registry.clone(),
            bus,
            presence.clone(),
            storage.clone(),
            Arc::new(DiscardPushSignals),
        ));
        let services = ChatServices {
            storage: storage.clone(),
            presence: presence.clone(),
            counters: counters.clone(),
            replay: Arc::new(MemoryReplayGuard::new()),
            settings: ChatConfig::default(),
        };

        let state = AppState {
            validator: Arc::new(JwtValidator::new(SECRET)),
            registry,
            dispatcher: Arc::new(Dispatcher::new(services, fanout)),
            counters: counters.clone(),
            storage: storage.clone(),
            subscriptions: SubscriptionService::new(storage.clone()),
            redis: None,
        };

        TestApp {
            state,
            storage,
            counters,
            _inbound: inbound,
        }
    }

    pub fn token(&self, user_id: UserId, role: Role) -> String {
        generate_token(user_id, role, SECRET, 3600).unwrap()
    }

    /// Registers a connection directly, bypassing the socket.
    pub async fn connect(&self, user_id: UserId, role: Role) -> (CommandContext, mpsc::UnboundedReceiver<ServerEvent>) {
        let (handle, events) = ConnectionHandle::new(user_id, role, None);
        let ctx = CommandContext {
            connection_id: handle.id,
            user_id,
            role,
        };
        self.state.registry.register(Arc::new(handle)).await.unwrap();
        (ctx, events)
    }
}
