//! End-to-end command flows across two processes sharing one bus, one cache
//! and one store.

use async_trait::async_trait;
use messenger_bus::{Channel, EventBus, LocalBusHub, LocalEventBus};
use messenger_chat::{
    run_inbound, ChatServices, CommandContext, ConnectionHandle, ConnectionRegistry, DispatchOutcome, Dispatcher,
    Fanout, PushSignalSink,
};
use messenger_core::config::ChatConfig;
use messenger_core::protocol::{
    ClientCommand, DeleteMessage, EditMessage, ErrorReason, React, Receipt, SendMessage, ServerEvent,
};
use messenger_core::storage::MemoryStorage;
use messenger_core::types::{
    Chat, ChatMembership, ChatPermissions, ChatType, DeliveryStatus, MessageContent, MessageId, PushSignal, Role,
    UserId,
};
use messenger_core::{MessengerResult, Storage};
use messenger_presence::{MemoryCounters, MemoryPresence, MemoryReplayGuard, PresenceStore, UnreadCounterStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

const CHAT: i64 = 10;
const SCOUT: UserId = 1;
const BOOKMAKER: UserId = 2;

#[derive(Default)]
struct RecordingPushSignals {
    signals: Mutex<Vec<PushSignal>>,
}

#[async_trait]
impl PushSignalSink for RecordingPushSignals {
    async fn submit(&self, signal: &PushSignal) -> MessengerResult<()> {
        self.signals.lock().await.push(signal.clone());
        Ok(())
    }
}

struct Shared {
    hub: LocalBusHub,
    storage: Arc<MemoryStorage>,
    presence: Arc<MemoryPresence>,
    counters: Arc<MemoryCounters>,
    replay: Arc<MemoryReplayGuard>,
    push: Arc<RecordingPushSignals>,
    counters_bus: Arc<LocalEventBus>,
}

impl Shared {
    async fn new() -> Self {
        let hub = LocalBusHub::new();
        // Counter changes are published without an origin, so any handle on
        // the hub works for them.
        let (counters_bus, _rx) = hub.attach(Uuid::new_v4()).await;
        let counters_bus = Arc::new(counters_bus);

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

        Shared {
            hub,
            storage,
            presence: Arc::new(MemoryPresence::default()),
            counters: Arc::new(MemoryCounters::new(Some(counters_bus.clone()))),
            replay: Arc::new(MemoryReplayGuard::new()),
            push: Arc::new(RecordingPushSignals::default()),
            counters_bus,
        }
    }

    async fn node(&self) -> Node {
        let (bus, inbound) = self.hub.attach(Uuid::new_v4()).await;
        let bus = Arc::new(bus);
        bus.subscribe(Channel::Broadcast).await.unwrap();

        let registry = Arc::new(ConnectionRegistry::new(bus.clone(), self.presence.clone()));
        let fanout = Arc::new(Fanout::new(
            registry.clone(),
            bus.clone(),
            self.presence.clone(),
            self.storage.clone(),
            self.push.clone(),
        ));
        let services = ChatServices {
            storage: self.storage.clone(),
            presence: self.presence.clone(),
            counters: self.counters.clone(),
            replay: self.replay.clone(),
            settings: ChatConfig::default(),
        };
        tokio::spawn(run_inbound(registry.clone(), inbound));

        Node {
            registry,
            dispatcher: Dispatcher::new(services, fanout),
            bus,
        }
    }
}

struct Node {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    bus: Arc<LocalEventBus>,
}

struct Client {
    ctx: CommandContext,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Node {
    async fn connect(&self, user_id: UserId, role: Role) -> Client {
        let (handle, events) = ConnectionHandle::new(user_id, role, None);
        let ctx = CommandContext {
            connection_id: handle.id,
            user_id,
            role,
        };
        self.registry.register(Arc::new(handle)).await.unwrap();
        Client { ctx, events }
    }

    async fn send(&self, client: &Client, command: ClientCommand) -> DispatchOutcome {
        self.dispatcher.dispatch(&client.ctx, command).await
    }
}

impl Client {
    /// Waits for the first event matching `pred`, discarding the rest.
    async fn expect<F>(&mut self, mut pred: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        let wait = async {
            loop {
                let event = self.events.recv().await.expect("connection closed");
                if pred(&event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("timed out waiting for event")
    }

    /// Drains what has arrived so far, after letting the bus settle.
    async fn drain(&mut self) -> Vec<ServerEvent> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn text(temporary_id: &str, body: &str) -> ClientCommand {
    ClientCommand::SendMessage(SendMessage {
        temporary_id: temporary_id.to_string(),
        chat_id: CHAT,
        content: MessageContent::Text { text: body.to_string() },
        reply_to: None,
    })
}

async fn sent_id(client: &mut Client) -> MessageId {
    match client.expect(|e| matches!(e, ServerEvent::MessageSent { .. })).await {
        ServerEvent::MessageSent { message_id, .. } => message_id,
        other => panic!("unexpected event {:?}", other),
    }
}

async fn status_of(shared: &Shared, message_id: MessageId) -> DeliveryStatus {
    shared
        .storage
        .get_message(message_id)
        .await
        .unwrap()
        .unwrap()
        .delivery_status
}

#[tokio::test]
async fn message_reaches_recipient_on_another_process() {
    let shared = Shared::new().await;
    let (a, b) = (shared.node().await, shared.node().await);
    let mut scout = a.connect(SCOUT, Role::Scout).await;
    let mut bookmaker = b.connect(BOOKMAKER, Role::Bookmaker).await;

    let outcome = a.send(&scout, text("tmp-1", "hello")).await;
    assert!(matches!(outcome, DispatchOutcome::Emitted(report) if report.push_signals == 0));

    let message_id = sent_id(&mut scout).await;
    let events = bookmaker.drain().await;
    let received = events
        .iter()
        .find(|e| matches!(e, ServerEvent::NewMessage { .. }))
        .expect("new message delivered");
    match received {
        ServerEvent::NewMessage { chat_type, message } => {
            assert_eq!(*chat_type, ChatType::Personal);
            assert_eq!(message.id, message_id);
            assert_eq!(message.sender_id, Some(SCOUT));
        }
        other => panic!("unexpected event {:?}", other),
    }
    let counters = events
        .iter()
        .find(|e| matches!(e, ServerEvent::UnreadCountersChanged { .. }))
        .expect("counters pushed");
    assert_eq!(
        *counters,
        ServerEvent::UnreadCountersChanged {
            chat_id: CHAT,
            chat_type: ChatType::Personal,
            by_chat: 1,
            by_chat_type: 1,
            total: 1,
        }
    );

    // The sender's own connection only gets the ack.
    assert!(scout
        .drain()
        .await
        .iter()
        .all(|e| !matches!(e, ServerEvent::NewMessage { .. })));
    assert_eq!(status_of(&shared, message_id).await, DeliveryStatus::Sent);
    assert!(shared.push.signals.lock().await.is_empty());
}

#[tokio::test]
async fn read_receipt_resets_counters_once() {
    let shared = Shared::new().await;
    let (a, b) = (shared.node().await, shared.node().await);
    let mut scout = a.connect(SCOUT, Role::Scout).await;
    let mut bookmaker = b.connect(BOOKMAKER, Role::Bookmaker).await;

    a.send(&scout, text("tmp-1", "first")).await;
    a.send(&scout, text("tmp-2", "second")).await;
    let first = sent_id(&mut scout).await;
    let second = sent_id(&mut scout).await;
    assert_eq!(shared.counters.get_by_chat(BOOKMAKER, CHAT).await.unwrap(), 2);

    let read = ClientCommand::Read(Receipt { message_id: second });
    assert!(matches!(b.send(&bookmaker, read.clone()).await, DispatchOutcome::Emitted(_)));

    let changed = scout
        .expect(|e| matches!(e, ServerEvent::DeliveryStatusChanged { .. }))
        .await;
    assert_eq!(
        changed,
        ServerEvent::DeliveryStatusChanged {
            chat_id: CHAT,
            message_id: second,
            user_id: BOOKMAKER,
            status: DeliveryStatus::Read,
        }
    );
    let reset = bookmaker
        .expect(|e| matches!(e, ServerEvent::UnreadCountersChanged { by_chat: 0, .. }))
        .await;
    assert!(matches!(reset, ServerEvent::UnreadCountersChanged { total: 0, .. }));
    // Reading the latest message reads everything before it.
    assert_eq!(status_of(&shared, first).await, DeliveryStatus::Read);

    // A retried receipt changes nothing.
    shared.counters.increment(BOOKMAKER, CHAT, ChatType::Personal).await.unwrap();
    assert_eq!(b.send(&bookmaker, read).await, DispatchOutcome::Silent);
    assert_eq!(shared.counters.get_by_chat(BOOKMAKER, CHAT).await.unwrap(), 1);
    assert_eq!(status_of(&shared, second).await, DeliveryStatus::Read);
}

#[tokio::test]
async fn failed_read_receipt_can_be_retried() {
    let shared = Shared::new().await;
    let (a, b) = (shared.node().await, shared.node().await);
    let mut scout = a.connect(SCOUT, Role::Scout).await;
    let bookmaker = b.connect(BOOKMAKER, Role::Bookmaker).await;

    a.send(&scout, text("tmp-1", "hello")).await;
    let message_id = sent_id(&mut scout).await;
    assert_eq!(shared.counters.get_by_chat(BOOKMAKER, CHAT).await.unwrap(), 1);

    shared.storage.fail_read_marks(1).await;
    let read = ClientCommand::Read(Receipt { message_id });
    assert_eq!(
        b.send(&bookmaker, read.clone()).await,
        DispatchOutcome::Rejected(ErrorReason::Server)
    );
    assert_eq!(shared.counters.get_by_chat(BOOKMAKER, CHAT).await.unwrap(), 1);
    assert_eq!(status_of(&shared, message_id).await, DeliveryStatus::Sent);

    assert!(matches!(b.send(&bookmaker, read).await, DispatchOutcome::Emitted(_)));
    assert_eq!(shared.counters.get_by_chat(BOOKMAKER, CHAT).await.unwrap(), 0);
    assert_eq!(status_of(&shared, message_id).await, DeliveryStatus::Read);
}

#[tokio::test]
async fn observers_read_only_for_themselves() {
    const OBSERVER: UserId = 3;
    let shared = Shared::new().await;
    shared
        .storage
        .add_member(ChatMembership {
            chat_id: CHAT,
            user_id: OBSERVER,
            role: Role::Supervisor,
            permissions: ChatPermissions::OBSERVER,
            is_primary: false,
            last_read_message_id: None,
        })
        .await;
    let a = shared.node().await;
    let mut scout = a.connect(SCOUT, Role::Scout).await;
    let mut bookmaker = a.connect(BOOKMAKER, Role::Bookmaker).await;
    let observer = a.connect(OBSERVER, Role::Supervisor).await;

    a.send(&scout, text("tmp-1", "watched")).await;
    let message_id = sent_id(&mut scout).await;
    assert_eq!(shared.counters.get_by_chat(OBSERVER, CHAT).await.unwrap(), 1);

    let read = ClientCommand::Read(Receipt { message_id });
    assert_eq!(a.send(&observer, read).await, DispatchOutcome::Silent);
    assert_eq!(shared.counters.get_by_chat(OBSERVER, CHAT).await.unwrap(), 0);
    assert_eq!(status_of(&shared, message_id).await, DeliveryStatus::Sent);
    let membership = shared.storage.get_membership(CHAT, OBSERVER).await.unwrap().unwrap();
    assert_eq!(membership.last_read_message_id, Some(message_id));
    assert!(bookmaker
        .drain()
        .await
        .iter()
        .all(|e| !matches!(e, ServerEvent::DeliveryStatusChanged { .. })));
}

#[tokio::test]
async fn sender_devices_alone_do_not_mark_a_message_sent() {
    let shared = Shared::new().await;
    let (a, b) = (shared.node().await, shared.node().await);
    let mut scout = a.connect(SCOUT, Role::Scout).await;
    let _laptop = b.connect(SCOUT, Role::Scout).await;
    // Online according to presence, but connected nowhere.
    shared.presence.set_active(BOOKMAKER, Role::Bookmaker).await.unwrap();

    let outcome = a.send(&scout, text("tmp-1", "anyone?")).await;
    let message_id = sent_id(&mut scout).await;

    match outcome {
        DispatchOutcome::Emitted(report) => {
            assert_eq!(report.recipients, 0);
            assert_eq!(report.push_signals, 0);
            assert!(report.remote >= 1);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(shared.push.signals.lock().await.is_empty());
    assert_eq!(status_of(&shared, message_id).await, DeliveryStatus::Pending);
}

#[tokio::test]
async fn offline_recipient_gets_push_signal() {
    let shared = Shared::new().await;
    let a = shared.node().await;
    let mut scout = a.connect(SCOUT, Role::Scout).await;

    let outcome = a.send(&scout, text("tmp-1", "are you there?")).await;
    let message_id = sent_id(&mut scout).await;

    assert!(matches!(outcome, DispatchOutcome::Emitted(report) if report.push_signals == 1));
    let signals = shared.push.signals.lock().await.clone();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].recipient, BOOKMAKER);
    assert_eq!(signals[0].recipient_role, Role::Bookmaker);
    assert_eq!(signals[0].message_id, message_id);
    assert_eq!(signals[0].preview, "are you there?");

    assert_eq!(shared.counters.get_by_chat(BOOKMAKER, CHAT).await.unwrap(), 1);
    assert_eq!(status_of(&shared, message_id).await, DeliveryStatus::Sent);
}

#[tokio::test]
async fn cache_outage_degrades_to_push_without_losing_the_message() {
    let shared = Shared::new().await;
    let (a, b) = (shared.node().await, shared.node().await);
    let mut scout = a.connect(SCOUT, Role::Scout).await;
    let mut bookmaker = b.connect(BOOKMAKER, Role::Bookmaker).await;

    shared.presence.set_unavailable(true).await;
    shared.counters.set_unavailable(true).await;

    a.send(&scout, text("tmp-1", "still works")).await;
    let message_id = sent_id(&mut scout).await;

    bookmaker
        .expect(|e| matches!(e, ServerEvent::NewMessage { message, .. } if message.id == message_id))
        .await;
    // Presence is indeterminate, so the recipient is also pushed.
    let signals = shared.push.signals.lock().await.clone();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].recipient, BOOKMAKER);
    assert!(shared.counters.get(BOOKMAKER).await.is_err());
}

#[tokio::test]
async fn other_devices_of_the_sender_see_the_message() {
    let shared = Shared::new().await;
    let (a, b) = (shared.node().await, shared.node().await);
    let mut phone = a.connect(SCOUT, Role::Scout).await;
    let mut laptop = b.connect(SCOUT, Role::Scout).await;
    let mut tablet = a.connect(SCOUT, Role::Scout).await;

    a.send(&phone, text("tmp-1", "sync me")).await;
    let message_id = sent_id(&mut phone).await;

    for device in [&mut laptop, &mut tablet] {
        device
            .expect(|e| matches!(e, ServerEvent::NewMessage { message, .. } if message.id == message_id))
            .await;
        assert!(device
            .drain()
            .await
            .iter()
            .all(|e| !matches!(e, ServerEvent::MessageSent { .. })));
    }
    assert!(phone
        .drain()
        .await
        .iter()
        .all(|e| !matches!(e, ServerEvent::NewMessage { .. })));
}

#[tokio::test]
async fn invalid_commands_are_reported_to_the_sender_only() {
    let shared = Shared::new().await;
    let a = shared.node().await;
    let mut scout = a.connect(SCOUT, Role::Scout).await;
    let mut bookmaker = a.connect(BOOKMAKER, Role::Bookmaker).await;

    let too_long = text("tmp-long", &"a".repeat(5001));
    assert_eq!(
        a.send(&scout, too_long).await,
        DispatchOutcome::Rejected(ErrorReason::Client)
    );
    let error = scout.expect(|e| matches!(e, ServerEvent::Error { .. })).await;
    assert!(matches!(
        error,
        ServerEvent::Error { reason: ErrorReason::Client, temporary_id: Some(ref id), .. } if id == "tmp-long"
    ));
    assert_eq!(shared.storage.message_count().await, 0);
    assert_eq!(shared.counters.get_by_chat(BOOKMAKER, CHAT).await.unwrap(), 0);

    let elsewhere = ClientCommand::SendMessage(SendMessage {
        temporary_id: "tmp-x".to_string(),
        chat_id: 99,
        content: MessageContent::Text { text: "hi".to_string() },
        reply_to: None,
    });
    assert_eq!(
        a.send(&scout, elsewhere).await,
        DispatchOutcome::Rejected(ErrorReason::Client)
    );
    assert!(bookmaker
        .drain()
        .await
        .iter()
        .all(|e| !matches!(e, ServerEvent::Error { .. } | ServerEvent::NewMessage { .. })));
}

#[tokio::test]
async fn only_the_sender_edits_or_deletes() {
    let shared = Shared::new().await;
    let a = shared.node().await;
    let mut scout = a.connect(SCOUT, Role::Scout).await;
    let mut bookmaker = a.connect(BOOKMAKER, Role::Bookmaker).await;

    a.send(&scout, text("tmp-1", "typo")).await;
    let message_id = sent_id(&mut scout).await;

    let edit = |body: &str| {
        ClientCommand::Edit(EditMessage {
            message_id,
            content: MessageContent::Text { text: body.to_string() },
        })
    };
    assert_eq!(
        a.send(&bookmaker, edit("hijack")).await,
        DispatchOutcome::Rejected(ErrorReason::Client)
    );
    assert!(matches!(a.send(&scout, edit("fixed")).await, DispatchOutcome::Emitted(_)));
    bookmaker
        .expect(|e| matches!(e, ServerEvent::MessageEdited { message_id: id, .. } if *id == message_id))
        .await;

    let delete = ClientCommand::Delete(DeleteMessage { message_id });
    assert!(matches!(a.send(&scout, delete.clone()).await, DispatchOutcome::Emitted(_)));
    assert_eq!(a.send(&scout, delete).await, DispatchOutcome::Silent);
    bookmaker
        .expect(|e| matches!(e, ServerEvent::MessageDeleted { .. }))
        .await;

    let react = ClientCommand::React(React {
        message_id,
        emoji: "👍".to_string(),
        remove: false,
    });
    assert_eq!(
        a.send(&bookmaker, react).await,
        DispatchOutcome::Rejected(ErrorReason::Client)
    );
}

#[tokio::test]
async fn reactions_carry_the_current_count() {
    let shared = Shared::new().await;
    let a = shared.node().await;
    let mut scout = a.connect(SCOUT, Role::Scout).await;
    let bookmaker = a.connect(BOOKMAKER, Role::Bookmaker).await;

    a.send(&scout, text("tmp-1", "goal!")).await;
    let message_id = sent_id(&mut scout).await;

    let react = |remove| {
        ClientCommand::React(React {
            message_id,
            emoji: "🔥".to_string(),
            remove,
        })
    };
    a.send(&bookmaker, react(false)).await;
    let update = scout
        .expect(|e| matches!(e, ServerEvent::ReactionUpdated { .. }))
        .await;
    assert!(matches!(update, ServerEvent::ReactionUpdated { count: 1, removed: false, .. }));

    a.send(&bookmaker, react(true)).await;
    let update = scout
        .expect(|e| matches!(e, ServerEvent::ReactionUpdated { .. }))
        .await;
    assert!(matches!(update, ServerEvent::ReactionUpdated { count: 0, removed: true, .. }));
}

#[tokio::test]
async fn disconnect_releases_bus_subscriptions() {
    let shared = Shared::new().await;
    let a = shared.node().await;
    let scout = a.connect(SCOUT, Role::Scout).await;
    assert!(a.bus.subscriptions().await.contains(&Channel::User(SCOUT)));

    a.registry.unregister(scout.ctx.connection_id).await.unwrap();
    let channels = a.bus.subscriptions().await;
    assert!(!channels.contains(&Channel::User(SCOUT)));
    assert!(!channels.contains(&Channel::Connection(scout.ctx.connection_id)));

    // Counter updates for a user with no connections go nowhere.
    let envelope = messenger_bus::BusEnvelope::new(
        Channel::User(SCOUT),
        ServerEvent::MessageDeleted { chat_id: CHAT, message_id: 1 },
    );
    assert_eq!(shared.counters_bus.publish(&envelope).await.unwrap(), 0);
}
