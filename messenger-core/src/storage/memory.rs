use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::Storage;
use crate::error::{MessengerError, MessengerResult};
use crate::types::{
    Chat, ChatId, ChatMembership, DeliveryStatus, DeviceId, Message, MessageContent, MessageId,
    NewMessage, NewPushSubscription, PushSubscription, TicketStatus, UserId,
};

#[derive(Default)]
struct State {
    chats: HashMap<ChatId, Chat>,
    memberships: BTreeMap<(ChatId, UserId), ChatMembership>,
    received: HashMap<(ChatId, UserId), MessageId>,
    messages: BTreeMap<MessageId, Message>,
    next_message_id: MessageId,
    reactions: HashSet<(MessageId, UserId, String)>,
    subscriptions: HashMap<DeviceId, PushSubscription>,
    tickets: Vec<(ChatId, TicketStatus)>,
    failing_read_marks: usize,
}

/// In-process storage used by tests and local tooling.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_chat(&self, chat: Chat) {
        self.state.lock().await.chats.insert(chat.id, chat);
    }

    pub async fn add_member(&self, membership: ChatMembership) {
        self.state
            .lock()
            .await
            .memberships
            .insert((membership.chat_id, membership.user_id), membership);
    }

    pub async fn add_ticket(&self, chat_id: ChatId, status: TicketStatus) {
        self.state.lock().await.tickets.push((chat_id, status));
    }

    /// Stores a subscription as-is, including its timestamps.
    pub async fn insert_subscription(&self, subscription: PushSubscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.device_id, subscription);
    }

    /// The next `count` calls to `mark_read` fail with a storage error.
    pub async fn fail_read_marks(&self, count: usize) {
        self.state.lock().await.failing_read_marks = count;
    }

    pub async fn message_count(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_chat(&self, chat_id: ChatId) -> MessengerResult<Option<Chat>> {
        Ok(self.state.lock().await.chats.get(&chat_id).cloned())
    }

    async fn get_membership(&self, chat_id: ChatId, user_id: UserId) -> MessengerResult<Option<ChatMembership>> {
        Ok(self.state.lock().await.memberships.get(&(chat_id, user_id)).cloned())
    }

    async fn chat_members(&self, chat_id: ChatId) -> MessengerResult<Vec<ChatMembership>> {
        let state = self.state.lock().await;
        Ok(state
            .memberships
            .values()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn create_message(&self, message: NewMessage) -> MessengerResult<Message> {
        let mut state = self.state.lock().await;
        state.next_message_id += 1;
        let stored = Message {
            id: state.next_message_id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            content: message.content,
            reply_to: message.reply_to,
            delivery_status: DeliveryStatus::Pending,
            created_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
        };
        state.messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_message(&self, message_id: MessageId) -> MessengerResult<Option<Message>> {
        Ok(self.state.lock().await.messages.get(&message_id).cloned())
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        content: &MessageContent,
        edited_at: DateTime<Utc>,
    ) -> MessengerResult<bool> {
        let mut state = self.state.lock().await;
        match state.messages.get_mut(&message_id) {
            Some(message) if !message.is_deleted() => {
                message.content = content.clone();
                message.edited_at = Some(edited_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_message(&self, message_id: MessageId, deleted_at: DateTime<Utc>) -> MessengerResult<bool> {
        let mut state = self.state.lock().await;
        match state.messages.get_mut(&message_id) {
            Some(message) if !message.is_deleted() => {
                message.deleted_at = Some(deleted_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance_delivery_status(&self, message_id: MessageId, status: DeliveryStatus) -> MessengerResult<bool> {
        let mut state = self.state.lock().await;
        match state.messages.get_mut(&message_id) {
            Some(message) if message.delivery_status.can_advance_to(status) => {
                message.delivery_status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance_delivery_through(
        &self,
        chat_id: ChatId,
        reader: UserId,
        up_to: MessageId,
        status: DeliveryStatus,
    ) -> MessengerResult<Vec<MessageId>> {
        let mut state = self.state.lock().await;
        let moved = state
            .messages
            .range_mut(..=up_to)
            .filter(|(_, m)| m.chat_id == chat_id && m.sender_id != Some(reader))
            .filter(|(_, m)| m.delivery_status.can_advance_to(status))
            .map(|(id, m)| {
                m.delivery_status = status;
                *id
            })
            .collect();
        Ok(moved)
    }

    async fn mark_read(&self, chat_id: ChatId, user_id: UserId, message_id: MessageId) -> MessengerResult<bool> {
        let mut state = self.state.lock().await;
        if state.failing_read_marks > 0 {
            state.failing_read_marks -= 1;
            return Err(MessengerError::Storage("read pointer update failed".to_string()));
        }
        match state.memberships.get_mut(&(chat_id, user_id)) {
            Some(membership) if membership.last_read_message_id.map_or(true, |id| id < message_id) => {
                membership.last_read_message_id = Some(message_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_received(&self, chat_id: ChatId, user_id: UserId, message_id: MessageId) -> MessengerResult<bool> {
        let mut state = self.state.lock().await;
        if !state.memberships.contains_key(&(chat_id, user_id)) {
            return Ok(false);
        }
        let current = state.received.entry((chat_id, user_id)).or_insert(0);
        if *current < message_id {
            *current = message_id;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn add_reaction(&self, message_id: MessageId, user_id: UserId, emoji: &str) -> MessengerResult<i64> {
        let mut state = self.state.lock().await;
        state.reactions.insert((message_id, user_id, emoji.to_string()));
        Ok(count_reactions(&state, message_id, emoji))
    }

    async fn remove_reaction(&self, message_id: MessageId, user_id: UserId, emoji: &str) -> MessengerResult<i64> {
        let mut state = self.state.lock().await;
        state.reactions.remove(&(message_id, user_id, emoji.to_string()));
        Ok(count_reactions(&state, message_id, emoji))
    }

    async fn upsert_push_subscription(&self, subscription: NewPushSubscription) -> MessengerResult<PushSubscription> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let existing = state
            .subscriptions
            .values_mut()
            .find(|s| s.endpoint == subscription.endpoint);

        if let Some(existing) = existing {
            existing.user_id = subscription.user_id;
            existing.p256dh = subscription.p256dh;
            existing.auth = subscription.auth;
            existing.last_alive_at = now;
            return Ok(existing.clone());
        }

        let created = PushSubscription {
            device_id: Uuid::new_v4(),
            user_id: subscription.user_id,
            endpoint: subscription.endpoint,
            p256dh: subscription.p256dh,
            auth: subscription.auth,
            created_at: now,
            last_alive_at: now,
        };
        state.subscriptions.insert(created.device_id, created.clone());
        Ok(created)
    }

    async fn get_push_subscription(&self, device_id: DeviceId) -> MessengerResult<Option<PushSubscription>> {
        Ok(self.state.lock().await.subscriptions.get(&device_id).cloned())
    }

    async fn find_push_subscription_by_endpoint(
        &self,
        user_id: UserId,
        endpoint: &str,
    ) -> MessengerResult<Option<PushSubscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.endpoint == endpoint)
            .cloned())
    }

    async fn remove_push_subscription(&self, device_id: DeviceId) -> MessengerResult<bool> {
        Ok(self.state.lock().await.subscriptions.remove(&device_id).is_some())
    }

    async fn touch_push_subscription(&self, device_id: DeviceId, alive_at: DateTime<Utc>) -> MessengerResult<bool> {
        let mut state = self.state.lock().await;
        match state.subscriptions.get_mut(&device_id) {
            Some(subscription) => {
                subscription.last_alive_at = alive_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn live_push_subscriptions(
        &self,
        user_id: UserId,
        alive_since: DateTime<Utc>,
    ) -> MessengerResult<Vec<PushSubscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id && s.last_alive_at >= alive_since)
            .cloned()
            .collect())
    }

    async fn reap_push_subscriptions(&self, stale_before: DateTime<Utc>) -> MessengerResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.subscriptions.len();
        state.subscriptions.retain(|_, s| s.last_alive_at >= stale_before);
        Ok((before - state.subscriptions.len()) as u64)
    }

    async fn ticket_counters(&self, user_id: UserId) -> MessengerResult<HashMap<TicketStatus, i64>> {
        let state = self.state.lock().await;
        let mut counters = HashMap::new();
        for (chat_id, status) in &state.tickets {
            if *status == TicketStatus::Closed {
                continue;
            }
            if state.memberships.contains_key(&(*chat_id, user_id)) {
                *counters.entry(*status).or_insert(0) += 1;
            }
        }
        Ok(counters)
    }
}

fn count_reactions(state: &State, message_id: MessageId, emoji: &str) -> i64 {
    state
        .reactions
        .iter()
        .filter(|(m, _, e)| *m == message_id && e == emoji)
        .count() as i64
}
