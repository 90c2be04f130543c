//! Durable storage collaborator. The messenger core only talks to chats,
//! messages and devices through [`Storage`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::MessengerResult;
use crate::types::{
    Chat, ChatId, ChatMembership, DeliveryStatus, DeviceId, Message, MessageContent, MessageId,
    NewMessage, NewPushSubscription, PushSubscription, TicketStatus, UserId,
};

#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod pg;

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryStorage;
pub use pg::PgStorage;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_chat(&self, chat_id: ChatId) -> MessengerResult<Option<Chat>>;

    async fn get_membership(&self, chat_id: ChatId, user_id: UserId) -> MessengerResult<Option<ChatMembership>>;

    async fn chat_members(&self, chat_id: ChatId) -> MessengerResult<Vec<ChatMembership>>;

    /// Persists a new message in the `Pending` state.
    async fn create_message(&self, message: NewMessage) -> MessengerResult<Message>;

    async fn get_message(&self, message_id: MessageId) -> MessengerResult<Option<Message>>;

    /// Replaces the content of a live message. Returns false if the message
    /// is missing or deleted.
    async fn edit_message(
        &self,
        message_id: MessageId,
        content: &MessageContent,
        edited_at: DateTime<Utc>,
    ) -> MessengerResult<bool>;

    /// Soft delete. Returns false if the message was already deleted.
    async fn delete_message(&self, message_id: MessageId, deleted_at: DateTime<Utc>) -> MessengerResult<bool>;

    /// Moves the status forward. Returns false if `status` is not ahead of
    /// the stored one.
    async fn advance_delivery_status(&self, message_id: MessageId, status: DeliveryStatus) -> MessengerResult<bool>;

    /// Moves every message of `chat_id` up to and including `up_to` that
    /// `reader` did not send forward to `status`. Returns the ids that moved.
    async fn advance_delivery_through(
        &self,
        chat_id: ChatId,
        reader: UserId,
        up_to: MessageId,
        status: DeliveryStatus,
    ) -> MessengerResult<Vec<MessageId>>;

    /// Moves the member's read pointer forward to `message_id`.
    async fn mark_read(&self, chat_id: ChatId, user_id: UserId, message_id: MessageId) -> MessengerResult<bool>;

    /// Moves the member's received pointer forward to `message_id`.
    async fn mark_received(&self, chat_id: ChatId, user_id: UserId, message_id: MessageId) -> MessengerResult<bool>;

    /// Upserts the reaction and returns how many users reacted with `emoji`.
    async fn add_reaction(&self, message_id: MessageId, user_id: UserId, emoji: &str) -> MessengerResult<i64>;

    async fn remove_reaction(&self, message_id: MessageId, user_id: UserId, emoji: &str) -> MessengerResult<i64>;

    /// Creates a subscription, or refreshes the existing one for the same
    /// endpoint keeping its device id.
    async fn upsert_push_subscription(&self, subscription: NewPushSubscription) -> MessengerResult<PushSubscription>;

    async fn get_push_subscription(&self, device_id: DeviceId) -> MessengerResult<Option<PushSubscription>>;

    async fn find_push_subscription_by_endpoint(
        &self,
        user_id: UserId,
        endpoint: &str,
    ) -> MessengerResult<Option<PushSubscription>>;

    async fn remove_push_subscription(&self, device_id: DeviceId) -> MessengerResult<bool>;

    async fn touch_push_subscription(&self, device_id: DeviceId, alive_at: DateTime<Utc>) -> MessengerResult<bool>;

    /// Subscriptions of `user_id` whose last heartbeat is at or after `alive_since`.
    async fn live_push_subscriptions(
        &self,
        user_id: UserId,
        alive_since: DateTime<Utc>,
    ) -> MessengerResult<Vec<PushSubscription>>;

    /// Deletes subscriptions whose last heartbeat is before `stale_before`.
    async fn reap_push_subscriptions(&self, stale_before: DateTime<Utc>) -> MessengerResult<u64>;

    /// Open tickets by status in the chats `user_id` belongs to.
    async fn ticket_counters(&self, user_id: UserId) -> MessengerResult<HashMap<TicketStatus, i64>>;
}
