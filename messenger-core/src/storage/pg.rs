use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::RunQueryDsl;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::Storage;
use crate::db::{DbConnection, DbPool};
use crate::error::{MessengerError, MessengerResult};
use crate::schema::{chat_memberships, chats, message_reactions, messages, push_subscriptions, tickets};
use crate::types::{
    Chat, ChatId, ChatMembership, ChatPermissions, DeliveryStatus, DeviceId, Message, MessageContent,
    MessageId, NewMessage, NewPushSubscription, PushSubscription, TicketStatus, UserId,
};

#[derive(Queryable, Selectable)]
#[diesel(table_name = chats)]
struct ChatRow {
    id: i64,
    chat_type: String,
    match_id: Option<i64>,
}

impl TryFrom<ChatRow> for Chat {
    type Error = MessengerError;

    fn try_from(row: ChatRow) -> Result<Self, Self::Error> {
        Ok(Chat {
            id: row.id,
            chat_type: row.chat_type.parse()?,
            match_id: row.match_id,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chat_memberships)]
struct MembershipRow {
    chat_id: i64,
    user_id: i64,
    user_role: String,
    permissions: i32,
    is_primary: bool,
    last_read_message_id: Option<i64>,
}

impl TryFrom<MembershipRow> for ChatMembership {
    type Error = MessengerError;

    fn try_from(row: MembershipRow) -> Result<Self, Self::Error> {
        Ok(ChatMembership {
            chat_id: row.chat_id,
            user_id: row.user_id,
            role: row.user_role.parse()?,
            permissions: ChatPermissions(row.permissions),
            is_primary: row.is_primary,
            last_read_message_id: row.last_read_message_id,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = messages)]
struct MessageRow {
    id: i64,
    chat_id: i64,
    sender_id: Option<i64>,
    content: Vec<u8>,
    reply_to: Option<i64>,
    delivery_status: i16,
    created_at: DateTime<Utc>,
    edited_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRow> for Message {
    type Error = MessengerError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let delivery_status = DeliveryStatus::from_code(row.delivery_status).ok_or_else(|| {
            MessengerError::Storage(format!(
                "message {} has unknown delivery status {}",
                row.id, row.delivery_status
            ))
        })?;
        Ok(Message {
            id: row.id,
            chat_id: row.chat_id,
            sender_id: row.sender_id,
            content: MessageContent::from_bytes(&row.content)?,
            reply_to: row.reply_to,
            delivery_status,
            created_at: row.created_at,
            edited_at: row.edited_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = messages)]
struct NewMessageRow {
    chat_id: i64,
    sender_id: Option<i64>,
    content: Vec<u8>,
    reply_to: Option<i64>,
    delivery_status: i16,
    created_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = push_subscriptions)]
struct PushSubscriptionRow {
    device_id: Uuid,
    user_id: i64,
    endpoint: String,
    p256dh: String,
    auth: String,
    created_at: DateTime<Utc>,
    last_alive_at: DateTime<Utc>,
}

impl From<PushSubscriptionRow> for PushSubscription {
    fn from(row: PushSubscriptionRow) -> Self {
        PushSubscription {
            device_id: row.device_id,
            user_id: row.user_id,
            endpoint: row.endpoint,
            p256dh: row.p256dh,
            auth: row.auth,
            created_at: row.created_at,
            last_alive_at: row.last_alive_at,
        }
    }
}

/// Postgres-backed [`Storage`] over the shared deadpool.
pub struct PgStorage {
    pool: Arc<DbPool>,
}

impl PgStorage {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> MessengerResult<DbConnection> {
        self.pool
            .get()
            .await
            .map_err(|e| MessengerError::Storage(format!("failed to get DB connection: {}", e)))
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn get_chat(&self, chat_id: ChatId) -> MessengerResult<Option<Chat>> {
        let mut conn = self.conn().await?;
        let row = chats::table
            .find(chat_id)
            .select(ChatRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(Chat::try_from).transpose()
    }

    async fn get_membership(&self, chat_id: ChatId, user_id: UserId) -> MessengerResult<Option<ChatMembership>> {
        let mut conn = self.conn().await?;
        let row = chat_memberships::table
            .find((chat_id, user_id))
            .select(MembershipRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(ChatMembership::try_from).transpose()
    }

    async fn chat_members(&self, chat_id: ChatId) -> MessengerResult<Vec<ChatMembership>> {
        let mut conn = self.conn().await?;
        let rows: Vec<MembershipRow> = chat_memberships::table
            .filter(chat_memberships::chat_id.eq(chat_id))
            .select(MembershipRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(ChatMembership::try_from).collect()
    }

    async fn create_message(&self, message: NewMessage) -> MessengerResult<Message> {
        let mut conn = self.conn().await?;
        let row = NewMessageRow {
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            content: message.content.to_bytes()?,
            reply_to: message.reply_to,
            delivery_status: DeliveryStatus::Pending.code(),
            created_at: Utc::now(),
        };
        let stored: MessageRow = diesel::insert_into(messages::table)
            .values(&row)
            .returning(MessageRow::as_returning())
            .get_result(&mut conn)
            .await?;
        Message::try_from(stored)
    }

    async fn get_message(&self, message_id: MessageId) -> MessengerResult<Option<Message>> {
        let mut conn = self.conn().await?;
        let row = messages::table
            .find(message_id)
            .select(MessageRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(Message::try_from).transpose()
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        content: &MessageContent,
        edited_at: DateTime<Utc>,
    ) -> MessengerResult<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            messages::table
                .filter(messages::id.eq(message_id))
                .filter(messages::deleted_at.is_null()),
        )
        .set((
            messages::content.eq(content.to_bytes()?),
            messages::edited_at.eq(Some(edited_at)),
        ))
        .execute(&mut conn)
        .await?;
        Ok(updated > 0)
    }

    async fn delete_message(&self, message_id: MessageId, deleted_at: DateTime<Utc>) -> MessengerResult<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            messages::table
                .filter(messages::id.eq(message_id))
                .filter(messages::deleted_at.is_null()),
        )
        .set(messages::deleted_at.eq(Some(deleted_at)))
        .execute(&mut conn)
        .await?;
        Ok(updated > 0)
    }

    async fn advance_delivery_status(&self, message_id: MessageId, status: DeliveryStatus) -> MessengerResult<bool> {
        let mut conn = self.conn().await?;
        // Guarded update: a concurrent writer can never move the status back.
        let updated = diesel::update(
            messages::table
                .filter(messages::id.eq(message_id))
                .filter(messages::delivery_status.lt(status.code())),
        )
        .set(messages::delivery_status.eq(status.code()))
        .execute(&mut conn)
        .await?;
        Ok(updated > 0)
    }

    async fn advance_delivery_through(
        &self,
        chat_id: ChatId,
        reader: UserId,
        up_to: MessageId,
        status: DeliveryStatus,
    ) -> MessengerResult<Vec<MessageId>> {
        let mut conn = self.conn().await?;
        let moved = diesel::update(
            messages::table
                .filter(messages::chat_id.eq(chat_id))
                .filter(messages::id.le(up_to))
                .filter(messages::sender_id.is_null().or(messages::sender_id.ne(reader)))
                .filter(messages::delivery_status.lt(status.code())),
        )
        .set(messages::delivery_status.eq(status.code()))
        .returning(messages::id)
        .get_results::<MessageId>(&mut conn)
        .await?;
        Ok(moved)
    }

    async fn mark_read(&self, chat_id: ChatId, user_id: UserId, message_id: MessageId) -> MessengerResult<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            chat_memberships::table
                .filter(chat_memberships::chat_id.eq(chat_id))
                .filter(chat_memberships::user_id.eq(user_id))
                .filter(
                    chat_memberships::last_read_message_id
                        .is_null()
                        .or(chat_memberships::last_read_message_id.lt(message_id)),
                ),
        )
        .set(chat_memberships::last_read_message_id.eq(Some(message_id)))
        .execute(&mut conn)
        .await?;
        Ok(updated > 0)
    }

    async fn mark_received(&self, chat_id: ChatId, user_id: UserId, message_id: MessageId) -> MessengerResult<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            chat_memberships::table
                .filter(chat_memberships::chat_id.eq(chat_id))
                .filter(chat_memberships::user_id.eq(user_id))
                .filter(
                    chat_memberships::last_received_message_id
                        .is_null()
                        .or(chat_memberships::last_received_message_id.lt(message_id)),
                ),
        )
        .set(chat_memberships::last_received_message_id.eq(Some(message_id)))
        .execute(&mut conn)
        .await?;
        Ok(updated > 0)
    }

    async fn add_reaction(&self, message_id: MessageId, user_id: UserId, emoji: &str) -> MessengerResult<i64> {
        let mut conn = self.conn().await?;
        diesel::insert_into(message_reactions::table)
            .values((
                message_reactions::message_id.eq(message_id),
                message_reactions::user_id.eq(user_id),
                message_reactions::emoji.eq(emoji),
                message_reactions::created_at.eq(Utc::now()),
            ))
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;
        count_reactions(&mut conn, message_id, emoji).await
    }

    async fn remove_reaction(&self, message_id: MessageId, user_id: UserId, emoji: &str) -> MessengerResult<i64> {
        let mut conn = self.conn().await?;
        diesel::delete(
            message_reactions::table
                .filter(message_reactions::message_id.eq(message_id))
                .filter(message_reactions::user_id.eq(user_id))
                .filter(message_reactions::emoji.eq(emoji)),
        )
        .execute(&mut conn)
        .await?;
        count_reactions(&mut conn, message_id, emoji).await
    }

    async fn upsert_push_subscription(&self, subscription: NewPushSubscription) -> MessengerResult<PushSubscription> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let row = PushSubscriptionRow {
            device_id: Uuid::new_v4(),
            user_id: subscription.user_id,
            endpoint: subscription.endpoint,
            p256dh: subscription.p256dh,
            auth: subscription.auth,
            created_at: now,
            last_alive_at: now,
        };
        let stored: PushSubscriptionRow = diesel::insert_into(push_subscriptions::table)
            .values(&row)
            .on_conflict(push_subscriptions::endpoint)
            .do_update()
            .set((
                push_subscriptions::user_id.eq(excluded(push_subscriptions::user_id)),
                push_subscriptions::p256dh.eq(excluded(push_subscriptions::p256dh)),
                push_subscriptions::auth.eq(excluded(push_subscriptions::auth)),
                push_subscriptions::last_alive_at.eq(excluded(push_subscriptions::last_alive_at)),
            ))
            .returning(PushSubscriptionRow::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(stored.into())
    }

    async fn get_push_subscription(&self, device_id: DeviceId) -> MessengerResult<Option<PushSubscription>> {
        let mut conn = self.conn().await?;
        let row = push_subscriptions::table
            .find(device_id)
            .select(PushSubscriptionRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn find_push_subscription_by_endpoint(
        &self,
        user_id: UserId,
        endpoint: &str,
    ) -> MessengerResult<Option<PushSubscription>> {
        let mut conn = self.conn().await?;
        let row = push_subscriptions::table
            .filter(push_subscriptions::user_id.eq(user_id))
            .filter(push_subscriptions::endpoint.eq(endpoint))
            .select(PushSubscriptionRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn remove_push_subscription(&self, device_id: DeviceId) -> MessengerResult<bool> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(push_subscriptions::table.find(device_id))
            .execute(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn touch_push_subscription(&self, device_id: DeviceId, alive_at: DateTime<Utc>) -> MessengerResult<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(push_subscriptions::table.find(device_id))
            .set(push_subscriptions::last_alive_at.eq(alive_at))
            .execute(&mut conn)
            .await?;
        Ok(updated > 0)
    }

    async fn live_push_subscriptions(
        &self,
        user_id: UserId,
        alive_since: DateTime<Utc>,
    ) -> MessengerResult<Vec<PushSubscription>> {
        let mut conn = self.conn().await?;
        let rows: Vec<PushSubscriptionRow> = push_subscriptions::table
            .filter(push_subscriptions::user_id.eq(user_id))
            .filter(push_subscriptions::last_alive_at.ge(alive_since))
            .select(PushSubscriptionRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn reap_push_subscriptions(&self, stale_before: DateTime<Utc>) -> MessengerResult<u64> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(
            push_subscriptions::table.filter(push_subscriptions::last_alive_at.lt(stale_before)),
        )
        .execute(&mut conn)
        .await?;
        Ok(deleted as u64)
    }

    async fn ticket_counters(&self, user_id: UserId) -> MessengerResult<HashMap<TicketStatus, i64>> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, i64)> = tickets::table
            .inner_join(chat_memberships::table.on(chat_memberships::chat_id.eq(tickets::chat_id)))
            .filter(chat_memberships::user_id.eq(user_id))
            .filter(tickets::status.ne(TicketStatus::Closed.as_str()))
            .group_by(tickets::status)
            .select((tickets::status, diesel::dsl::count_star()))
            .load(&mut conn)
            .await?;

        let mut counters = HashMap::new();
        for (status, count) in rows {
            match status.parse::<TicketStatus>() {
                Ok(status) => {
                    counters.insert(status, count);
                }
                Err(e) => tracing::warn!("Skipping ticket counter row: {}", e),
            }
        }
        Ok(counters)
    }
}

async fn count_reactions(conn: &mut DbConnection, message_id: MessageId, emoji: &str) -> MessengerResult<i64> {
    let count = message_reactions::table
        .filter(message_reactions::message_id.eq(message_id))
        .filter(message_reactions::emoji.eq(emoji))
        .count()
        .get_result(conn)
        .await?;
    Ok(count)
}
