//! One handler per client command. Handlers validate, touch storage and the
//! caches, and describe what should be sent; fan-out does the sending.

pub mod activity;
pub mod message;
pub mod reaction;
pub mod receipt;
pub mod typing;
pub mod update;

use async_trait::async_trait;
use messenger_core::config::ChatConfig;
use messenger_core::types::{ChatId, ChatMembership, ConnectionId, Message, MessageId, Role, UserId};
use messenger_core::{MessengerError, MessengerResult, Storage};
use messenger_presence::{PresenceStore, ReplayGuard, UnreadCounterStore};
use std::sync::Arc;

use crate::emission::Emission;

pub use activity::ActivityHandler;
pub use message::SendMessageHandler;
pub use reaction::ReactionHandler;
pub use receipt::ReceiptHandler;
pub use typing::TypingHandler;
pub use update::{DeleteHandler, EditHandler};

/// Identity of the connection a command arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandContext {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub role: Role,
}

#[async_trait]
pub trait CommandHandler<C: Send + 'static>: Send + Sync {
    /// `Ok(None)` means the command was applied but nobody needs telling.
    async fn handle(&self, ctx: &CommandContext, command: C) -> MessengerResult<Option<Emission>>;
}

/// Collaborators shared by every handler.
#[derive(Clone)]
pub struct ChatServices {
    pub storage: Arc<dyn Storage>,
    pub presence: Arc<dyn PresenceStore>,
    pub counters: Arc<dyn UnreadCounterStore>,
    pub replay: Arc<dyn ReplayGuard>,
    pub settings: ChatConfig,
}

impl ChatServices {
    pub async fn require_member(&self, chat_id: ChatId, user_id: UserId) -> MessengerResult<ChatMembership> {
        self.storage
            .get_membership(chat_id, user_id)
            .await?
            .ok_or_else(|| MessengerError::NotPermitted(format!("user {} is not a member of chat {}", user_id, chat_id)))
    }

    pub async fn load_message(&self, message_id: MessageId) -> MessengerResult<Message> {
        self.storage
            .get_message(message_id)
            .await?
            .ok_or_else(|| MessengerError::NotFound(format!("message {}", message_id)))
    }

    /// Loads a message the user is allowed to see.
    pub async fn visible_message(&self, message_id: MessageId, user_id: UserId) -> MessengerResult<Message> {
        let message = self.load_message(message_id).await?;
        self.require_member(message.chat_id, user_id).await?;
        Ok(message)
    }
}
