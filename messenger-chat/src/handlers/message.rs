use async_trait::async_trait;
use messenger_core::protocol::{SendMessage, ServerEvent};
use messenger_core::types::NewMessage;
use messenger_core::{MessengerError, MessengerResult};
use tracing;

use super::{ChatServices, CommandContext, CommandHandler};
use crate::emission::{Emission, PushRequest};

pub struct SendMessageHandler {
    services: ChatServices,
}

impl SendMessageHandler {
    pub fn new(services: ChatServices) -> Self {
        SendMessageHandler { services }
    }
}

#[async_trait]
impl CommandHandler<SendMessage> for SendMessageHandler {
    async fn handle(&self, ctx: &CommandContext, command: SendMessage) -> MessengerResult<Option<Emission>> {
        let services = &self.services;
        command.content.validate(services.settings.max_message_length)?;

        let membership = services.require_member(command.chat_id, ctx.user_id).await?;
        if !membership.can_write() {
            return Err(MessengerError::NotPermitted(format!(
                "user {} cannot write to chat {}",
                ctx.user_id, command.chat_id
            )));
        }
        let chat = services
            .storage
            .get_chat(command.chat_id)
            .await?
            .ok_or_else(|| MessengerError::NotFound(format!("chat {}", command.chat_id)))?;

        if let Some(reply_to) = command.reply_to {
            let original = services.load_message(reply_to).await?;
            if original.chat_id != chat.id {
                return Err(MessengerError::Validation(format!(
                    "message {} is not in chat {}",
                    reply_to, chat.id
                )));
            }
        }

        let message = services
            .storage
            .create_message(NewMessage {
                chat_id: chat.id,
                sender_id: Some(ctx.user_id),
                content: command.content,
                reply_to: command.reply_to,
            })
            .await?;

        if let Err(e) = services.presence.set_active(ctx.user_id, ctx.role).await {
            tracing::debug!(user_id = ctx.user_id, "Could not refresh sender presence: {}", e);
        }

        let members = services.storage.chat_members(chat.id).await?;
        for member in members.iter().filter(|m| m.user_id != ctx.user_id) {
            // Someone looking at the chat reads the message as it lands.
            let viewing = services
                .presence
                .is_active_in_chat(member.user_id, chat.id)
                .await
                .unwrap_or(false);
            if viewing {
                if let Err(e) = services.storage.mark_read(chat.id, member.user_id, message.id).await {
                    tracing::warn!(user_id = member.user_id, "Failed to move read pointer: {}", e);
                }
                continue;
            }
            if let Err(e) = services.counters.increment(member.user_id, chat.id, chat.chat_type).await {
                tracing::warn!(
                    user_id = member.user_id,
                    "Unread counter not incremented for message {}: {}",
                    message.id,
                    e
                );
            }
        }

        tracing::info!(
            "Message {} stored in {} chat {} by user {}",
            message.id,
            chat.chat_type,
            chat.id,
            ctx.user_id
        );

        let ack = ServerEvent::MessageSent {
            temporary_id: command.temporary_id,
            message_id: message.id,
            created_at: message.created_at,
        };
        let push = PushRequest {
            chat_id: chat.id,
            chat_type: chat.chat_type,
            message_id: message.id,
            sender_id: message.sender_id,
            preview: message.content.preview(),
            created_at: message.created_at,
        };
        let event = ServerEvent::NewMessage {
            chat_type: chat.chat_type,
            message,
        };

        Ok(Some(Emission::to_members(event, &members).with_ack(ack).with_push(push)))
    }
}
