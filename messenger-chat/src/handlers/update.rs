//! Edits and deletions. Only the sender may change a message.

use async_trait::async_trait;
use chrono::Utc;
use messenger_core::protocol::{DeleteMessage, EditMessage, ServerEvent};
use messenger_core::types::{Message, UserId};
use messenger_core::{MessengerError, MessengerResult};

use super::{ChatServices, CommandContext, CommandHandler};
use crate::emission::Emission;

fn require_sender(message: &Message, user_id: UserId) -> MessengerResult<()> {
    if message.sender_id != Some(user_id) {
        return Err(MessengerError::NotPermitted(format!(
            "user {} did not send message {}",
            user_id, message.id
        )));
    }
    Ok(())
}

pub struct EditHandler {
    services: ChatServices,
}

impl EditHandler {
    pub fn new(services: ChatServices) -> Self {
        EditHandler { services }
    }
}

#[async_trait]
impl CommandHandler<EditMessage> for EditHandler {
    async fn handle(&self, ctx: &CommandContext, command: EditMessage) -> MessengerResult<Option<Emission>> {
        let services = &self.services;
        command.content.validate(services.settings.max_message_length)?;

        let message = services.visible_message(command.message_id, ctx.user_id).await?;
        require_sender(&message, ctx.user_id)?;
        if message.is_deleted() {
            return Err(MessengerError::Validation(format!(
                "message {} was deleted",
                message.id
            )));
        }

        let edited_at = Utc::now();
        if !services
            .storage
            .edit_message(message.id, &command.content, edited_at)
            .await?
        {
            return Err(MessengerError::NotFound(format!("message {}", message.id)));
        }

        let members = services.storage.chat_members(message.chat_id).await?;
        let event = ServerEvent::MessageEdited {
            chat_id: message.chat_id,
            message_id: message.id,
            content: command.content,
            edited_at,
        };
        Ok(Some(Emission::to_members(event, &members)))
    }
}

pub struct DeleteHandler {
    services: ChatServices,
}

impl DeleteHandler {
    pub fn new(services: ChatServices) -> Self {
        DeleteHandler { services }
    }
}

#[async_trait]
impl CommandHandler<DeleteMessage> for DeleteHandler {
    async fn handle(&self, ctx: &CommandContext, command: DeleteMessage) -> MessengerResult<Option<Emission>> {
        let services = &self.services;
        let message = services.visible_message(command.message_id, ctx.user_id).await?;
        require_sender(&message, ctx.user_id)?;

        // Deleting twice is harmless and announces nothing.
        if !services.storage.delete_message(message.id, Utc::now()).await? {
            return Ok(None);
        }

        let members = services.storage.chat_members(message.chat_id).await?;
        let event = ServerEvent::MessageDeleted {
            chat_id: message.chat_id,
            message_id: message.id,
        };
        Ok(Some(Emission::to_members(event, &members)))
    }
}
