use async_trait::async_trait;
use messenger_core::protocol::{React, ServerEvent};
use messenger_core::{MessengerError, MessengerResult};

use super::{ChatServices, CommandContext, CommandHandler};
use crate::emission::Emission;

const MAX_EMOJI_CHARS: usize = 16;

pub struct ReactionHandler {
    services: ChatServices,
}

impl ReactionHandler {
    pub fn new(services: ChatServices) -> Self {
        ReactionHandler { services }
    }
}

fn validate_emoji(emoji: &str) -> MessengerResult<()> {
    let length = emoji.chars().count();
    if emoji.trim().is_empty() || length > MAX_EMOJI_CHARS {
        return Err(MessengerError::Validation(format!(
            "reaction must be 1 to {} characters",
            MAX_EMOJI_CHARS
        )));
    }
    Ok(())
}

#[async_trait]
impl CommandHandler<React> for ReactionHandler {
    async fn handle(&self, ctx: &CommandContext, command: React) -> MessengerResult<Option<Emission>> {
        validate_emoji(&command.emoji)?;
        let services = &self.services;
        let message = services.visible_message(command.message_id, ctx.user_id).await?;
        if message.is_deleted() {
            return Err(MessengerError::Validation(format!(
                "message {} was deleted",
                message.id
            )));
        }

        let count = if command.remove {
            services
                .storage
                .remove_reaction(message.id, ctx.user_id, &command.emoji)
                .await?
        } else {
            services
                .storage
                .add_reaction(message.id, ctx.user_id, &command.emoji)
                .await?
        };

        let members = services.storage.chat_members(message.chat_id).await?;
        let event = ServerEvent::ReactionUpdated {
            chat_id: message.chat_id,
            message_id: message.id,
            user_id: ctx.user_id,
            emoji: command.emoji,
            count,
            removed: command.remove,
        };
        Ok(Some(Emission::to_members(event, &members)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emoji_length_is_bounded() {
        assert!(validate_emoji("👍").is_ok());
        assert!(validate_emoji("").is_err());
        assert!(validate_emoji(" ").is_err());
        assert!(validate_emoji(&"x".repeat(MAX_EMOJI_CHARS + 1)).is_err());
    }
}
