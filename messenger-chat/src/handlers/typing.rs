use async_trait::async_trait;
use messenger_core::protocol::{ServerEvent, Typing};
use messenger_core::MessengerResult;

use super::{ChatServices, CommandContext, CommandHandler};
use crate::emission::Emission;

pub struct TypingHandler {
    services: ChatServices,
}

impl TypingHandler {
    pub fn new(services: ChatServices) -> Self {
        TypingHandler { services }
    }
}

#[async_trait]
impl CommandHandler<Typing> for TypingHandler {
    async fn handle(&self, ctx: &CommandContext, command: Typing) -> MessengerResult<Option<Emission>> {
        let services = &self.services;
        services.require_member(command.chat_id, ctx.user_id).await?;

        let members = services.storage.chat_members(command.chat_id).await?;
        let event = ServerEvent::UserTyping {
            chat_id: command.chat_id,
            user_id: ctx.user_id,
            is_typing: command.is_typing,
        };
        Ok(Some(Emission::to_members(
            event,
            members.iter().filter(|m| m.user_id != ctx.user_id),
        )))
    }
}
