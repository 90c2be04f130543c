use async_trait::async_trait;
use messenger_core::protocol::{Activity, ServerEvent};
use messenger_core::MessengerResult;

use super::{ChatServices, CommandContext, CommandHandler};
use crate::emission::Emission;

/// Heartbeat from the client. Keeps presence alive and records which chat,
/// if any, is on screen.
pub struct ActivityHandler {
    services: ChatServices,
}

impl ActivityHandler {
    pub fn new(services: ChatServices) -> Self {
        ActivityHandler { services }
    }
}

#[async_trait]
impl CommandHandler<Activity> for ActivityHandler {
    async fn handle(&self, ctx: &CommandContext, command: Activity) -> MessengerResult<Option<Emission>> {
        let services = &self.services;
        let came_online = services.presence.set_active(ctx.user_id, ctx.role).await?;

        if let Some(chat_id) = command.chat_id {
            services.require_member(chat_id, ctx.user_id).await?;
            services
                .presence
                .set_active_in_chat(ctx.user_id, ctx.role, chat_id)
                .await?;
        }

        if came_online {
            let event = ServerEvent::PresenceChanged {
                user_id: ctx.user_id,
                role: ctx.role,
                online: true,
            };
            return Ok(Some(Emission::to_everyone(event)));
        }
        Ok(None)
    }
}
