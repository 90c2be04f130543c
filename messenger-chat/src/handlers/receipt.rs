use async_trait::async_trait;
use messenger_core::protocol::{Receipt, ServerEvent};
use messenger_core::types::{ChatPermissions, DeliveryStatus, Message};
use messenger_core::MessengerResult;
use messenger_presence::{receipt_key, ReceiptKind};
use tracing;

use super::{ChatServices, CommandContext, CommandHandler};
use crate::emission::Emission;

/// Handles both `Read` and `Received`; `kind` selects which.
pub struct ReceiptHandler {
    services: ChatServices,
    kind: ReceiptKind,
}

impl ReceiptHandler {
    pub fn new(services: ChatServices, kind: ReceiptKind) -> Self {
        ReceiptHandler { services, kind }
    }

    fn status(&self) -> DeliveryStatus {
        match self.kind {
            ReceiptKind::Read => DeliveryStatus::Read,
            ReceiptKind::Received => DeliveryStatus::Delivered,
        }
    }

    /// Zeroes the reader's counter for the chat once per receipt. The replay
    /// key is only recorded after storage accepted the receipt, and is given
    /// back if the reset itself fails.
    async fn reset_counters(&self, ctx: &CommandContext, message: &Message) -> MessengerResult<()> {
        let services = &self.services;
        let Some(chat) = services.storage.get_chat(message.chat_id).await? else {
            return Ok(());
        };

        let key = receipt_key(ctx.user_id, message.id, self.kind);
        let first = match services.replay.first_seen(&key).await {
            Ok(first) => first,
            Err(e) => {
                tracing::warn!("Replay guard unavailable for {}: {}", key, e);
                true
            }
        };
        if !first {
            tracing::debug!("Receipt {} already applied", key);
            return Ok(());
        }

        if let Err(e) = services.counters.reset(ctx.user_id, chat.id, chat.chat_type).await {
            tracing::warn!(user_id = ctx.user_id, "Unread counters not reset for chat {}: {}", chat.id, e);
            if let Err(e) = services.replay.forget(&key).await {
                tracing::warn!("Could not release replay key {}: {}", key, e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler<Receipt> for ReceiptHandler {
    async fn handle(&self, ctx: &CommandContext, command: Receipt) -> MessengerResult<Option<Emission>> {
        let services = &self.services;
        let message = services.load_message(command.message_id).await?;
        let membership = services.require_member(message.chat_id, ctx.user_id).await?;
        if message.sender_id == Some(ctx.user_id) {
            return Ok(None);
        }

        match self.kind {
            ReceiptKind::Read => services.storage.mark_read(message.chat_id, ctx.user_id, message.id).await?,
            ReceiptKind::Received => {
                services
                    .storage
                    .mark_received(message.chat_id, ctx.user_id, message.id)
                    .await?
            }
        };

        // Without read-for-all only the reader's own pointer moves.
        let status = self.status();
        let advanced = if membership.permissions.contains(ChatPermissions::READ_FOR_ALL) {
            services
                .storage
                .advance_delivery_through(message.chat_id, ctx.user_id, message.id, status)
                .await?
        } else {
            Vec::new()
        };

        if self.kind == ReceiptKind::Read {
            self.reset_counters(ctx, &message).await?;
        }

        if advanced.is_empty() {
            return Ok(None);
        }
        tracing::debug!(
            user_id = ctx.user_id,
            "{} messages in chat {} moved to {:?}",
            advanced.len(),
            message.chat_id,
            status
        );

        let members = services.storage.chat_members(message.chat_id).await?;
        let event = ServerEvent::DeliveryStatusChanged {
            chat_id: message.chat_id,
            message_id: message.id,
            user_id: ctx.user_id,
            status,
        };
        Ok(Some(Emission::to_members(event, &members)))
    }
}
