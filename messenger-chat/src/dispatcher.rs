//! Routes each decoded command to its handler and turns failures into error
//! events for the originating connection.

use messenger_core::protocol::{ClientCommand, ErrorReason, ServerEvent};
use messenger_core::MessengerError;
use messenger_presence::ReceiptKind;
use std::sync::Arc;
use tracing;

use crate::fanout::{Fanout, FanoutReport};
use crate::handlers::{
    ActivityHandler, ChatServices, CommandContext, CommandHandler, DeleteHandler, EditHandler, ReactionHandler,
    ReceiptHandler, SendMessageHandler, TypingHandler,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Emitted(FanoutReport),
    /// Applied with nothing to announce.
    Silent,
    Rejected(ErrorReason),
}

pub struct Dispatcher {
    send_message: SendMessageHandler,
    react: ReactionHandler,
    read: ReceiptHandler,
    received: ReceiptHandler,
    activity: ActivityHandler,
    edit: EditHandler,
    delete: DeleteHandler,
    typing: TypingHandler,
    fanout: Arc<Fanout>,
}

impl Dispatcher {
    pub fn new(services: ChatServices, fanout: Arc<Fanout>) -> Self {
        Dispatcher {
            send_message: SendMessageHandler::new(services.clone()),
            react: ReactionHandler::new(services.clone()),
            read: ReceiptHandler::new(services.clone(), ReceiptKind::Read),
            received: ReceiptHandler::new(services.clone(), ReceiptKind::Received),
            activity: ActivityHandler::new(services.clone()),
            edit: EditHandler::new(services.clone()),
            delete: DeleteHandler::new(services.clone()),
            typing: TypingHandler::new(services),
            fanout,
        }
    }

    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    pub async fn dispatch(&self, ctx: &CommandContext, command: ClientCommand) -> DispatchOutcome {
        let kind = command.kind();
        let temporary_id = command.temporary_id().map(str::to_owned);

        let result = match command {
            ClientCommand::SendMessage(c) => self.send_message.handle(ctx, c).await,
            ClientCommand::React(c) => self.react.handle(ctx, c).await,
            ClientCommand::Read(c) => self.read.handle(ctx, c).await,
            ClientCommand::Received(c) => self.received.handle(ctx, c).await,
            ClientCommand::Activity(c) => self.activity.handle(ctx, c).await,
            ClientCommand::Edit(c) => self.edit.handle(ctx, c).await,
            ClientCommand::Delete(c) => self.delete.handle(ctx, c).await,
            ClientCommand::Typing(c) => self.typing.handle(ctx, c).await,
        };

        match result {
            Ok(Some(emission)) => DispatchOutcome::Emitted(self.fanout.emit(ctx.connection_id, emission).await),
            Ok(None) => DispatchOutcome::Silent,
            Err(e) => {
                let reason = reason_for(&e);
                match reason {
                    ErrorReason::Client => {
                        tracing::debug!("Rejected {} from user {}: {}", kind, ctx.user_id, e)
                    }
                    ErrorReason::Server => {
                        tracing::error!("Failed to handle {} from user {}: {}", kind, ctx.user_id, e)
                    }
                }
                let event = ServerEvent::Error {
                    reason,
                    description: e.to_string(),
                    temporary_id,
                };
                self.fanout.reply(ctx.connection_id, event).await;
                DispatchOutcome::Rejected(reason)
            }
        }
    }

    /// Reports an undecodable frame back to the connection it came from.
    pub async fn reject_frame(&self, ctx: &CommandContext, description: String) {
        tracing::debug!("Malformed frame from connection {}: {}", ctx.connection_id, description);
        let event = ServerEvent::Error {
            reason: ErrorReason::Client,
            description,
            temporary_id: None,
        };
        self.fanout.reply(ctx.connection_id, event).await;
    }
}

fn reason_for(error: &MessengerError) -> ErrorReason {
    if error.is_client_error() {
        ErrorReason::Client
    } else {
        ErrorReason::Server
    }
}
