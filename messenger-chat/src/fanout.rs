//! Routes handler output to connections: local ones directly, remote ones
//! through the event bus, unreachable recipients through push signals.

use messenger_bus::{BusEnvelope, Channel, EventBus};
use messenger_core::protocol::ServerEvent;
use messenger_core::types::{ConnectionId, DeliveryStatus, MessageId, PushSignal, UserId};
use messenger_core::Storage;
use messenger_presence::{PresenceStatus, PresenceStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing;

use crate::emission::{Audience, Emission, PushRequest, Recipient};
use crate::push_signals::PushSignalSink;
use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanoutReport {
    /// Local connections that accepted the event.
    pub local: usize,
    /// Bus subscribers of the recipient channels. Includes this process
    /// when it also holds connections of a recipient.
    pub remote: usize,
    pub push_signals: usize,
    /// Local connections plus bus subscribers for users other than the
    /// message's sender.
    pub recipients: usize,
}

impl FanoutReport {
    /// True once a recipient has the message or a push was raised for one.
    pub fn handed_over(&self) -> bool {
        self.recipients > 0 || self.push_signals > 0
    }
}

pub struct Fanout {
    registry: Arc<ConnectionRegistry>,
    bus: Arc<dyn EventBus>,
    presence: Arc<dyn PresenceStore>,
    storage: Arc<dyn Storage>,
    push: Arc<dyn PushSignalSink>,
}

impl Fanout {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bus: Arc<dyn EventBus>,
        presence: Arc<dyn PresenceStore>,
        storage: Arc<dyn Storage>,
        push: Arc<dyn PushSignalSink>,
    ) -> Self {
        Fanout {
            registry,
            bus,
            presence,
            storage,
            push,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Sends directly to one local connection.
    pub async fn reply(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        self.registry.deliver_to_connection(connection_id, event).await
    }

    /// Delivers an emission produced by a command from `origin`. The origin
    /// connection gets the ack but never its own event.
    pub async fn emit(&self, origin: ConnectionId, emission: Emission) -> FanoutReport {
        let Emission { ack, event, audience, push } = emission;

        if let Some(ack) = ack {
            if !self.reply(origin, ack).await {
                tracing::debug!("Origin connection {} went away before its ack", origin);
            }
        }

        let mut report = FanoutReport::default();
        match audience {
            Audience::Users(recipients) => {
                let sender = push.as_ref().and_then(|request| request.sender_id);
                for recipient in &recipients {
                    let (local, remote) = self.to_user(recipient.user_id, &event, Some(origin)).await;
                    report.local += local;
                    report.remote += remote;
                    if Some(recipient.user_id) != sender {
                        report.recipients += local + remote;
                    }
                }
                if let Some(request) = push {
                    report.push_signals = self.signal_unreachable(&recipients, &request).await;
                    if report.handed_over() {
                        self.mark_sent(request.message_id).await;
                    }
                }
            }
            Audience::Everyone => {
                report.local = self.registry.deliver_to_all(&event, Some(origin)).await;
                let envelope = BusEnvelope::new(Channel::Broadcast, event)
                    .delivered_by(self.bus.process_id())
                    .skipping(Some(origin));
                report.remote = self.publish(&envelope).await;
            }
        }

        tracing::debug!(
            "Fan-out from {}: {} local, {} remote, {} push",
            origin,
            report.local,
            report.remote,
            report.push_signals
        );
        report
    }

    /// Local delivery first, then the user's channel for other processes.
    pub async fn to_user(&self, user_id: UserId, event: &ServerEvent, skip: Option<ConnectionId>) -> (usize, usize) {
        let local = self.registry.deliver_to_user(user_id, event, skip).await;
        let envelope = BusEnvelope::new(Channel::User(user_id), event.clone())
            .delivered_by(self.bus.process_id())
            .skipping(skip);
        let remote = self.publish(&envelope).await;
        (local, remote)
    }

    async fn publish(&self, envelope: &BusEnvelope) -> usize {
        match self.bus.publish(envelope).await {
            Ok(receivers) => receivers,
            Err(e) => {
                tracing::warn!("Failed to publish {} to {}: {}", envelope.event.kind(), envelope.target.name(), e);
                0
            }
        }
    }

    async fn signal_unreachable(&self, recipients: &[Recipient], request: &PushRequest) -> usize {
        let mut signals = 0;
        for recipient in recipients {
            if Some(recipient.user_id) == request.sender_id {
                continue;
            }
            match self.presence.status(recipient.user_id).await {
                PresenceStatus::Online => continue,
                PresenceStatus::Offline | PresenceStatus::Indeterminate => {}
            }

            let signal = PushSignal {
                recipient: recipient.user_id,
                recipient_role: recipient.role,
                chat_id: request.chat_id,
                chat_type: request.chat_type,
                message_id: request.message_id,
                sender_id: request.sender_id,
                preview: request.preview.clone(),
                created_at: request.created_at,
            };
            match self.push.submit(&signal).await {
                Ok(()) => signals += 1,
                Err(e) => tracing::warn!(
                    "Failed to raise push signal for user {} message {}: {}",
                    recipient.user_id,
                    request.message_id,
                    e
                ),
            }
        }
        signals
    }

    async fn mark_sent(&self, message_id: MessageId) {
        if let Err(e) = self
            .storage
            .advance_delivery_status(message_id, DeliveryStatus::Sent)
            .await
        {
            tracing::warn!("Failed to mark message {} as sent: {}", message_id, e);
        }
    }
}

/// Delivers envelopes published by other processes (or with no origin) to
/// the connections this process holds.
pub async fn run_inbound(registry: Arc<ConnectionRegistry>, mut inbound: mpsc::UnboundedReceiver<BusEnvelope>) {
    let process_id = registry.process_id();
    tracing::info!("Inbound bus delivery started for process {}", process_id);

    while let Some(envelope) = inbound.recv().await {
        if !envelope.is_for(process_id) {
            continue;
        }
        let BusEnvelope { target, skip_connection, event, .. } = envelope;
        let delivered = match target {
            Channel::User(user_id) => registry.deliver_to_user(user_id, &event, skip_connection).await,
            Channel::Connection(connection_id) => {
                usize::from(registry.deliver_to_connection(connection_id, event).await)
            }
            Channel::Broadcast => registry.deliver_to_all(&event, skip_connection).await,
        };
        tracing::trace!("Bus envelope for {} reached {} connections", target.name(), delivered);
    }

    tracing::warn!("Inbound bus stream ended for process {}", process_id);
}
