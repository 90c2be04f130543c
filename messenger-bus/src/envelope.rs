use messenger_core::protocol::ServerEvent;
use messenger_core::types::ConnectionId;
use messenger_core::MessengerResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::Channel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Process that already delivered the event to its own connections.
    /// That process drops the envelope when it comes back; `None` means every
    /// subscriber delivers.
    pub origin: Option<Uuid>,
    pub target: Channel,
    /// Connection that must not receive the event (usually the sender's).
    pub skip_connection: Option<ConnectionId>,
    pub event: ServerEvent,
}

impl BusEnvelope {
    pub fn new(target: Channel, event: ServerEvent) -> Self {
        BusEnvelope {
            origin: None,
            target,
            skip_connection: None,
            event,
        }
    }

    pub fn delivered_by(mut self, process_id: Uuid) -> Self {
        self.origin = Some(process_id);
        self
    }

    /// False when `process_id` already delivered this event locally.
    pub fn is_for(&self, process_id: Uuid) -> bool {
        self.origin != Some(process_id)
    }

    pub fn skipping(mut self, connection_id: Option<ConnectionId>) -> Self {
        self.skip_connection = connection_id;
        self
    }

    pub fn to_bytes(&self) -> MessengerResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> MessengerResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messenger_core::types::{ChatType, Role};

    #[test]
    fn envelope_survives_the_wire() {
        let envelope = BusEnvelope::new(
            Channel::User(7),
            ServerEvent::UnreadCountersChanged {
                chat_id: 3,
                chat_type: ChatType::Match,
                by_chat: 2,
                by_chat_type: 5,
                total: 9,
            },
        )
        .delivered_by(Uuid::new_v4())
        .skipping(Some(Uuid::new_v4()));

        let decoded = BusEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let envelope = BusEnvelope::new(
            Channel::Broadcast,
            ServerEvent::PresenceChanged { user_id: 1, role: Role::Scout, online: true },
        );
        let bytes = envelope.to_bytes().unwrap();
        assert!(BusEnvelope::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
