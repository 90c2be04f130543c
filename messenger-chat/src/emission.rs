use chrono::{DateTime, Utc};
use messenger_core::protocol::ServerEvent;
use messenger_core::types::{ChatId, ChatMembership, ChatType, MessageId, Role, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recipient {
    pub user_id: UserId,
    pub role: Role,
}

impl From<&ChatMembership> for Recipient {
    fn from(member: &ChatMembership) -> Self {
        Recipient {
            user_id: member.user_id,
            role: member.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Users(Vec<Recipient>),
    /// Every connection on every process.
    Everyone,
}

/// Data for push signals raised on behalf of a new message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub chat_id: ChatId,
    pub chat_type: ChatType,
    pub message_id: MessageId,
    pub sender_id: Option<UserId>,
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

/// What a handler wants sent once it has done its work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    /// Sent to the originating connection only.
    pub ack: Option<ServerEvent>,
    pub event: ServerEvent,
    pub audience: Audience,
    /// When set, recipients without presence get a push signal and the
    /// message moves to `Sent` once a recipient has it.
    pub push: Option<PushRequest>,
}

impl Emission {
    pub fn to_members<'a, I>(event: ServerEvent, members: I) -> Self
    where
        I: IntoIterator<Item = &'a ChatMembership>,
    {
        Emission {
            ack: None,
            event,
            audience: Audience::Users(members.into_iter().map(Recipient::from).collect()),
            push: None,
        }
    }

    pub fn to_everyone(event: ServerEvent) -> Self {
        Emission {
            ack: None,
            event,
            audience: Audience::Everyone,
            push: None,
        }
    }

    pub fn with_ack(mut self, ack: ServerEvent) -> Self {
        self.ack = Some(ack);
        self
    }

    pub fn with_push(mut self, push: PushRequest) -> Self {
        self.push = Some(push);
        self
    }
}
