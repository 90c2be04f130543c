use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::MessengerError;

pub type UserId = i64;
pub type ChatId = i64;
pub type MessageId = i64;
pub type ConnectionId = Uuid;
pub type DeviceId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Scout,
    Bookmaker,
    Supervisor,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Scout, Role::Bookmaker, Role::Supervisor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Scout => "scout",
            Role::Bookmaker => "bookmaker",
            Role::Supervisor => "supervisor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MessengerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scout" => Ok(Role::Scout),
            "bookmaker" => Ok(Role::Bookmaker),
            "supervisor" => Ok(Role::Supervisor),
            other => Err(MessengerError::Validation(format!("unknown role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Personal,
    Match,
    Ticket,
}

impl ChatType {
    pub const ALL: [ChatType; 3] = [ChatType::Personal, ChatType::Match, ChatType::Ticket];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Personal => "personal",
            ChatType::Match => "match",
            ChatType::Ticket => "ticket",
        }
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatType {
    type Err = MessengerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(ChatType::Personal),
            "match" => Ok(ChatType::Match),
            "ticket" => Ok(ChatType::Ticket),
            other => Err(MessengerError::Validation(format!("unknown chat type: {}", other))),
        }
    }
}

/// Lifecycle of a persisted message. Ordered so that `a < b` means `b` is
/// further along; transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending = 1,
    Sent = 2,
    Delivered = 3,
    Read = 4,
}

impl DeliveryStatus {
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(DeliveryStatus::Pending),
            2 => Some(DeliveryStatus::Sent),
            3 => Some(DeliveryStatus::Delivered),
            4 => Some(DeliveryStatus::Read),
            _ => None,
        }
    }

    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        next > self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    InProgress,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::New => "new",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Closed => "closed",
        }
    }
}

impl FromStr for TicketStatus {
    type Err = MessengerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(TicketStatus::New),
            "in_progress" => Ok(TicketStatus::InProgress),
            "closed" => Ok(TicketStatus::Closed),
            other => Err(MessengerError::Validation(format!("unknown ticket status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChatPermissions(pub i32);

impl ChatPermissions {
    pub const READ: ChatPermissions = ChatPermissions(1);
    pub const WRITE: ChatPermissions = ChatPermissions(1 << 1);
    pub const READ_FOR_ALL: ChatPermissions = ChatPermissions(1 << 2);
    /// Regular participant: reads, writes and moves the chat-wide status.
    pub const MEMBER: ChatPermissions = ChatPermissions(1 | (1 << 1) | (1 << 2));
    /// Can follow the chat but its receipts only move its own pointers.
    pub const OBSERVER: ChatPermissions = ChatPermissions(1);

    pub fn contains(self, other: ChatPermissions) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageContent {
    Text {
        text: String,
    },
    File {
        file_id: Uuid,
        filename: String,
        mime_type: String,
        size: u64,
    },
}

impl MessageContent {
    /// Rejects empty text and text longer than `max_chars` characters.
    pub fn validate(&self, max_chars: usize) -> Result<(), MessengerError> {
        match self {
            MessageContent::Text { text } => {
                if text.trim().is_empty() {
                    return Err(MessengerError::Validation("message text is empty".to_string()));
                }
                let length = text.chars().count();
                if length > max_chars {
                    return Err(MessengerError::Validation(format!(
                        "message text is {} characters, the limit is {}",
                        length, max_chars
                    )));
                }
                Ok(())
            }
            MessageContent::File { filename, .. } => {
                if filename.is_empty() {
                    return Err(MessengerError::Validation("file name is empty".to_string()));
                }
                Ok(())
            }
        }
    }

    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text { text } => text.clone(),
            MessageContent::File { filename, .. } => format!("[file] {}", filename),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessengerError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessengerError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub chat_type: ChatType,
    pub match_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMembership {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub role: Role,
    pub permissions: ChatPermissions,
    pub is_primary: bool,
    pub last_read_message_id: Option<MessageId>,
}

impl ChatMembership {
    pub fn can_write(&self) -> bool {
        self.permissions.contains(ChatPermissions::WRITE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: Option<UserId>,
    pub content: MessageContent,
    pub reply_to: Option<MessageId>,
    pub delivery_status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender_id: Option<UserId>,
    pub content: MessageContent,
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub created_at: DateTime<Utc>,
    pub last_alive_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPushSubscription {
    pub user_id: UserId,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

/// Signal raised for a recipient that had no live connection when an event
/// was fanned out. Travels over the broker as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSignal {
    pub recipient: UserId,
    pub recipient_role: Role,
    pub chat_id: ChatId,
    pub chat_type: ChatType,
    pub message_id: MessageId,
    pub sender_id: Option<UserId>,
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounters {
    pub total: i64,
    pub by_chat_type: HashMap<ChatType, i64>,
}

impl UnreadCounters {
    pub fn for_chat_type(&self, chat_type: ChatType) -> i64 {
        self.by_chat_type.get(&chat_type).copied().unwrap_or(0)
    }
}
