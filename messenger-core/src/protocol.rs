//! Binary connection protocol.
//!
//! Each WebSocket binary message carries one or more frames. A frame is a
//! 4-byte big-endian body length followed by the bincode encoding of a
//! [`ClientCommand`] (client to server) or a [`ServerEvent`] (server to
//! client).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    ChatId, ChatType, ConnectionId, DeliveryStatus, Message, MessageContent, MessageId, Role, UserId,
};

pub const MAX_FRAME_LEN: usize = 1024 * 1024;
const HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    Malformed(#[from] bincode::Error),
}

impl ProtocolError {
    /// Oversized frames poison the stream; malformed bodies only lose one frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::FrameTooLarge(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    /// Client-chosen id echoed back in `MessageSent` or `Error`.
    pub temporary_id: String,
    pub chat_id: ChatId,
    pub content: MessageContent,
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct React {
    pub message_id: MessageId,
    pub emoji: String,
    pub remove: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Chat currently on screen, if any.
    pub chat_id: Option<ChatId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditMessage {
    pub message_id: MessageId,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMessage {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
    pub chat_id: ChatId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientCommand {
    SendMessage(SendMessage),
    React(React),
    Read(Receipt),
    Received(Receipt),
    Activity(Activity),
    Edit(EditMessage),
    Delete(DeleteMessage),
    Typing(Typing),
}

impl ClientCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientCommand::SendMessage(_) => "send_message",
            ClientCommand::React(_) => "react",
            ClientCommand::Read(_) => "read",
            ClientCommand::Received(_) => "received",
            ClientCommand::Activity(_) => "activity",
            ClientCommand::Edit(_) => "edit",
            ClientCommand::Delete(_) => "delete",
            ClientCommand::Typing(_) => "typing",
        }
    }

    pub fn temporary_id(&self) -> Option<&str> {
        match self {
            ClientCommand::SendMessage(command) => Some(&command.temporary_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReason {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    Connected {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    MessageSent {
        temporary_id: String,
        message_id: MessageId,
        created_at: DateTime<Utc>,
    },
    NewMessage {
        chat_type: ChatType,
        message: Message,
    },
    ReactionUpdated {
        chat_id: ChatId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
        count: i64,
        removed: bool,
    },
    DeliveryStatusChanged {
        chat_id: ChatId,
        message_id: MessageId,
        user_id: UserId,
        status: DeliveryStatus,
    },
    MessageEdited {
        chat_id: ChatId,
        message_id: MessageId,
        content: MessageContent,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        chat_id: ChatId,
        message_id: MessageId,
    },
    UnreadCountersChanged {
        chat_id: ChatId,
        chat_type: ChatType,
        by_chat: i64,
        by_chat_type: i64,
        total: i64,
    },
    PresenceChanged {
        user_id: UserId,
        role: Role,
        online: bool,
    },
    UserTyping {
        chat_id: ChatId,
        user_id: UserId,
        is_typing: bool,
    },
    Error {
        reason: ErrorReason,
        description: String,
        temporary_id: Option<String>,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::MessageSent { .. } => "message_sent",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::ReactionUpdated { .. } => "reaction_updated",
            ServerEvent::DeliveryStatusChanged { .. } => "delivery_status_changed",
            ServerEvent::MessageEdited { .. } => "message_edited",
            ServerEvent::MessageDeleted { .. } => "message_deleted",
            ServerEvent::UnreadCountersChanged { .. } => "unread_counters_changed",
            ServerEvent::PresenceChanged { .. } => "presence_changed",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::Error { .. } => "error",
        }
    }
}

pub fn encode_frame<T: Serialize>(value: &T, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = bincode::serialize(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    dst.reserve(HEADER_LEN + body.len());
    dst.put_u32(body.len() as u32);
    dst.put_slice(&body);
    Ok(())
}

pub fn encode_event(event: &ServerEvent) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_frame(event, &mut buf)?;
    Ok(buf.freeze())
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    Ok(bincode::deserialize(body)?)
}

/// Reassembles frames from a byte stream that may split or batch them.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame body, or `None` while the frame is incomplete.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(command: &ClientCommand) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(command, &mut buf).unwrap();
        buf
    }

    #[test]
    fn batched_frames_decode_in_order() {
        let first = ClientCommand::Read(Receipt { message_id: 10 });
        let second = ClientCommand::Activity(Activity { chat_id: Some(3) });
        let mut wire = frame(&first);
        wire.extend_from_slice(&frame(&second));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&wire);

        let a: ClientCommand = decode_body(&decoder.next_frame().unwrap().unwrap()).unwrap();
        let b: ClientCommand = decode_body(&decoder.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn split_frame_waits_for_remaining_bytes() {
        let command = ClientCommand::SendMessage(SendMessage {
            temporary_id: "tmp-1".to_string(),
            chat_id: 7,
            content: MessageContent::Text { text: "hello".to_string() },
            reply_to: None,
        });
        let wire = frame(&command);
        let (head, tail) = wire.split_at(6);

        let mut decoder = FrameDecoder::new();
        decoder.extend(head);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(tail);
        let decoded: ClientCommand = decode_body(&decoder.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn oversized_length_prefix_is_fatal() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        let err = decoder.next_frame().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn garbage_body_is_malformed_but_not_fatal() {
        let err = decode_body::<ClientCommand>(&[0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn server_event_frame_carries_length_prefix() {
        let event = ServerEvent::MessageDeleted { chat_id: 1, message_id: 2 };
        let bytes = encode_event(&event).unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - 4);
        let decoded: ServerEvent = decode_body(&bytes[4..]).unwrap();
        assert_eq!(decoded, event);
    }
}
