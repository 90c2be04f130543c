use chrono::{DateTime, Utc};
use messenger_core::types::{ChatId, ChatType, MessageId, PushSignal, Role, UserId};
use serde::Serialize;

pub const PREVIEW_MAX_CHARS: usize = 200;

/// JSON body the service worker receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub chat_id: ChatId,
    pub chat_type: ChatType,
    pub message_id: MessageId,
    /// Only supervisors see who wrote the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl NotificationPayload {
    pub fn from_signal(signal: &PushSignal) -> Self {
        let title = match signal.chat_type {
            ChatType::Personal => "New message",
            ChatType::Match => "New message in match chat",
            ChatType::Ticket => "New message in ticket",
        };
        NotificationPayload {
            title: title.to_string(),
            body: truncate_preview(&signal.preview),
            chat_id: signal.chat_id,
            chat_type: signal.chat_type,
            message_id: signal.message_id,
            sender_id: match signal.recipient_role {
                Role::Supervisor => signal.sender_id,
                Role::Scout | Role::Bookmaker => None,
            },
            created_at: signal.created_at,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

pub fn truncate_preview(preview: &str) -> String {
    if preview.chars().count() <= PREVIEW_MAX_CHARS {
        return preview.to_string();
    }
    let mut truncated: String = preview.chars().take(PREVIEW_MAX_CHARS).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(role: Role, preview: &str) -> PushSignal {
        PushSignal {
            recipient: 2,
            recipient_role: role,
            chat_id: 10,
            chat_type: ChatType::Ticket,
            message_id: 55,
            sender_id: Some(1),
            preview: preview.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn long_previews_are_cut_on_char_boundaries() {
        let preview = "ж".repeat(PREVIEW_MAX_CHARS + 10);
        let body = truncate_preview(&preview);
        assert_eq!(body.chars().count(), PREVIEW_MAX_CHARS + 1);
        assert!(body.ends_with('…'));
        assert_eq!(truncate_preview("short"), "short");
    }

    #[test]
    fn sender_is_visible_to_supervisors_only() {
        let for_supervisor = NotificationPayload::from_signal(&signal(Role::Supervisor, "hi"));
        assert_eq!(for_supervisor.sender_id, Some(1));

        let for_scout = NotificationPayload::from_signal(&signal(Role::Scout, "hi"));
        assert_eq!(for_scout.sender_id, None);
        let json: serde_json::Value = serde_json::from_slice(&for_scout.to_bytes().unwrap()).unwrap();
        assert!(json.get("sender_id").is_none());
        assert_eq!(json["chat_type"], "ticket");
    }
}
