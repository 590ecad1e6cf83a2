use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Conversation, Message, User};

/// Method name of the notification pushed on every relayed message.
pub const NEW_MESSAGE: &str = "newMessage";

/// Public view of a user, as shown to the other side of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub name: String,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            name: user.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: Uuid,
    pub body: String,
    #[serde(rename = "sent")]
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessagePayload {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            body: message.body.clone(),
            created_at: message.created_at,
        }
    }
}

/// Conversation summary. `conversation_partner` is whoever the *reader* of
/// the payload is talking to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: i64,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    pub conversation_partner: UserSummary,
}

/// Payload of a `sendMessage` success response and of a `newMessage`
/// notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message: MessagePayload,
    pub conversation: ConversationSummary,
}

impl MessageEvent {
    /// Builds the event as seen by a participant whose partner is `partner`.
    pub fn for_viewer(message: &Message, conversation: &Conversation, partner: &User) -> Self {
        Self {
            message: MessagePayload::from(message),
            conversation: ConversationSummary {
                id: conversation.id,
                created_at: conversation.created_at,
                conversation_partner: UserSummary::from(partner),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_event_wire_shape() {
        let sender = User {
            id: Uuid::new_v4(),
            username: "alice".into(),
            name: "Alice".into(),
            created_at: Utc::now(),
        };
        let recipient = User {
            id: Uuid::new_v4(),
            username: "bob".into(),
            name: "Bob".into(),
            created_at: Utc::now(),
        };
        let (user_low, user_high) = crate::models::participant_pair(sender.id, recipient.id);
        let conversation = Conversation {
            id: 3,
            user_low,
            user_high,
            created_at: Utc::now(),
        };
        let message = Message {
            id: 11,
            conversation_id: 3,
            sender_id: sender.id,
            body: "hi".into(),
            created_at: Utc::now(),
        };

        let event = MessageEvent::for_viewer(&message, &conversation, &sender);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["message"]["body"], "hi");
        assert_eq!(json["message"]["conversationId"], 3);
        assert_eq!(json["message"]["senderId"], sender.id.to_string());
        assert!(json["message"]["sent"].is_string());
        assert!(json["conversation"]["created"].is_string());
        assert_eq!(json["conversation"]["conversationPartner"]["username"], "alice");
    }
}
