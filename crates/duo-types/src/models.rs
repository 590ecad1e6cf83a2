use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered account. Owned by the account subsystem; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A two-party thread. Participants are stored as a canonically ordered pair,
/// so `user_low < user_high` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub user_low: Uuid,
    pub user_high: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// The other participant, from `user_id`'s point of view.
    pub fn partner_of(&self, user_id: Uuid) -> Option<Uuid> {
        if self.user_low == user_id {
            Some(self.user_high)
        } else if self.user_high == user_id {
            Some(self.user_low)
        } else {
            None
        }
    }
}

/// Orders two distinct user ids into the pair key used for conversations.
/// Byte order on `Uuid` matches the ordering of their hyphenated text form,
/// which is what the database compares.
pub fn participant_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a < b { (a, b) } else { (b, a) }
}

/// An immutable message. Ordered within its conversation by
/// `(created_at, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}
