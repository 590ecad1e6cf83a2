//! Collaborator contracts the gateway consumes, plus their SQLite-backed
//! implementations.
//!
//! Both traits are synchronous; the registry and the handshake call them from
//! `spawn_blocking` so a slow disk never stalls the async workers.

use anyhow::{Context, Result, anyhow, ensure};
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use duo_db::Database;
use duo_db::models::{ConversationRow, MessageRow, UserRow};
use duo_types::models::{Conversation, Message, User};

/// Maps an opaque session token to the user it was issued for.
pub trait IdentityResolver: Send + Sync + 'static {
    /// `Ok(None)` when the token belongs to nobody.
    fn resolve_identity(&self, token: &str) -> Result<Option<User>>;
}

/// Durable storage for users, conversations and messages.
pub trait ConversationStore: Send + Sync + 'static {
    /// `Ok(None)` when no user has this identity.
    fn lookup_user(&self, identity: &str) -> Result<Option<User>>;

    /// Appends `body` to the conversation between `sender` and `recipient`,
    /// atomically creating the conversation if the pair has none yet.
    fn find_or_create_and_append(
        &self,
        sender: &User,
        recipient: &User,
        body: &str,
    ) -> Result<(Message, Conversation)>;
}

impl IdentityResolver for Database {
    fn resolve_identity(&self, token: &str) -> Result<Option<User>> {
        self.get_user_by_auth_key(token)?.map(user_from_row).transpose()
    }
}

impl ConversationStore for Database {
    fn lookup_user(&self, identity: &str) -> Result<Option<User>> {
        self.get_user_by_username(identity)?.map(user_from_row).transpose()
    }

    fn find_or_create_and_append(
        &self,
        sender: &User,
        recipient: &User,
        body: &str,
    ) -> Result<(Message, Conversation)> {
        let (conversation, message) =
            Database::find_or_create_and_append(self, sender.id, recipient.id, body)?;
        let conversation = conversation_from_row(conversation)?;
        ensure!(
            conversation.partner_of(sender.id) == Some(recipient.id),
            "Conversation {} does not join {} and {}",
            conversation.id,
            sender.id,
            recipient.id
        );
        Ok((message_from_row(message)?, conversation))
    }
}

pub fn user_from_row(row: UserRow) -> Result<User> {
    Ok(User {
        id: parse_id(&row.id)?,
        created_at: parse_timestamp(&row.created_at)?,
        username: row.username,
        name: row.name,
    })
}

pub fn conversation_from_row(row: ConversationRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.id,
        user_low: parse_id(&row.user_low)?,
        user_high: parse_id(&row.user_high)?,
        created_at: parse_timestamp(&row.created_at)?,
    })
}

pub fn message_from_row(row: MessageRow) -> Result<Message> {
    Ok(Message {
        id: row.id,
        conversation_id: row.conversation_id,
        sender_id: parse_id(&row.sender_id)?,
        created_at: parse_timestamp(&row.created_at)?,
        body: row.body,
    })
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("Corrupt id '{}'", raw))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone; treat it as UTC.
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| anyhow!("Corrupt timestamp '{}': {}", raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_timestamp_forms() {
        assert!(parse_timestamp("2026-03-01T10:00:00.123456Z").is_ok());
        assert!(parse_timestamp("2026-03-01 10:00:00").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn corrupt_ids_are_errors() {
        let row = UserRow {
            id: "not-a-uuid".into(),
            username: "alice".into(),
            name: "Alice".into(),
            created_at: "2026-03-01 10:00:00".into(),
        };
        assert!(user_from_row(row).is_err());
    }

    #[test]
    fn append_through_the_trait_joins_both_users() {
        let path = std::env::temp_dir().join(format!("duo-store-test-{}.db", Uuid::new_v4()));
        let db = Database::open(&path).unwrap();
        for (username, token) in [("alice", "a-token"), ("bob", "b-token")] {
            let id = Uuid::new_v4().to_string();
            db.create_user(&id, username, username).unwrap();
            db.insert_auth_key(&id, token).unwrap();
        }

        let alice = db.resolve_identity("a-token").unwrap().unwrap();
        let bob = ConversationStore::lookup_user(&db, "bob").unwrap().unwrap();
        assert!(db.resolve_identity("nobody").unwrap().is_none());

        let (message, conversation) =
            ConversationStore::find_or_create_and_append(&db, &alice, &bob, "hello").unwrap();
        assert_eq!(message.sender_id, alice.id);
        assert_eq!(message.conversation_id, conversation.id);
        assert_eq!(conversation.partner_of(alice.id), Some(bob.id));
        assert_eq!(conversation.partner_of(bob.id), Some(alice.id));

        drop(db);
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}
