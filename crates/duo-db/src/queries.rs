use crate::Database;
use crate::models::{ConversationRow, MessageRow, UserRow};
use anyhow::{Result, bail};
use chrono::{SecondsFormat, Utc};
use duo_types::models::participant_pair;
use rusqlite::{Connection, Row, TransactionBehavior};
use sha2::{Digest, Sha256};
use uuid::Uuid;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, name: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, username, name, now()),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user(conn, "SELECT id, username, name, created_at FROM users WHERE username = ?1", username)
        })
    }

    // -- Auth keys --

    /// Stores the digest of an opaque session token. Issuing tokens is the
    /// account subsystem's job; this exists for seeding.
    pub fn insert_auth_key(&self, user_id: &str, token: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO auth_keys (key_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
                (hash_token(token), user_id, now()),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_auth_key(&self, token: &str) -> Result<Option<UserRow>> {
        let digest = hash_token(token);
        self.with_conn(|conn| {
            query_user(
                conn,
                "SELECT u.id, u.username, u.name, u.created_at
                 FROM auth_keys k
                 JOIN users u ON k.user_id = u.id
                 WHERE k.key_hash = ?1",
                &digest,
            )
        })
    }

    // -- Conversations --

    /// Appends a message to the conversation between `sender_id` and
    /// `recipient_id`, creating the conversation first if the pair has none.
    ///
    /// Runs as one IMMEDIATE transaction on the writer. The pair is unique at
    /// the schema level, so concurrent first contact from either side always
    /// resolves to the same row.
    pub fn find_or_create_and_append(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        body: &str,
    ) -> Result<(ConversationRow, MessageRow)> {
        if sender_id == recipient_id {
            bail!("Conversation participants must be distinct");
        }
        let (low, high) = participant_pair(sender_id, recipient_id);
        let (low, high) = (low.to_string(), high.to_string());
        let sender = sender_id.to_string();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let created = tx.execute(
                "INSERT INTO conversations (user_low, user_high, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (user_low, user_high) DO NOTHING",
                (&low, &high, now()),
            )?;

            let conversation = tx.query_row(
                "SELECT id, user_low, user_high, created_at FROM conversations
                 WHERE user_low = ?1 AND user_high = ?2",
                (&low, &high),
                conversation_from_row,
            )?;

            let created_at = now();
            tx.execute(
                "INSERT INTO messages (conversation_id, sender_id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
                (conversation.id, &sender, body, &created_at),
            )?;
            let message = MessageRow {
                id: tx.last_insert_rowid(),
                conversation_id: conversation.id,
                sender_id: sender.clone(),
                body: body.to_string(),
                created_at,
            };

            tx.commit()?;

            if created > 0 {
                tracing::debug!("Created conversation {} for {} / {}", conversation.id, low, high);
            }
            Ok((conversation, message))
        })
    }

    pub fn get_conversation_between(&self, a: Uuid, b: Uuid) -> Result<Option<ConversationRow>> {
        let (low, high) = participant_pair(a, b);
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, user_low, user_high, created_at FROM conversations
                     WHERE user_low = ?1 AND user_high = ?2",
                    (low.to_string(), high.to_string()),
                    conversation_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn count_conversations_between(&self, a: Uuid, b: Uuid) -> Result<i64> {
        let (low, high) = participant_pair(a, b);
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM conversations WHERE user_low = ?1 AND user_high = ?2",
                (low.to_string(), high.to_string()),
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    // -- Messages --

    /// All messages of a conversation, oldest first.
    pub fn get_messages(&self, conversation_id: i64) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, sender_id, body, created_at
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;

            let rows = stmt
                .query_map([conversation_id], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        sender_id: row.get(2)?,
                        body: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn query_user(conn: &Connection, sql: &str, key: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(sql)?;

    let row = stmt
        .query_row([key], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                name: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        user_low: row.get(1)?,
        user_high: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Server-assigned timestamp. Fixed-width RFC 3339, so text order is time order.
fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::temp_db;
    use std::sync::Arc;

    fn add_user(db: &Database, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), username, username).unwrap();
        id
    }

    #[test]
    fn first_message_creates_conversation_and_later_ones_reuse_it() {
        let db = temp_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");

        let (first, m1) = db.find_or_create_and_append(alice, bob, "hi bob").unwrap();
        let (second, m2) = db.find_or_create_and_append(bob, alice, "hi alice").unwrap();
        let (third, _) = db.find_or_create_and_append(alice, bob, "how are you").unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.id, third.id);
        assert!(m2.id > m1.id);
        assert_eq!(db.count_conversations_between(alice, bob).unwrap(), 1);

        let found = db.get_conversation_between(bob, alice).unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(found.user_low, participant_pair(alice, bob).0.to_string());

        let bodies: Vec<String> = db
            .get_messages(first.id)
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["hi bob", "hi alice", "how are you"]);
    }

    #[test]
    fn distinct_pairs_get_distinct_conversations() {
        let db = temp_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");
        let carol = add_user(&db, "carol");

        let (ab, _) = db.find_or_create_and_append(alice, bob, "x").unwrap();
        let (ac, _) = db.find_or_create_and_append(alice, carol, "y").unwrap();
        assert_ne!(ab.id, ac.id);
    }

    #[test]
    fn concurrent_first_contact_creates_one_conversation() {
        let db = temp_db();
        let db = Arc::new(db);
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                std::thread::spawn(move || {
                    let (from, to) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
                    db.find_or_create_and_append(from, to, "race").unwrap().0.id
                })
            })
            .collect();

        let ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(db.count_conversations_between(alice, bob).unwrap(), 1);
        assert_eq!(db.get_messages(ids[0]).unwrap().len(), 8);
    }

    #[test]
    fn rejects_self_conversation_and_empty_body() {
        let db = temp_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");

        assert!(db.find_or_create_and_append(alice, alice, "me").is_err());
        assert!(db.find_or_create_and_append(alice, bob, "").is_err());
        // The failed transaction must not leave a conversation behind.
        assert_eq!(db.count_conversations_between(alice, bob).unwrap(), 0);
    }

    #[test]
    fn auth_keys_resolve_to_users() {
        let db = temp_db();
        let alice = add_user(&db, "alice");
        db.insert_auth_key(&alice.to_string(), "secret-token").unwrap();

        let user = db.get_user_by_auth_key("secret-token").unwrap().unwrap();
        assert_eq!(user.username, "alice");
        assert!(db.get_user_by_auth_key("wrong").unwrap().is_none());

        let stored: String = db
            .with_conn(|conn| Ok(conn.query_row("SELECT key_hash FROM auth_keys", [], |r| r.get(0))?))
            .unwrap();
        assert_ne!(stored, "secret-token");
    }

    #[test]
    fn user_lookups() {
        let db = temp_db();
        let alice = add_user(&db, "alice");

        let by_name = db.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(by_name.id, alice.to_string());
        assert!(db.get_user_by_username("nobody").unwrap().is_none());
    }
}
