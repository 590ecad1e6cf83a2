use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info};
use uuid::Uuid;

use duo_types::events::{MessageEvent, NEW_MESSAGE};
use duo_types::models::User;
use duo_types::protocol::Notification;

use crate::error::RelayError;
use crate::store::ConversationStore;

/// Registry-side handle to one live session: who it belongs to and where its
/// notifications go.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub conn_id: Uuid,
    pub user: User,
    tx: mpsc::UnboundedSender<Notification>,
}

impl SessionHandle {
    /// Creates a handle and the receiving end of its notification queue.
    pub fn new(user: User) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            conn_id: Uuid::new_v4(),
            user,
            tx,
        };
        (handle, rx)
    }

    /// Queues a notification. `false` if the session loop is already gone.
    fn notify(&self, notification: Notification) -> bool {
        self.tx.send(notification).is_ok()
    }
}

/// Outcome of a successful relay.
#[derive(Debug, Clone)]
pub struct Relayed {
    /// The message as the sender sees it (partner = recipient).
    pub event: MessageEvent,
    /// Number of notifications queued across all targeted sessions.
    pub delivered: usize,
}

/// Directory of live sessions per user, and the relay authority.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    store: Arc<dyn ConversationStore>,

    /// user_id -> (conn_id -> session). A user key exists only while its
    /// inner map is non-empty.
    sessions: RwLock<HashMap<Uuid, HashMap<Uuid, SessionHandle>>>,
}

impl Registry {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub async fn add_session(&self, session: &SessionHandle) {
        let mut sessions = self.inner.sessions.write().await;
        let group = sessions.entry(session.user.id).or_default();
        group.insert(session.conn_id, session.clone());
        debug!(
            "Added session {} for {} ({} live)",
            session.conn_id,
            session.user.username,
            group.len()
        );
    }

    /// Removes a session; a no-op if it is not registered. Returns whether
    /// anything was removed.
    pub async fn remove_session(&self, session: &SessionHandle) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        let Some(group) = sessions.get_mut(&session.user.id) else {
            return false;
        };
        let removed = group.remove(&session.conn_id).is_some();
        if group.is_empty() {
            sessions.remove(&session.user.id);
        }
        if removed {
            debug!("Removed session {} for {}", session.conn_id, session.user.username);
        }
        removed
    }

    pub async fn session_count(&self, user_id: Uuid) -> usize {
        self.inner
            .sessions
            .read()
            .await
            .get(&user_id)
            .map_or(0, HashMap::len)
    }

    /// Number of users with at least one live session.
    pub async fn online_users(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Persists a message from `origin`'s user to `recipient` and fans it out
    /// to every live session of the recipient plus the sender's other
    /// sessions. Nothing is delivered unless the message was stored.
    pub async fn relay(
        &self,
        origin: &SessionHandle,
        recipient: &str,
        body: &str,
    ) -> Result<Relayed, RelayError> {
        let sender = &origin.user;
        if recipient == sender.username {
            return Err(RelayError::SelfMessage);
        }
        if body.trim().is_empty() {
            return Err(RelayError::EmptyBody);
        }

        let store = self.inner.store.clone();
        let identity = recipient.to_string();
        let recipient_user = tokio::task::spawn_blocking(move || store.lookup_user(&identity))
            .await
            .map_err(|e| RelayError::Store(e.into()))?
            .map_err(RelayError::Store)?
            .ok_or_else(|| RelayError::RecipientNotFound(recipient.to_string()))?;
        if recipient_user.id == sender.id {
            return Err(RelayError::SelfMessage);
        }

        let store = self.inner.store.clone();
        let (sender_owned, recipient_owned, body_owned) =
            (sender.clone(), recipient_user.clone(), body.to_string());
        let (message, conversation) = tokio::task::spawn_blocking(move || {
            store.find_or_create_and_append(&sender_owned, &recipient_owned, &body_owned)
        })
        .await
        .map_err(|e| RelayError::Store(e.into()))?
        .map_err(|e| {
            error!("Failed to store message from {}: {:#}", sender.username, e);
            RelayError::Store(e)
        })?;

        // Each side sees the other party as its conversation partner.
        let to_recipient = MessageEvent::for_viewer(&message, &conversation, sender);
        let to_sender = MessageEvent::for_viewer(&message, &conversation, &recipient_user);
        let recipient_note = new_message_notification(&to_recipient)?;
        let sender_note = new_message_notification(&to_sender)?;

        let mut delivered = 0;
        {
            let sessions = self.inner.sessions.read().await;

            if let Some(group) = sessions.get(&recipient_user.id) {
                for session in group.values() {
                    if session.notify(recipient_note.clone()) {
                        delivered += 1;
                    }
                }
            }

            if let Some(group) = sessions.get(&sender.id) {
                for session in group.values().filter(|s| s.conn_id != origin.conn_id) {
                    if session.notify(sender_note.clone()) {
                        delivered += 1;
                    }
                }
            }
        }

        info!(
            "{} -> {}: message {} in conversation {} ({} bytes, {} deliveries)",
            sender.username,
            recipient_user.username,
            message.id,
            conversation.id,
            message.body.len(),
            delivered
        );

        Ok(Relayed {
            event: to_sender,
            delivered,
        })
    }
}

fn new_message_notification(event: &MessageEvent) -> Result<Notification, RelayError> {
    let data = serde_json::to_value(event).map_err(|e| RelayError::Store(e.into()))?;
    Ok(Notification {
        method: NEW_MESSAGE.to_string(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use chrono::Utc;
    use duo_types::models::{Conversation, Message, participant_pair};

    /// In-memory store that counts appends.
    #[derive(Default)]
    struct MemoryStore {
        users: Vec<User>,
        conversations: Mutex<Vec<Conversation>>,
        messages: Mutex<Vec<Message>>,
        appends: AtomicUsize,
        fail: bool,
    }

    impl ConversationStore for MemoryStore {
        fn lookup_user(&self, identity: &str) -> anyhow::Result<Option<User>> {
            Ok(self.users.iter().find(|u| u.username == identity).cloned())
        }

        fn find_or_create_and_append(
            &self,
            sender: &User,
            recipient: &User,
            body: &str,
        ) -> anyhow::Result<(Message, Conversation)> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("disk on fire"));
            }
            let (low, high) = participant_pair(sender.id, recipient.id);
            let mut conversations = self.conversations.lock().unwrap();
            let conversation = match conversations
                .iter()
                .find(|c| c.user_low == low && c.user_high == high)
            {
                Some(c) => c.clone(),
                None => {
                    let c = Conversation {
                        id: conversations.len() as i64 + 1,
                        user_low: low,
                        user_high: high,
                        created_at: Utc::now(),
                    };
                    conversations.push(c.clone());
                    c
                }
            };
            let mut messages = self.messages.lock().unwrap();
            let message = Message {
                id: messages.len() as i64 + 1,
                conversation_id: conversation.id,
                sender_id: sender.id,
                body: body.to_string(),
                created_at: Utc::now(),
            };
            messages.push(message.clone());
            Ok((message, conversation))
        }
    }

    fn user(username: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            name: username.to_uppercase(),
            created_at: Utc::now(),
        }
    }

    fn registry_with(store: MemoryStore) -> (Registry, Arc<MemoryStore>) {
        let store = Arc::new(store);
        (Registry::new(store.clone()), store)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn add_and_remove_sessions() {
        let (registry, _) = registry_with(MemoryStore::default());
        let alice = user("alice");
        let (first, _rx1) = SessionHandle::new(alice.clone());
        let (second, _rx2) = SessionHandle::new(alice.clone());

        registry.add_session(&first).await;
        registry.add_session(&second).await;
        assert_eq!(registry.session_count(alice.id).await, 2);
        assert_eq!(registry.online_users().await, 1);

        assert!(registry.remove_session(&first).await);
        assert_eq!(registry.session_count(alice.id).await, 1);

        assert!(registry.remove_session(&second).await);
        assert_eq!(registry.online_users().await, 0);

        // Already gone: no-op.
        assert!(!registry.remove_session(&second).await);
    }

    #[tokio::test]
    async fn fans_out_to_recipient_and_other_sender_sessions() {
        let alice = user("alice");
        let bob = user("bob");
        let (registry, _) = registry_with(MemoryStore {
            users: vec![alice.clone(), bob.clone()],
            ..Default::default()
        });

        let (origin, mut origin_rx) = SessionHandle::new(alice.clone());
        let (alice_phone, mut alice_phone_rx) = SessionHandle::new(alice.clone());
        let (alice_tablet, mut alice_tablet_rx) = SessionHandle::new(alice.clone());
        let mut bob_rxs = Vec::new();
        for _ in 0..3 {
            let (handle, rx) = SessionHandle::new(bob.clone());
            registry.add_session(&handle).await;
            bob_rxs.push(rx);
        }
        for handle in [&origin, &alice_phone, &alice_tablet] {
            registry.add_session(handle).await;
        }

        let relayed = registry.relay(&origin, "bob", "hi").await.unwrap();

        // 3 recipient sessions + (3 - 1) sender sessions.
        assert_eq!(relayed.delivered, 5);
        assert_eq!(relayed.event.conversation.conversation_partner.username, "bob");
        assert!(drain(&mut origin_rx).is_empty());

        for rx in &mut bob_rxs {
            let notes = drain(rx);
            assert_eq!(notes.len(), 1);
            assert_eq!(notes[0].method, NEW_MESSAGE);
            assert_eq!(notes[0].data["conversation"]["conversationPartner"]["username"], "alice");
            assert_eq!(notes[0].data["message"]["body"], "hi");
        }
        for rx in [&mut alice_phone_rx, &mut alice_tablet_rx] {
            let notes = drain(rx);
            assert_eq!(notes.len(), 1);
            assert_eq!(notes[0].data["conversation"]["conversationPartner"]["username"], "bob");
        }
    }

    #[tokio::test]
    async fn offline_recipient_still_persists() {
        let alice = user("alice");
        let bob = user("bob");
        let (registry, store) = registry_with(MemoryStore {
            users: vec![alice.clone(), bob.clone()],
            ..Default::default()
        });
        let (origin, _rx) = SessionHandle::new(alice.clone());
        registry.add_session(&origin).await;

        let relayed = registry.relay(&origin, "bob", "are you there?").await.unwrap();
        assert_eq!(relayed.delivered, 0);
        assert_eq!(store.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_messages_reuse_the_conversation() {
        let alice = user("alice");
        let bob = user("bob");
        let (registry, store) = registry_with(MemoryStore {
            users: vec![alice.clone(), bob.clone()],
            ..Default::default()
        });
        let (from_alice, _a) = SessionHandle::new(alice.clone());
        let (from_bob, _b) = SessionHandle::new(bob.clone());

        let first = registry.relay(&from_alice, "bob", "one").await.unwrap();
        let second = registry.relay(&from_bob, "alice", "two").await.unwrap();
        assert_eq!(first.event.conversation.id, second.event.conversation.id);
        assert_eq!(store.conversations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_self_messages_without_touching_the_store() {
        let alice = user("alice");
        let (registry, store) = registry_with(MemoryStore {
            users: vec![alice.clone()],
            ..Default::default()
        });
        let (origin, _rx) = SessionHandle::new(alice.clone());

        let err = registry.relay(&origin, "alice", "me").await.unwrap_err();
        assert!(matches!(err, RelayError::SelfMessage));
        assert_eq!(store.appends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejects_unknown_recipient_and_empty_body() {
        let alice = user("alice");
        let bob = user("bob");
        let (registry, store) = registry_with(MemoryStore {
            users: vec![alice.clone(), bob],
            ..Default::default()
        });
        let (origin, _rx) = SessionHandle::new(alice);

        let err = registry.relay(&origin, "mallory", "hi").await.unwrap_err();
        assert!(matches!(err, RelayError::RecipientNotFound(ref who) if who == "mallory"));

        let err = registry.relay(&origin, "bob", "   ").await.unwrap_err();
        assert!(matches!(err, RelayError::EmptyBody));
        assert_eq!(store.appends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_failure_delivers_nothing() {
        let alice = user("alice");
        let bob = user("bob");
        let (registry, _) = registry_with(MemoryStore {
            users: vec![alice.clone(), bob.clone()],
            fail: true,
            ..Default::default()
        });
        let (origin, _rx) = SessionHandle::new(alice.clone());
        let (alice_phone, mut alice_phone_rx) = SessionHandle::new(alice);
        let (bob_session, mut bob_rx) = SessionHandle::new(bob);
        for handle in [&origin, &alice_phone, &bob_session] {
            registry.add_session(handle).await;
        }

        let err = registry.relay(&origin, "bob", "hi").await.unwrap_err();
        assert!(matches!(err, RelayError::Store(_)));
        assert_eq!(err.to_string(), "Internal server error.");
        assert!(drain(&mut bob_rx).is_empty());
        assert!(drain(&mut alice_phone_rx).is_empty());
    }
}
