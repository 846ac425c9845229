pub mod remote;

use crate::db::models::{Conversation, Message};
use crate::db::Database;
use futures::StreamExt;
use remote::{DocumentStore, MessageSnapshots};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("local cache error: {0}")]
    Local(#[from] rusqlite::Error),
    #[error("document store error: {0}")]
    Remote(String),
}

impl Serialize for StoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Conversations and messages across the local cache and the document store.
/// Both layers are keyed by id; the last write wins.
///
/// Messages whose remote write failed are tracked as unsynced: the cached row
/// is authoritative for them until a retry reaches the document store.
pub struct ConversationStore {
    db: Arc<Database>,
    remote: Arc<dyn DocumentStore>,
    unsynced: Arc<Mutex<HashSet<String>>>,
}

impl ConversationStore {
    pub fn new(db: Arc<Database>, remote: Arc<dyn DocumentStore>) -> Self {
        Self {
            db,
            remote,
            unsynced: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// All conversations, newest first: the document store's list merged with
    /// cached conversations it does not know yet. Falls back to the cache when
    /// the document store cannot be reached.
    pub async fn fetch_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let remote = match self.remote.list_conversations().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "listing conversations from cache");
                return Ok(self.db.list_conversations()?);
            }
        };

        let mut merged: HashMap<String, Conversation> = HashMap::new();
        for conversation in self.db.list_conversations()? {
            merged.insert(conversation.id.clone(), conversation);
        }
        let remote_ids: HashSet<String> = remote.iter().map(|c| c.id.clone()).collect();
        for conversation in remote {
            if let Err(e) = self.db.upsert_conversation(&conversation) {
                warn!(conversation_id = %conversation.id, error = %e, "failed to cache conversation");
            }
            merged.insert(conversation.id.clone(), conversation);
        }

        for conversation in merged.values().filter(|c| !remote_ids.contains(&c.id)) {
            match self.remote.put_conversation(conversation).await {
                Ok(()) => debug!(conversation_id = %conversation.id, "conversation resynced"),
                Err(e) => {
                    warn!(conversation_id = %conversation.id, error = %e, "conversation resync failed")
                }
            }
        }

        let mut conversations: Vec<Conversation> = merged.into_values().collect();
        conversations.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(conversations)
    }

    /// Writes locally, then sends the remote write without waiting for it.
    pub async fn create_conversation(
        &self,
        conversation: Conversation,
    ) -> Result<Conversation, StoreError> {
        self.db.upsert_conversation(&conversation)?;

        let remote = Arc::clone(&self.remote);
        let pending = conversation.clone();
        tokio::spawn(async move {
            if let Err(e) = remote.put_conversation(&pending).await {
                warn!(conversation_id = %pending.id, error = %e, "remote conversation write failed");
            }
        });
        Ok(conversation)
    }

    /// Removes the conversation and its messages. The local copy is always
    /// removed first; a remote failure is reported afterwards.
    pub async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        self.db.delete_conversation(id)?;
        self.remote.delete_messages(id).await?;
        self.remote.delete_conversation(id).await?;
        debug!(conversation_id = id, "conversation deleted");
        Ok(())
    }

    pub fn fetch_messages_local(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self.db.get_messages(conversation_id)?)
    }

    /// Live messages of a conversation, sorted by `timestamp`. Every snapshot is
    /// also written into the local cache, except for unsynced messages: those
    /// keep their cached copy, which is pushed to the document store again.
    pub fn fetch_messages(&self, conversation_id: &str) -> MessageSnapshots {
        let db = Arc::clone(&self.db);
        let remote = Arc::clone(&self.remote);
        let unsynced = Arc::clone(&self.unsynced);
        let conversation_id = conversation_id.to_string();
        self.remote
            .watch_messages(&conversation_id)
            .then(move |snapshot| {
                let db = Arc::clone(&db);
                let remote = Arc::clone(&remote);
                let unsynced = Arc::clone(&unsynced);
                let conversation_id = conversation_id.clone();
                async move {
                    let messages = snapshot?;
                    reconcile(&db, remote.as_ref(), &unsynced, &conversation_id, messages).await
                }
            })
            .boxed()
    }

    /// Upserts into both layers. A failed remote write marks the message
    /// unsynced; the cached copy is kept.
    pub async fn create_message(&self, message: &Message) -> Result<(), StoreError> {
        self.db.upsert_message(message)?;
        match self.remote.put_message(message).await {
            Ok(()) => {
                self.unsynced.lock().remove(&message.id);
                Ok(())
            }
            Err(e) => {
                self.unsynced.lock().insert(message.id.clone());
                Err(e)
            }
        }
    }

    pub fn is_unsynced(&self, message_id: &str) -> bool {
        self.unsynced.lock().contains(message_id)
    }
}

async fn reconcile(
    db: &Database,
    remote: &dyn DocumentStore,
    unsynced: &Mutex<HashSet<String>>,
    conversation_id: &str,
    mut messages: Vec<Message>,
) -> Result<Vec<Message>, StoreError> {
    let pending: HashSet<String> = unsynced.lock().clone();
    let local: Vec<Message> = if pending.is_empty() {
        Vec::new()
    } else {
        db.get_messages(conversation_id)?
            .into_iter()
            .filter(|m| pending.contains(&m.id))
            .collect()
    };

    for message in &messages {
        if pending.contains(&message.id) {
            continue;
        }
        if let Err(e) = db.upsert_message(message) {
            warn!(message_id = %message.id, error = %e, "failed to cache message");
        }
    }

    for cached in local {
        match remote.put_message(&cached).await {
            Ok(()) => {
                unsynced.lock().remove(&cached.id);
                debug!(message_id = %cached.id, "message resynced");
            }
            Err(e) => warn!(message_id = %cached.id, error = %e, "message resync failed"),
        }
        match messages.iter_mut().find(|m| m.id == cached.id) {
            Some(slot) => *slot = cached,
            None => messages.push(cached),
        }
    }

    messages.sort_by_key(|m| m.timestamp);
    Ok(messages)
}
