use super::StoreError;
use crate::db::models::{Conversation, Message};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Live query results: every item is the full message list of one conversation,
/// in the document store's own write order.
pub type MessageSnapshots = BoxStream<'static, Result<Vec<Message>, StoreError>>;

/// Cloud document collections for conversations and messages.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError>;

    async fn put_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError>;

    async fn put_message(&self, message: &Message) -> Result<(), StoreError>;

    async fn delete_messages(&self, conversation_id: &str) -> Result<(), StoreError>;

    fn watch_messages(&self, conversation_id: &str) -> MessageSnapshots;
}

struct StoredMessage {
    /// Server-side write sequence, assigned on first write.
    seq: u64,
    message: Message,
}

#[derive(Default)]
struct Collections {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, StoredMessage>,
    next_seq: u64,
}

impl Collections {
    fn snapshot(&self, conversation_id: &str) -> Vec<Message> {
        let mut stored: Vec<&StoredMessage> = self
            .messages
            .values()
            .filter(|s| s.message.conversation_id == conversation_id)
            .collect();
        stored.sort_by_key(|s| s.seq);
        stored.into_iter().map(|s| s.message.clone()).collect()
    }
}

/// In-process document store with live message queries.
pub struct MemoryDocumentStore {
    collections: Arc<Mutex<Collections>>,
    changes: broadcast::Sender<String>,
    offline: AtomicBool,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            collections: Arc::new(Mutex::new(Collections::default())),
            changes,
            offline: AtomicBool::new(false),
        }
    }

    /// While offline every call fails with `StoreError::Remote`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Remote("document store unreachable".to_string()));
        }
        Ok(())
    }

    fn notify(&self, conversation_id: &str) {
        // No receivers is fine: nobody is watching this conversation.
        let _ = self.changes.send(conversation_id.to_string());
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        self.ensure_online()?;
        let collections = self.collections.lock();
        let mut conversations: Vec<Conversation> =
            collections.conversations.values().cloned().collect();
        conversations.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(conversations)
    }

    async fn put_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.ensure_online()?;
        self.collections
            .lock()
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        self.ensure_online()?;
        self.collections.lock().conversations.remove(id);
        Ok(())
    }

    async fn put_message(&self, message: &Message) -> Result<(), StoreError> {
        self.ensure_online()?;
        {
            let mut collections = self.collections.lock();
            let seq = match collections.messages.get(&message.id) {
                Some(existing) => existing.seq,
                None => {
                    collections.next_seq += 1;
                    collections.next_seq
                }
            };
            collections.messages.insert(
                message.id.clone(),
                StoredMessage {
                    seq,
                    message: message.clone(),
                },
            );
        }
        self.notify(&message.conversation_id);
        Ok(())
    }

    async fn delete_messages(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.ensure_online()?;
        self.collections
            .lock()
            .messages
            .retain(|_, s| s.message.conversation_id != conversation_id);
        self.notify(conversation_id);
        Ok(())
    }

    fn watch_messages(&self, conversation_id: &str) -> MessageSnapshots {
        let mut changes = self.changes.subscribe();
        let collections = Arc::clone(&self.collections);
        let conversation_id = conversation_id.to_string();
        let online = self.ensure_online();

        async_stream::stream! {
            if let Err(e) = online {
                yield Err(e);
                return;
            }
            let initial = collections.lock().snapshot(&conversation_id);
            yield Ok(initial);
            loop {
                match changes.recv().await {
                    Ok(changed) if changed == conversation_id => {
                        let snapshot = collections.lock().snapshot(&conversation_id);
                        yield Ok(snapshot);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        let snapshot = collections.lock().snapshot(&conversation_id);
                        yield Ok(snapshot);
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        }
        .boxed()
    }
}
