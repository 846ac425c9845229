use super::error::ChatError;
use crate::db::models::{Conversation, Message};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExchangePhase {
    Idle,
    Submitting,
    Streaming,
    Finalizing,
    Failed,
}

/// The exchange currently running in one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveExchange {
    pub phase: ExchangePhase,
    /// Set once the placeholder message exists.
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    ExchangeStarted {
        conversation_id: String,
        message_id: String,
    },
    ExchangeCompleted {
        conversation_id: String,
        message_id: String,
        cancelled: bool,
    },
    ExchangeFailed {
        conversation_id: String,
        message_id: Option<String>,
        error: String,
    },
}

pub type MessageMap = HashMap<String, Vec<Message>>;

/// Observable chat state shared by the orchestrator and the controller.
///
/// Every field is a `watch` channel: writers are serialized by the channel and
/// each write is published to subscribers as a whole. Message lists are kept in
/// ascending `timestamp` order, newest last.
pub struct ChatState {
    active: watch::Sender<String>,
    conversations: watch::Sender<Vec<Conversation>>,
    messages: watch::Sender<MessageMap>,
    exchanges: watch::Sender<HashMap<String, ActiveExchange>>,
    events: broadcast::Sender<ChatEvent>,
}

impl Default for ChatState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatState {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            active: watch::channel(String::new()).0,
            conversations: watch::channel(Vec::new()).0,
            messages: watch::channel(HashMap::new()).0,
            exchanges: watch::channel(HashMap::new()).0,
            events,
        }
    }

    // ── Active conversation ──

    pub fn active_conversation(&self) -> String {
        self.active.borrow().clone()
    }

    pub fn set_active(&self, conversation_id: &str) {
        self.active.send_if_modified(|active| {
            if active == conversation_id {
                return false;
            }
            *active = conversation_id.to_string();
            true
        });
    }

    pub fn subscribe_active(&self) -> watch::Receiver<String> {
        self.active.subscribe()
    }

    // ── Conversations ──

    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations.borrow().clone()
    }

    pub fn has_conversation(&self, conversation_id: &str) -> bool {
        self.conversations
            .borrow()
            .iter()
            .any(|c| c.id == conversation_id)
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.conversations.send_replace(conversations);
    }

    /// Inserts at the top of the list unless a conversation with that id exists.
    pub fn add_conversation(&self, conversation: Conversation) {
        self.conversations.send_if_modified(|list| {
            if list.iter().any(|c| c.id == conversation.id) {
                return false;
            }
            list.insert(0, conversation);
            true
        });
    }

    pub fn remove_conversation(&self, conversation_id: &str) {
        self.conversations.send_if_modified(|list| {
            let before = list.len();
            list.retain(|c| c.id != conversation_id);
            list.len() != before
        });
        self.messages
            .send_if_modified(|map| map.remove(conversation_id).is_some());
    }

    pub fn subscribe_conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.conversations.subscribe()
    }

    // ── Messages ──

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.messages
            .borrow()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_messages(&self, conversation_id: &str, mut messages: Vec<Message>) {
        messages.sort_by_key(|m| m.timestamp);
        self.messages.send_modify(|map| {
            map.insert(conversation_id.to_string(), messages);
        });
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<MessageMap> {
        self.messages.subscribe()
    }

    /// Timestamp for a new message: `now_ms`, or one past the newest message if
    /// that is not later.
    pub fn next_timestamp(&self, conversation_id: &str, now_ms: i64) -> i64 {
        let newest = self
            .messages
            .borrow()
            .get(conversation_id)
            .and_then(|list| list.iter().map(|m| m.timestamp).max());
        match newest {
            Some(newest) if newest >= now_ms => newest + 1,
            _ => now_ms,
        }
    }

    pub fn append_message(&self, message: Message) {
        self.messages.send_modify(|map| {
            map.entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        });
    }

    /// Replaces the answer of `message_id`. Returns false, without notifying
    /// subscribers, when the text is unchanged or the message is gone.
    pub fn publish_answer(&self, conversation_id: &str, message_id: &str, answer: &str) -> bool {
        self.messages.send_if_modified(|map| {
            let Some(message) = map
                .get_mut(conversation_id)
                .and_then(|list| list.iter_mut().rev().find(|m| m.id == message_id))
            else {
                return false;
            };
            if message.answer == answer {
                return false;
            }
            message.answer = answer.to_string();
            true
        })
    }

    /// Merges a snapshot from the cache or the document store. Snapshot entries
    /// win by id, except the message of a running exchange; local messages the
    /// snapshot does not know yet are kept.
    pub fn merge_snapshot(&self, conversation_id: &str, snapshot: Vec<Message>) {
        let in_flight = self
            .exchange(conversation_id)
            .and_then(|exchange| exchange.message_id);

        self.messages.send_if_modified(|map| {
            let local = map.entry(conversation_id.to_string()).or_default();
            let snapshot_ids: HashSet<String> = snapshot.iter().map(|m| m.id.clone()).collect();

            let mut merged: Vec<Message> = snapshot
                .into_iter()
                .map(|incoming| {
                    if in_flight.as_deref() == Some(incoming.id.as_str()) {
                        if let Some(current) = local.iter().find(|m| m.id == incoming.id) {
                            return current.clone();
                        }
                    }
                    incoming
                })
                .collect();
            merged.extend(
                local
                    .iter()
                    .filter(|m| !snapshot_ids.contains(&m.id))
                    .cloned(),
            );
            merged.sort_by_key(|m| m.timestamp);

            if *local == merged {
                return false;
            }
            *local = merged;
            true
        });
    }

    // ── Exchanges ──

    pub fn exchange(&self, conversation_id: &str) -> Option<ActiveExchange> {
        self.exchanges.borrow().get(conversation_id).cloned()
    }

    pub fn phase(&self, conversation_id: &str) -> ExchangePhase {
        self.exchange(conversation_id)
            .map(|e| e.phase)
            .unwrap_or(ExchangePhase::Idle)
    }

    /// `Idle → Submitting`; rejects while another exchange runs in the conversation.
    pub fn begin_exchange(&self, conversation_id: &str) -> Result<(), ChatError> {
        let started = self.exchanges.send_if_modified(|map| {
            if map.contains_key(conversation_id) {
                return false;
            }
            map.insert(
                conversation_id.to_string(),
                ActiveExchange {
                    phase: ExchangePhase::Submitting,
                    message_id: None,
                },
            );
            true
        });
        if started {
            Ok(())
        } else {
            Err(ChatError::ExchangeInProgress(conversation_id.to_string()))
        }
    }

    pub fn attach_message(&self, conversation_id: &str, message_id: &str) {
        self.exchanges.send_if_modified(|map| match map.get_mut(conversation_id) {
            Some(exchange) => {
                exchange.message_id = Some(message_id.to_string());
                true
            }
            None => false,
        });
    }

    pub fn set_phase(&self, conversation_id: &str, phase: ExchangePhase) {
        self.exchanges.send_if_modified(|map| match map.get_mut(conversation_id) {
            Some(exchange) if exchange.phase != phase => {
                exchange.phase = phase;
                true
            }
            _ => false,
        });
    }

    /// Back to `Idle`.
    pub fn end_exchange(&self, conversation_id: &str) {
        self.exchanges
            .send_if_modified(|map| map.remove(conversation_id).is_some());
    }

    pub fn subscribe_exchanges(&self) -> watch::Receiver<HashMap<String, ActiveExchange>> {
        self.exchanges.subscribe()
    }

    // ── Events ──

    pub fn emit(&self, event: ChatEvent) {
        // Nobody listening is not an error.
        let _ = self.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }
}
