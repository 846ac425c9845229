use crate::backend::{ChatBackend, WebSearchResults};
use crate::chat::{
    ActiveExchange, ChatError, ChatEvent, ChatState, ExchangeHandle, OrchestratorConfig,
    SendOptions, SendRequest, StreamingChatOrchestrator,
};
use crate::chat::state::MessageMap;
use crate::db::models::{Attachment, Conversation, Message};
use crate::settings::{self, ModelInfo};
use crate::stager::{AttachmentStager, PendingAttachments};
use crate::store::ConversationStore;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Entry point for the chat screen: owns the active conversation, keeps its
/// messages synced with the document store and routes user actions.
pub struct ConversationController {
    orchestrator: StreamingChatOrchestrator,
    backend: Arc<dyn ChatBackend>,
    store: Arc<ConversationStore>,
    stager: Arc<AttachmentStager>,
    state: Arc<ChatState>,
    selected_model: watch::Sender<String>,
    fetching: watch::Sender<bool>,
    /// Live query of the active conversation.
    sync: Mutex<Option<JoinHandle<()>>>,
    last_new_id: AtomicI64,
}

impl ConversationController {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<ConversationStore>,
        stager: Arc<AttachmentStager>,
        state: Arc<ChatState>,
        config: OrchestratorConfig,
        default_model: String,
    ) -> Self {
        let orchestrator = StreamingChatOrchestrator::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&stager),
            Arc::clone(&state),
            config,
        );
        Self {
            orchestrator,
            backend,
            store,
            stager,
            state,
            selected_model: watch::channel(default_model).0,
            fetching: watch::channel(false).0,
            sync: Mutex::new(None),
            last_new_id: AtomicI64::new(0),
        }
    }

    /// Loads the conversation list and opens the newest conversation, or a
    /// fresh one when there is none.
    pub async fn initialize(&self) -> Result<(), ChatError> {
        self.fetching.send_replace(true);
        let conversations = self.store.fetch_conversations().await;
        let conversations = match conversations {
            Ok(conversations) => conversations,
            Err(e) => {
                self.fetching.send_replace(false);
                return Err(e.into());
            }
        };
        info!(count = conversations.len(), "conversations loaded");

        let newest = conversations.first().map(|c| c.id.clone());
        self.state.set_conversations(conversations);
        match newest {
            Some(id) => self.activate(&id),
            None => {
                self.start_new_conversation();
            }
        }
        self.fetching.send_replace(false);
        Ok(())
    }

    /// Makes `conversation_id` the active conversation. Exchanges running in
    /// other conversations keep going.
    pub fn switch_conversation(&self, conversation_id: &str) {
        self.fetching.send_replace(true);
        self.activate(conversation_id);
        self.fetching.send_replace(false);
    }

    /// Opens an empty conversation with a fresh id. Nothing is stored until
    /// its first message is sent.
    pub fn start_new_conversation(&self) -> String {
        let now = Utc::now().timestamp_millis();
        // Ids are millisecond stamps; bump past the last one within the same millisecond.
        let id = self
            .last_new_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map_or(now, |last| now.max(last + 1))
            .to_string();

        self.stop_sync();
        self.state.set_active(&id);
        self.state.set_messages(&id, Vec::new());
        if let Err(e) = self.stager.clear(&id) {
            warn!(conversation_id = %id, error = %e, "failed to clear staged attachments");
        }
        if let Err(e) = self.stager.load(&id) {
            warn!(conversation_id = %id, error = %e, "failed to load staged attachments");
        }
        debug!(conversation_id = %id, "new conversation");
        id
    }

    /// Deletes a conversation everywhere: messages, staged attachments and the
    /// files uploaded to the backend. Cleanup failures are logged; the
    /// conversation is gone from local state either way.
    pub async fn delete_conversation_and_files(&self, conversation_id: &str) {
        let was_active = self.state.active_conversation() == conversation_id;
        if was_active {
            self.stop_sync();
        }
        if self.orchestrator.abort(conversation_id) {
            debug!(conversation_id, "stopped running exchange");
        }
        self.state.remove_conversation(conversation_id);

        if let Err(e) = self.store.delete_conversation(conversation_id).await {
            warn!(conversation_id, error = %e, "failed to delete conversation");
        }
        if let Err(e) = self.stager.clear(conversation_id) {
            warn!(conversation_id, error = %e, "failed to clear staged attachments");
        }
        if let Err(e) = self
            .backend
            .delete_files_for_conversation(conversation_id)
            .await
        {
            warn!(conversation_id, error = %e, "failed to delete uploaded files");
        }
        info!(conversation_id, "conversation deleted");

        if was_active {
            self.start_new_conversation();
        }
    }

    /// Sends `prompt` with the staged attachments into the active conversation.
    pub async fn send_message(
        &self,
        prompt: &str,
        options: SendOptions,
    ) -> Result<ExchangeHandle, ChatError> {
        let mut conversation_id = self.state.active_conversation();
        if conversation_id.is_empty() {
            conversation_id = self.start_new_conversation();
        }
        let attachments = self.stager.list(&conversation_id)?;
        let handle = self
            .orchestrator
            .send(SendRequest {
                conversation_id: conversation_id.clone(),
                prompt: prompt.to_string(),
                attachments,
                model: self.selected_model(),
                options,
            })
            .await?;

        // A new conversation gets its live query once it exists in the store.
        let syncing = self.sync.lock().is_some();
        if !syncing && self.state.active_conversation() == conversation_id {
            self.start_sync(&conversation_id);
        }
        Ok(handle)
    }

    /// Stops the answer streaming into the active conversation.
    pub fn cancel(&self) -> Result<(), ChatError> {
        self.orchestrator.cancel(&self.state.active_conversation())
    }

    pub fn add_attachment(&self, attachment: Attachment) -> Result<(), ChatError> {
        Ok(self
            .stager
            .add(&self.state.active_conversation(), attachment)?)
    }

    pub fn remove_attachment(&self, attachment: &Attachment) -> Result<(), ChatError> {
        Ok(self
            .stager
            .remove(&self.state.active_conversation(), attachment)?)
    }

    pub fn select_model(&self, model_id: &str) -> Result<(), ChatError> {
        if !settings::available_models().iter().any(|m| m.id == model_id) {
            return Err(ChatError::UnknownModel(model_id.to_string()));
        }
        self.selected_model.send_if_modified(|current| {
            if current == model_id {
                return false;
            }
            *current = model_id.to_string();
            true
        });
        Ok(())
    }

    pub fn selected_model(&self) -> String {
        self.selected_model.borrow().clone()
    }

    pub fn available_models(&self) -> Vec<ModelInfo> {
        settings::available_models()
    }

    pub async fn web_search(&self, query: &str) -> Result<WebSearchResults, ChatError> {
        Ok(self.backend.web_search(query).await?)
    }

    pub fn active_conversation(&self) -> String {
        self.state.active_conversation()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.conversations()
    }

    /// Messages of the active conversation, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.state.messages(&self.state.active_conversation())
    }

    pub fn subscribe_active(&self) -> watch::Receiver<String> {
        self.state.subscribe_active()
    }

    pub fn subscribe_conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.state.subscribe_conversations()
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<MessageMap> {
        self.state.subscribe_messages()
    }

    pub fn subscribe_exchanges(&self) -> watch::Receiver<HashMap<String, ActiveExchange>> {
        self.state.subscribe_exchanges()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.state.subscribe_events()
    }

    pub fn subscribe_pending_attachments(&self) -> watch::Receiver<PendingAttachments> {
        self.stager.subscribe()
    }

    pub fn subscribe_selected_model(&self) -> watch::Receiver<String> {
        self.selected_model.subscribe()
    }

    pub fn subscribe_fetching(&self) -> watch::Receiver<bool> {
        self.fetching.subscribe()
    }

    /// Shows cached messages at once, then follows the live query.
    fn activate(&self, conversation_id: &str) {
        self.state.set_active(conversation_id);
        match self.store.fetch_messages_local(conversation_id) {
            Ok(cached) => self.state.merge_snapshot(conversation_id, cached),
            Err(e) => warn!(conversation_id, error = %e, "failed to read cached messages"),
        }
        self.start_sync(conversation_id);
        if let Err(e) = self.stager.load(conversation_id) {
            warn!(conversation_id, error = %e, "failed to load staged attachments");
        }
    }

    fn start_sync(&self, conversation_id: &str) {
        let mut snapshots = self.store.fetch_messages(conversation_id);
        let state = Arc::clone(&self.state);
        let conversation_id = conversation_id.to_string();

        let task = tokio::spawn(async move {
            while let Some(snapshot) = snapshots.next().await {
                match snapshot {
                    Ok(messages) => state.merge_snapshot(&conversation_id, messages),
                    Err(e) => {
                        warn!(conversation_id = %conversation_id, error = %e, "live query stopped");
                        return;
                    }
                }
            }
        });

        if let Some(previous) = self.sync.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_sync(&self) {
        if let Some(task) = self.sync.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        self.stop_sync();
    }
}
