use super::accumulator::Accumulator;
use super::error::ChatError;
use super::state::{ChatEvent, ChatState, ExchangePhase};
use crate::agents;
use crate::backend::{BackendError, ChatBackend, PromptRequest, StreamEvent};
use crate::db::models::{Attachment, AttachmentKind, Conversation, Message};
use crate::settings::AppSettings;
use crate::stager::AttachmentStager;
use crate::store::ConversationStore;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub web_search: bool,
    /// Id of an entry in [`agents::AGENTS`].
    pub agent: Option<String>,
    /// `false` asks for the whole reply in one response.
    pub stream: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            web_search: false,
            agent: None,
            stream: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub conversation_id: String,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    pub model: String,
    pub options: SendOptions,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub user_id: String,
    /// Bound for uploads, opening the stream and the non-streaming reply.
    pub request_timeout: Duration,
    /// Longest silence tolerated between two stream items.
    pub stream_timeout: Duration,
}

impl From<&AppSettings> for OrchestratorConfig {
    fn from(settings: &AppSettings) -> Self {
        Self {
            user_id: settings.user_id.clone(),
            request_timeout: settings.request_timeout,
            stream_timeout: settings.stream_timeout,
        }
    }
}

#[derive(Debug)]
pub enum ExchangeOutcome {
    Completed { answer: String },
    /// Stopped by the user; `answer` is the text received until then.
    Cancelled { answer: String },
    Failed { error: ChatError },
}

/// A running exchange.
pub struct ExchangeHandle {
    conversation_id: String,
    message_id: String,
    cancel: CancellationToken,
    state: Arc<ChatState>,
    task: JoinHandle<ExchangeOutcome>,
}

impl ExchangeHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Same rules as [`StreamingChatOrchestrator::cancel`]: only a streaming
    /// answer can be stopped.
    pub fn cancel(&self) -> Result<(), ChatError> {
        if self.state.phase(&self.conversation_id) != ExchangePhase::Streaming {
            return Err(ChatError::NotStreaming(self.conversation_id.clone()));
        }
        self.cancel.cancel();
        Ok(())
    }

    pub async fn outcome(self) -> Result<ExchangeOutcome, JoinError> {
        self.task.await
    }
}

type CancelRegistry = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Runs question/answer exchanges against the backend, one at a time per
/// conversation, and streams each answer into its placeholder message.
pub struct StreamingChatOrchestrator {
    backend: Arc<dyn ChatBackend>,
    store: Arc<ConversationStore>,
    stager: Arc<AttachmentStager>,
    state: Arc<ChatState>,
    config: OrchestratorConfig,
    cancels: CancelRegistry,
}

impl StreamingChatOrchestrator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<ConversationStore>,
        stager: Arc<AttachmentStager>,
        state: Arc<ChatState>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            backend,
            store,
            stager,
            state,
            config,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn state(&self) -> &Arc<ChatState> {
        &self.state
    }

    /// Starts an exchange. Returns once the placeholder message exists; the
    /// answer is received on a spawned task.
    pub async fn send(&self, request: SendRequest) -> Result<ExchangeHandle, ChatError> {
        if request.prompt.trim().is_empty() && request.attachments.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        if let Some(agent) = request.options.agent.as_deref() {
            if agents::find(agent).is_none() {
                return Err(ChatError::UnknownAgent(agent.to_string()));
            }
        }

        let conversation_id = request.conversation_id.clone();
        self.state.begin_exchange(&conversation_id)?;
        let cancel = CancellationToken::new();
        self.cancels
            .lock()
            .insert(conversation_id.clone(), cancel.clone());

        let pdfs: Vec<PathBuf> = request
            .attachments
            .iter()
            .filter(|a| a.kind == AttachmentKind::Pdf)
            .map(|a| PathBuf::from(&a.url))
            .collect();
        if !pdfs.is_empty() {
            if let Err(e) = self.upload(&conversation_id, &pdfs).await {
                warn!(conversation_id = %conversation_id, error = %e, "attachment upload failed");
                let error = ChatError::AttachmentUploadFailed(e);
                self.release(&conversation_id);
                self.state.emit(ChatEvent::ExchangeFailed {
                    conversation_id,
                    message_id: None,
                    error: error.user_message(),
                });
                return Err(error);
            }
        }

        if cancel.is_cancelled() {
            self.release(&conversation_id);
            debug!(conversation_id = %conversation_id, "exchange aborted before submit");
            return Err(ChatError::Aborted(conversation_id));
        }

        let title = self.ensure_conversation(&request).await;

        if let Err(e) = self.stager.clear(&conversation_id) {
            warn!(conversation_id = %conversation_id, error = %e, "failed to clear staged attachments");
        }

        let timestamp = self
            .state
            .next_timestamp(&conversation_id, Utc::now().timestamp_millis());
        let placeholder = Message::placeholder(
            &conversation_id,
            &request.prompt,
            timestamp,
            request.attachments.clone(),
            &request.model,
        );
        let message_id = placeholder.id.clone();
        self.state.append_message(placeholder.clone());
        self.state.attach_message(&conversation_id, &message_id);
        if let Err(e) = self.store.create_message(&placeholder).await {
            warn!(message_id = %message_id, error = %e, "failed to persist placeholder");
        }
        if cancel.is_cancelled() {
            // Deleted while the conversation and placeholder were being written.
            self.discard(&conversation_id).await;
            return Err(ChatError::Aborted(conversation_id));
        }

        let image_urls: Vec<String> = request
            .attachments
            .iter()
            .filter(|a| a.kind == AttachmentKind::Image)
            .map(|a| a.url.clone())
            .collect();
        let prompt = PromptRequest {
            uid: self.config.user_id.clone(),
            prompt: request.prompt,
            model: request.model,
            conversation_id: Some(conversation_id.clone()),
            title,
            attachment_urls: (!image_urls.is_empty()).then_some(image_urls),
            web_search: request.options.web_search,
            agent: request.options.agent,
            stream: request.options.stream,
        };

        if prompt.stream {
            self.state
                .set_phase(&conversation_id, ExchangePhase::Streaming);
        }
        self.state.emit(ChatEvent::ExchangeStarted {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        });
        info!(conversation_id = %conversation_id, message_id = %message_id, "exchange started");

        let exchange = Exchange {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            request: prompt,
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
            cancels: Arc::clone(&self.cancels),
            config: self.config.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(exchange.run());

        Ok(ExchangeHandle {
            conversation_id,
            message_id,
            cancel,
            state: Arc::clone(&self.state),
            task,
        })
    }

    /// Stops the streaming exchange of `conversation_id`; it completes with
    /// the text received so far.
    pub fn cancel(&self, conversation_id: &str) -> Result<(), ChatError> {
        if self.state.phase(conversation_id) != ExchangePhase::Streaming {
            return Err(ChatError::NotStreaming(conversation_id.to_string()));
        }
        match self.cancels.lock().get(conversation_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(ChatError::NotStreaming(conversation_id.to_string())),
        }
    }

    /// Cancels whatever runs in `conversation_id`, in any phase. An exchange
    /// still submitting gives up before creating anything. Returns whether
    /// there was something to stop.
    pub fn abort(&self, conversation_id: &str) -> bool {
        match self.cancels.lock().get(conversation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn release(&self, conversation_id: &str) {
        self.cancels.lock().remove(conversation_id);
        self.state.end_exchange(conversation_id);
    }

    async fn discard(&self, conversation_id: &str) {
        self.state.remove_conversation(conversation_id);
        if let Err(e) = self.store.delete_conversation(conversation_id).await {
            warn!(conversation_id, error = %e, "failed to discard aborted conversation");
        }
        self.release(conversation_id);
        debug!(conversation_id, "exchange aborted before submit");
    }

    async fn upload(&self, conversation_id: &str, files: &[PathBuf]) -> Result<(), BackendError> {
        debug!(conversation_id, count = files.len(), "uploading attachments");
        match timeout(
            self.config.request_timeout,
            self.backend.upload_files(conversation_id, files),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.config.request_timeout)),
        }
    }

    /// Creates the conversation on its first exchange and returns its title.
    async fn ensure_conversation(&self, request: &SendRequest) -> String {
        if let Some(existing) = self
            .state
            .conversations()
            .into_iter()
            .find(|c| c.id == request.conversation_id)
        {
            return existing.title;
        }

        let title = Conversation::title_for(&request.prompt, &request.attachments);
        let conversation = Conversation::new(request.conversation_id.clone(), title.clone());
        if let Err(e) = self.store.create_conversation(conversation.clone()).await {
            warn!(conversation_id = %conversation.id, error = %e, "failed to persist conversation");
        }
        self.state.add_conversation(conversation);
        title
    }
}

/// State owned by the task that receives one answer.
struct Exchange {
    conversation_id: String,
    message_id: String,
    request: PromptRequest,
    backend: Arc<dyn ChatBackend>,
    store: Arc<ConversationStore>,
    state: Arc<ChatState>,
    cancels: CancelRegistry,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

enum Received {
    Complete(String),
    Cancelled(String),
}

impl Exchange {
    async fn run(self) -> ExchangeOutcome {
        let received = if self.request.stream {
            self.receive_stream().await
        } else {
            self.receive_reply().await
        };

        match received {
            Ok(Received::Complete(answer)) => {
                self.finalize(&answer, false).await;
                ExchangeOutcome::Completed { answer }
            }
            Ok(Received::Cancelled(answer)) => {
                self.finalize(&answer, true).await;
                ExchangeOutcome::Cancelled { answer }
            }
            Err(error) => {
                self.fail(&error).await;
                ExchangeOutcome::Failed { error }
            }
        }
    }

    async fn receive_stream(&self) -> Result<Received, ChatError> {
        let mut answer = Accumulator::default();

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Received::Cancelled(answer.into_text())),
            opened = timeout(self.config.request_timeout, self.backend.stream_prompt(&self.request)) => opened,
        };
        let mut events = match opened {
            Ok(events) => events?,
            Err(_) => return Err(ChatError::StreamTimeout(self.config.request_timeout)),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(conversation_id = %self.conversation_id, "stream cancelled");
                    return Ok(Received::Cancelled(answer.into_text()));
                }
                next = timeout(self.config.stream_timeout, events.next()) => next,
            };

            match next {
                Err(_) => return Err(ChatError::StreamTimeout(self.config.stream_timeout)),
                Ok(None) | Ok(Some(Ok(StreamEvent::Done))) => break,
                Ok(Some(Ok(StreamEvent::Chunk(chunk)))) => {
                    if answer.fold(&chunk) {
                        self.state
                            .publish_answer(&self.conversation_id, &self.message_id, answer.text());
                    }
                }
                Ok(Some(Ok(StreamEvent::Error(message)))) => {
                    return Err(ChatError::Server {
                        status: None,
                        message,
                    })
                }
                Ok(Some(Err(BackendError::MalformedChunk(line)))) => {
                    warn!(conversation_id = %self.conversation_id, line = %line, "skipping malformed chunk");
                }
                Ok(Some(Err(e))) => return Err(e.into()),
            }
        }

        Ok(Received::Complete(answer.into_text()))
    }

    async fn receive_reply(&self) -> Result<Received, ChatError> {
        let reply = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Received::Cancelled(String::new())),
            reply = timeout(self.config.request_timeout, self.backend.send_prompt(&self.request)) => reply,
        };
        match reply {
            Ok(reply) => Ok(Received::Complete(reply?.reply)),
            Err(_) => Err(ChatError::StreamTimeout(self.config.request_timeout)),
        }
    }

    async fn finalize(&self, answer: &str, cancelled: bool) {
        self.state
            .set_phase(&self.conversation_id, ExchangePhase::Finalizing);
        self.state
            .publish_answer(&self.conversation_id, &self.message_id, answer);
        self.persist().await;
        self.release();
        self.state.emit(ChatEvent::ExchangeCompleted {
            conversation_id: self.conversation_id.clone(),
            message_id: self.message_id.clone(),
            cancelled,
        });
        info!(
            conversation_id = %self.conversation_id,
            message_id = %self.message_id,
            cancelled,
            chars = answer.chars().count(),
            "exchange completed"
        );
    }

    async fn fail(&self, err: &ChatError) {
        error!(
            conversation_id = %self.conversation_id,
            message_id = %self.message_id,
            error = %err,
            "exchange failed"
        );
        self.state
            .set_phase(&self.conversation_id, ExchangePhase::Failed);
        let diagnostic = err.user_message();
        self.state
            .publish_answer(&self.conversation_id, &self.message_id, &diagnostic);
        self.persist().await;
        self.release();
        self.state.emit(ChatEvent::ExchangeFailed {
            conversation_id: self.conversation_id.clone(),
            message_id: Some(self.message_id.clone()),
            error: diagnostic,
        });
    }

    /// Writes the message through, unless its conversation was deleted meanwhile.
    async fn persist(&self) {
        let Some(message) = self
            .state
            .messages(&self.conversation_id)
            .into_iter()
            .rev()
            .find(|m| m.id == self.message_id)
        else {
            debug!(message_id = %self.message_id, "message gone, not persisting");
            return;
        };
        if let Err(e) = self.store.create_message(&message).await {
            warn!(message_id = %self.message_id, error = %e, "failed to persist answer");
        }
    }

    fn release(&self) {
        self.cancels.lock().remove(&self.conversation_id);
        self.state.end_exchange(&self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EventStream, PromptReply, WebSearchResults};
    use crate::db::models::THINKING;
    use crate::db::Database;
    use crate::store::remote::{DocumentStore, MemoryDocumentStore};
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use std::collections::VecDeque;

    type Feed = mpsc::UnboundedSender<Result<StreamEvent, BackendError>>;

    /// Backend whose streams are fed by the test.
    #[derive(Default)]
    struct FakeBackend {
        streams: Mutex<HashMap<String, VecDeque<EventStream>>>,
        fail_upload: bool,
        upload_delay: Option<Duration>,
        requests: Mutex<Vec<PromptRequest>>,
        uploads: Mutex<Vec<PathBuf>>,
    }

    impl FakeBackend {
        fn feed(&self, conversation_id: &str) -> Feed {
            let (tx, rx) = mpsc::unbounded();
            self.streams
                .lock()
                .entry(conversation_id.to_string())
                .or_default()
                .push_back(rx.boxed());
            tx
        }
    }

    #[async_trait]
    impl ChatBackend for FakeBackend {
        async fn send_prompt(&self, request: &PromptRequest) -> Result<PromptReply, BackendError> {
            self.requests.lock().push(request.clone());
            Ok(PromptReply {
                reply: format!("echo: {}", request.prompt),
                conversation_id: request.conversation_id.clone().unwrap_or_default(),
            })
        }

        async fn stream_prompt(&self, request: &PromptRequest) -> Result<EventStream, BackendError> {
            self.requests.lock().push(request.clone());
            let conversation_id = request.conversation_id.clone().unwrap_or_default();
            let next = self
                .streams
                .lock()
                .get_mut(&conversation_id)
                .and_then(|queue| queue.pop_front());
            next.ok_or(BackendError::Api {
                status: 503,
                message: "no stream scripted".into(),
            })
        }

        async fn upload_files(&self, _: &str, files: &[PathBuf]) -> Result<(), BackendError> {
            if let Some(delay) = self.upload_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_upload {
                return Err(BackendError::Api {
                    status: 500,
                    message: "upload rejected".into(),
                });
            }
            self.uploads.lock().extend_from_slice(files);
            Ok(())
        }

        async fn delete_files_for_conversation(&self, _: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn web_search(&self, _: &str) -> Result<WebSearchResults, BackendError> {
            Ok(WebSearchResults::default())
        }
    }

    struct Fixture {
        orchestrator: StreamingChatOrchestrator,
        backend: Arc<FakeBackend>,
        db: Arc<Database>,
        remote: Arc<MemoryDocumentStore>,
        stager: Arc<AttachmentStager>,
    }

    fn fixture(backend: FakeBackend) -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let remote = Arc::new(MemoryDocumentStore::new());
        let backend = Arc::new(backend);
        let store = Arc::new(ConversationStore::new(db.clone(), remote.clone()));
        let stager = Arc::new(AttachmentStager::new(db.clone()));
        let orchestrator = StreamingChatOrchestrator::new(
            backend.clone(),
            store,
            stager.clone(),
            Arc::new(ChatState::new()),
            OrchestratorConfig {
                user_id: "u1".into(),
                request_timeout: Duration::from_secs(60),
                stream_timeout: Duration::from_secs(120),
            },
        );
        Fixture {
            orchestrator,
            backend,
            db,
            remote,
            stager,
        }
    }

    fn request(conversation_id: &str, prompt: &str) -> SendRequest {
        SendRequest {
            conversation_id: conversation_id.into(),
            prompt: prompt.into(),
            attachments: Vec::new(),
            model: "m".into(),
            options: SendOptions::default(),
        }
    }

    fn chunk(text: &str) -> Result<StreamEvent, BackendError> {
        Ok(StreamEvent::Chunk(text.into()))
    }

    #[tokio::test]
    async fn test_hello_exchange() {
        let f = fixture(FakeBackend::default());
        let feed = f.backend.feed("c1");
        let state = f.orchestrator.state().clone();

        let handle = f.orchestrator.send(request("c1", "Hi")).await.unwrap();
        let messages = state.messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].answer, THINKING);
        assert_eq!(state.phase("c1"), ExchangePhase::Streaming);

        feed.unbounded_send(chunk("Hel")).unwrap();
        feed.unbounded_send(chunk("lo")).unwrap();
        feed.unbounded_send(Ok(StreamEvent::Done)).unwrap();

        let outcome = handle.outcome().await.unwrap();
        assert!(matches!(outcome, ExchangeOutcome::Completed { ref answer } if answer == "Hello"));

        let messages = state.messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].answer, "Hello");
        assert_eq!(state.phase("c1"), ExchangePhase::Idle);
        assert_eq!(f.db.get_messages("c1").unwrap()[0].answer, "Hello");
        assert_eq!(state.conversations()[0].title, "Hi");

        let sent = f.backend.requests.lock()[0].clone();
        assert_eq!(sent.uid, "u1");
        assert_eq!(sent.conversation_id.as_deref(), Some("c1"));
        assert!(sent.stream);
    }

    #[tokio::test]
    async fn test_cumulative_chunks_persist_final_text_once() {
        let f = fixture(FakeBackend::default());
        let feed = f.backend.feed("c1");
        let state = f.orchestrator.state().clone();

        let handle = f.orchestrator.send(request("c1", "Hi")).await.unwrap();
        feed.unbounded_send(chunk("Hel")).unwrap();
        feed.unbounded_send(chunk("Hello")).unwrap();
        feed.unbounded_send(chunk("Hello")).unwrap();
        feed.unbounded_send(Ok(StreamEvent::Done)).unwrap();
        handle.outcome().await.unwrap();

        assert_eq!(state.messages("c1")[0].answer, "Hello");
        let stored = f.remote.watch_messages("c1").next().await.unwrap().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].answer, "Hello");
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_text() {
        let f = fixture(FakeBackend::default());
        let feed = f.backend.feed("c1");
        let state = f.orchestrator.state().clone();
        let mut messages = state.subscribe_messages();

        let handle = f.orchestrator.send(request("c1", "Tell me a story")).await.unwrap();
        feed.unbounded_send(chunk("Once upon")).unwrap();
        messages
            .wait_for(|map| map.get("c1").is_some_and(|l| l[0].answer == "Once upon"))
            .await
            .unwrap();

        f.orchestrator.cancel("c1").unwrap();
        let outcome = handle.outcome().await.unwrap();
        assert!(matches!(outcome, ExchangeOutcome::Cancelled { ref answer } if answer == "Once upon"));
        assert_eq!(state.messages("c1")[0].answer, "Once upon");
        assert_eq!(f.db.get_messages("c1").unwrap()[0].answer, "Once upon");
        assert!(matches!(
            f.orchestrator.cancel("c1"),
            Err(ChatError::NotStreaming(_))
        ));
    }

    #[tokio::test]
    async fn test_second_send_is_rejected_while_streaming() {
        let f = fixture(FakeBackend::default());
        let feed = f.backend.feed("c1");
        let other = f.backend.feed("c2");
        let state = f.orchestrator.state().clone();

        let handle = f.orchestrator.send(request("c1", "first")).await.unwrap();
        assert!(matches!(
            f.orchestrator.send(request("c1", "second")).await,
            Err(ChatError::ExchangeInProgress(_))
        ));
        assert_eq!(state.messages("c1").len(), 1);

        // other conversations are independent
        let second = f.orchestrator.send(request("c2", "elsewhere")).await.unwrap();
        other.unbounded_send(Ok(StreamEvent::Done)).unwrap();
        second.outcome().await.unwrap();

        feed.unbounded_send(Ok(StreamEvent::Done)).unwrap();
        handle.outcome().await.unwrap();
        f.orchestrator.send(request("c1", "again")).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_prompt_and_unknown_agent_are_rejected() {
        let f = fixture(FakeBackend::default());
        assert!(matches!(
            f.orchestrator.send(request("c1", "   ")).await,
            Err(ChatError::EmptyPrompt)
        ));

        let mut with_agent = request("c1", "hi");
        with_agent.options.agent = Some("CHEF".into());
        assert!(matches!(
            f.orchestrator.send(with_agent).await,
            Err(ChatError::UnknownAgent(_))
        ));
        assert_eq!(f.orchestrator.state().phase("c1"), ExchangePhase::Idle);
    }

    #[tokio::test]
    async fn test_upload_failure_creates_no_message() {
        let f = fixture(FakeBackend {
            fail_upload: true,
            ..Default::default()
        });
        let state = f.orchestrator.state().clone();
        let mut events = state.subscribe_events();
        let pdf = Attachment::pdf("doc.pdf", "/tmp/doc.pdf");
        f.stager.add("c1", pdf.clone()).unwrap();

        let mut req = request("c1", "summarize");
        req.attachments = vec![pdf];
        let err = f.orchestrator.send(req).await.err().unwrap();
        assert!(matches!(err, ChatError::AttachmentUploadFailed(_)));

        assert!(state.messages("c1").is_empty());
        assert!(!state.has_conversation("c1"));
        assert_eq!(state.phase("c1"), ExchangePhase::Idle);
        assert_eq!(f.stager.list("c1").unwrap().len(), 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            ChatEvent::ExchangeFailed { message_id: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_attachments_are_sent_and_unstaged() {
        let f = fixture(FakeBackend::default());
        let feed = f.backend.feed("c1");
        let image = Attachment::image("cat", "https://img/cat.jpg");
        let pdf = Attachment::pdf("doc.pdf", "/tmp/doc.pdf");
        f.stager.add("c1", image.clone()).unwrap();
        f.stager.add("c1", pdf.clone()).unwrap();

        let mut req = request("c1", "");
        req.attachments = vec![image, pdf];
        let handle = f.orchestrator.send(req).await.unwrap();
        feed.unbounded_send(Ok(StreamEvent::Done)).unwrap();
        handle.outcome().await.unwrap();

        assert_eq!(*f.backend.uploads.lock(), vec![PathBuf::from("/tmp/doc.pdf")]);
        let sent = f.backend.requests.lock()[0].clone();
        assert_eq!(sent.attachment_urls, Some(vec!["https://img/cat.jpg".to_string()]));
        assert_eq!(sent.title, "cat");
        assert!(f.stager.list("c1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_payload_fails_exchange() {
        let f = fixture(FakeBackend::default());
        let feed = f.backend.feed("c1");
        let state = f.orchestrator.state().clone();
        let mut events = state.subscribe_events();

        let handle = f.orchestrator.send(request("c1", "Hi")).await.unwrap();
        feed.unbounded_send(chunk("partial")).unwrap();
        feed.unbounded_send(Ok(StreamEvent::Error("model overloaded".into())))
            .unwrap();

        let outcome = handle.outcome().await.unwrap();
        assert!(matches!(outcome, ExchangeOutcome::Failed { .. }));
        let answer = state.messages("c1")[0].answer.clone();
        assert_eq!(answer, "Sorry, I encountered an error. Please try again.");
        assert_eq!(state.phase("c1"), ExchangePhase::Idle);

        assert!(matches!(events.recv().await.unwrap(), ChatEvent::ExchangeStarted { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            ChatEvent::ExchangeFailed { message_id: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_skipped() {
        let f = fixture(FakeBackend::default());
        let feed = f.backend.feed("c1");

        let handle = f.orchestrator.send(request("c1", "Hi")).await.unwrap();
        feed.unbounded_send(chunk("a")).unwrap();
        feed.unbounded_send(Err(BackendError::MalformedChunk("data: {oops".into())))
            .unwrap();
        feed.unbounded_send(chunk("b")).unwrap();
        drop(feed);

        let outcome = handle.outcome().await.unwrap();
        assert!(matches!(outcome, ExchangeOutcome::Completed { ref answer } if answer == "ab"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_times_out() {
        let f = fixture(FakeBackend::default());
        let _feed = f.backend.feed("c1");
        let state = f.orchestrator.state().clone();

        let handle = f.orchestrator.send(request("c1", "Hi")).await.unwrap();
        let outcome = handle.outcome().await.unwrap();
        assert!(matches!(
            outcome,
            ExchangeOutcome::Failed {
                error: ChatError::StreamTimeout(_)
            }
        ));
        assert_eq!(
            state.messages("c1")[0].answer,
            "The response took too long. Please try again."
        );
    }

    #[tokio::test]
    async fn test_non_streaming_reply() {
        let f = fixture(FakeBackend::default());
        let state = f.orchestrator.state().clone();
        let mut req = request("c1", "ping");
        req.options.stream = false;

        let handle = f.orchestrator.send(req).await.unwrap();
        let outcome = handle.outcome().await.unwrap();
        assert!(matches!(outcome, ExchangeOutcome::Completed { ref answer } if answer == "echo: ping"));
        assert_eq!(state.messages("c1")[0].answer, "echo: ping");
        assert!(!f.backend.requests.lock()[0].stream);
    }

    #[tokio::test]
    async fn test_timestamps_increase_within_conversation() {
        let f = fixture(FakeBackend::default());
        let state = f.orchestrator.state().clone();
        for prompt in ["one", "two", "three"] {
            let feed = f.backend.feed("c1");
            let handle = f.orchestrator.send(request("c1", prompt)).await.unwrap();
            feed.unbounded_send(Ok(StreamEvent::Done)).unwrap();
            handle.outcome().await.unwrap();
        }
        let messages = state.messages("c1");
        assert_eq!(messages.len(), 3);
        assert!(messages.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(messages[2].question, "three");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_upload_creates_nothing() {
        let f = fixture(FakeBackend {
            upload_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let state = f.orchestrator.state().clone();
        let pdf = Attachment::pdf("doc.pdf", "/tmp/doc.pdf");
        f.stager.add("c1", pdf.clone()).unwrap();
        let mut req = request("c1", "summarize");
        req.attachments = vec![pdf];

        let (sent, aborted) = tokio::join!(f.orchestrator.send(req), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.orchestrator.abort("c1")
        });

        assert!(aborted);
        assert!(matches!(sent, Err(ChatError::Aborted(_))));
        assert!(!state.has_conversation("c1"));
        assert!(state.messages("c1").is_empty());
        assert_eq!(state.phase("c1"), ExchangePhase::Idle);
        assert!(f.db.list_conversations().unwrap().is_empty());
        assert!(f.db.get_messages("c1").unwrap().is_empty());
        assert!(f.backend.requests.lock().is_empty());
        assert!(!f.orchestrator.abort("c1"));
    }

    #[tokio::test]
    async fn test_handle_cancel_requires_streaming() {
        let f = fixture(FakeBackend::default());
        let mut req = request("c1", "ping");
        req.options.stream = false;

        let handle = f.orchestrator.send(req).await.unwrap();
        assert!(matches!(handle.cancel(), Err(ChatError::NotStreaming(_))));
        let outcome = handle.outcome().await.unwrap();
        assert!(matches!(outcome, ExchangeOutcome::Completed { ref answer } if answer == "echo: ping"));

        let feed = f.backend.feed("c1");
        let handle = f.orchestrator.send(request("c1", "story")).await.unwrap();
        feed.unbounded_send(chunk("Once")).unwrap();
        handle.cancel().unwrap();
        assert!(matches!(
            handle.outcome().await.unwrap(),
            ExchangeOutcome::Cancelled { .. }
        ));
    }
}
