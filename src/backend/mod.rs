pub mod http;
pub mod sse;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One prompt as sent to the chat backend.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PromptRequest {
    pub uid: String,
    pub prompt: String,
    pub model: String,
    #[serde(rename = "chat_id")]
    pub conversation_id: Option<String>,
    pub title: String,
    #[serde(rename = "image_urls", skip_serializing_if = "Option::is_none")]
    pub attachment_urls: Option<Vec<String>>,
    pub web_search: bool,
    #[serde(rename = "agent_type", skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PromptReply {
    pub reply: String,
    #[serde(rename = "chat_id")]
    pub conversation_id: String,
}

/// A decoded event of the streaming reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    Done,
    Error(String),
}

pub type EventStream = BoxStream<'static, Result<StreamEvent, BackendError>>;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct WebSearchResults {
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
    pub extracted_content: Option<String>,
    pub sources: Option<Vec<WebSource>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WebSource {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

/// Transport to the remote chat backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send_prompt(&self, request: &PromptRequest) -> Result<PromptReply, BackendError>;

    /// Opens the streaming reply. Resolves once the response headers are in.
    async fn stream_prompt(&self, request: &PromptRequest) -> Result<EventStream, BackendError>;

    async fn upload_files(
        &self,
        conversation_id: &str,
        files: &[PathBuf],
    ) -> Result<(), BackendError>;

    async fn delete_files_for_conversation(&self, conversation_id: &str)
        -> Result<(), BackendError>;

    async fn web_search(&self, query: &str) -> Result<WebSearchResults, BackendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("no data received within {0:?}")]
    Timeout(std::time::Duration),
    #[error("malformed stream line: {0}")]
    MalformedChunk(String),
    #[error("file error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn is_timeout(&self) -> bool {
        match self {
            BackendError::Timeout(_) => true,
            BackendError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

impl Serialize for BackendError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
