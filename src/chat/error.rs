use crate::backend::BackendError;
use crate::store::StoreError;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("nothing to send: prompt and attachments are empty")]
    EmptyPrompt,
    #[error("an exchange is already running in conversation {0}")]
    ExchangeInProgress(String),
    #[error("no exchange is streaming in conversation {0}")]
    NotStreaming(String),
    /// The conversation was deleted while the message was still being submitted.
    #[error("exchange aborted in conversation {0}")]
    Aborted(String),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("unknown agent directive: {0}")]
    UnknownAgent(String),
    #[error("attachment upload failed: {0}")]
    AttachmentUploadFailed(#[source] BackendError),
    #[error("no data received within {0:?}")]
    StreamTimeout(Duration),
    #[error("network error: {0}")]
    Network(#[source] BackendError),
    /// Non-2xx response, or an explicit error payload (`status` is `None`).
    #[error("server error ({status:?}): {message}")]
    Server { status: Option<u16>, message: String },
    #[error("malformed stream line: {0}")]
    MalformedChunk(String),
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl From<BackendError> for ChatError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout(after) => ChatError::StreamTimeout(after),
            BackendError::Api { status, message } => ChatError::Server {
                status: Some(status),
                message,
            },
            BackendError::MalformedChunk(line) => ChatError::MalformedChunk(line),
            BackendError::Http(ref e) if e.is_status() => ChatError::Server {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            },
            other => ChatError::Network(other),
        }
    }
}

impl ChatError {
    /// One-line diagnostic shown in place of the answer and in the error banner.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::AttachmentUploadFailed(_) => {
                "Couldn't upload your attachments. Please try again.".to_string()
            }
            ChatError::StreamTimeout(_) => {
                "The response took too long. Please try again.".to_string()
            }
            ChatError::Network(e) if e.is_timeout() => {
                "The response took too long. Please try again.".to_string()
            }
            ChatError::Network(_) => {
                "Network error: unable to reach the server. Please try again.".to_string()
            }
            ChatError::Server {
                status: Some(500..=599),
                ..
            } => "The server is having trouble right now. Please try again later.".to_string(),
            ChatError::Server { .. } | ChatError::MalformedChunk(_) => {
                "Sorry, I encountered an error. Please try again.".to_string()
            }
            ChatError::EmptyPrompt => "Type a message or add an attachment first.".to_string(),
            ChatError::ExchangeInProgress(_) => {
                "Please wait for the current answer to finish.".to_string()
            }
            ChatError::NotStreaming(_) => "There is no answer in progress.".to_string(),
            ChatError::Aborted(_) => "The request was cancelled.".to_string(),
            ChatError::UnknownModel(_) | ChatError::UnknownAgent(_) => self.to_string(),
            ChatError::Persistence(_) => {
                "Couldn't save your conversation. Please try again.".to_string()
            }
        }
    }
}

impl Serialize for ChatError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
