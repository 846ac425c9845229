use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel answer shown while the backend has not produced any text yet.
pub const THINKING: &str = "Thinking...";

const TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            created_at: Utc::now(),
        }
    }

    /// Title for a conversation whose first exchange carries `prompt` and `attachments`.
    pub fn title_for(prompt: &str, attachments: &[Attachment]) -> String {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return attachments
                .first()
                .map(|a| a.name.clone())
                .unwrap_or_else(|| "New Chat".to_string());
        }
        if prompt.chars().count() <= TITLE_MAX_CHARS {
            return prompt.to_string();
        }
        let mut title: String = prompt.chars().take(TITLE_MAX_CHARS).collect();
        title.push('…');
        title
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sender {
    User,
    Assistant,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "USER",
            Sender::Assistant => "ASSISTANT",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "ASSISTANT" => Sender::Assistant,
            _ => Sender::User,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentKind {
    Image,
    Pdf,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "IMAGE",
            AttachmentKind::Pdf => "PDF",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "IMAGE" => AttachmentKind::Image,
            _ => AttachmentKind::Pdf,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct Attachment {
    pub name: String,
    /// Remote URL for images, local file path for PDFs awaiting upload.
    pub url: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
}

impl Attachment {
    pub fn image(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            kind: AttachmentKind::Image,
        }
    }

    pub fn pdf(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            kind: AttachmentKind::Pdf,
        }
    }
}

/// One exchange: the user's question and the assistant's answer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub question: String,
    pub answer: String,
    pub sender: Sender,
    /// Client send time in unix milliseconds, strictly increasing per conversation.
    pub timestamp: i64,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
    pub model: String,
}

impl Message {
    pub fn placeholder(
        conversation_id: &str,
        question: &str,
        timestamp: i64,
        attachments: Vec<Attachment>,
        model: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            question: question.to_string(),
            answer: THINKING.to_string(),
            sender: Sender::User,
            timestamp,
            created_at: Utc::now(),
            attachments,
            model: model.to_string(),
        }
    }
}
