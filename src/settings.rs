use crate::db::Database;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_BACKEND_URL: &str = "http://10.0.2.2:8000";
pub const DEFAULT_MODEL: &str = "deepseek/deepseek-r1-0528:free";

const SETTING_KEYS: &[&str] = &[
    "backend_url",
    "user_id",
    "default_model",
    "request_timeout_secs",
    "stream_timeout_secs",
];

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Unknown setting key: {0}")]
    UnknownKey(String),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
}

/// Resolved configuration, with defaults for anything not stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSettings {
    pub backend_url: String,
    pub user_id: String,
    pub default_model: String,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            user_id: "anonymous".to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            request_timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(120),
        }
    }
}

impl AppSettings {
    pub fn load(db: &Database) -> Result<Self, SettingsError> {
        let defaults = Self::default();
        Ok(Self {
            backend_url: db.get_setting("backend_url")?.unwrap_or(defaults.backend_url),
            user_id: db.get_setting("user_id")?.unwrap_or(defaults.user_id),
            default_model: db
                .get_setting("default_model")?
                .unwrap_or(defaults.default_model),
            request_timeout: secs_setting(db, "request_timeout_secs")?
                .unwrap_or(defaults.request_timeout),
            stream_timeout: secs_setting(db, "stream_timeout_secs")?
                .unwrap_or(defaults.stream_timeout),
        })
    }
}

fn secs_setting(db: &Database, key: &str) -> Result<Option<Duration>, SettingsError> {
    match db.get_setting(key)? {
        Some(value) => parse_secs(key, &value).map(Some),
        None => Ok(None),
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, SettingsError> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

pub fn get_settings(db: &Database) -> Result<HashMap<String, String>, SettingsError> {
    let mut map = HashMap::new();
    for key in SETTING_KEYS {
        if let Some(value) = db.get_setting(key)? {
            map.insert(key.to_string(), value);
        }
    }
    Ok(map)
}

pub fn set_setting(db: &Database, key: &str, value: &str) -> Result<(), SettingsError> {
    if !SETTING_KEYS.contains(&key) {
        return Err(SettingsError::UnknownKey(key.to_string()));
    }
    if key.ends_with("_secs") {
        parse_secs(key, value)?;
    }
    db.set_setting(key, value)?;
    Ok(())
}

pub fn delete_setting(db: &Database, key: &str) -> Result<(), SettingsError> {
    db.delete_setting(key)?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    /// Whether the model reads image and PDF attachments.
    pub supports_attachments: bool,
}

pub fn available_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: DEFAULT_MODEL.into(),
            name: "DeepSeek R1".into(),
            provider: "OpenRouter".into(),
            supports_attachments: false,
        },
        ModelInfo {
            id: "meta-llama/llama-3.3-70b-instruct:free".into(),
            name: "Llama 3.3 70B".into(),
            provider: "OpenRouter".into(),
            supports_attachments: false,
        },
        ModelInfo {
            id: "gemini-2.5-pro".into(),
            name: "Gemini 2.5 Pro".into(),
            provider: "Google".into(),
            supports_attachments: true,
        },
        ModelInfo {
            id: "gemini-2.5-flash".into(),
            name: "Gemini 2.5 Flash".into(),
            provider: "Google".into(),
            supports_attachments: true,
        },
        ModelInfo {
            id: "qwen/qwen3-32b".into(),
            name: "Qwen3 32B".into(),
            provider: "Groq".into(),
            supports_attachments: false,
        },
    ]
}
