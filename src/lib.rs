pub mod agents;
pub mod backend;
pub mod chat;
pub mod controller;
pub mod db;
pub mod settings;
pub mod stager;
pub mod store;

use backend::http::{HttpBackend, HttpConfig};
use backend::{BackendError, ChatBackend};
use controller::ConversationController;
use db::Database;
use settings::{AppSettings, SettingsError};
use stager::AttachmentStager;
use std::path::Path;
use std::sync::Arc;
use store::remote::DocumentStore;
use store::ConversationStore;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to open database: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("failed to build HTTP client: {0}")]
    Backend(#[from] BackendError),
}

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default
/// `info` level; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Opens the database under `app_dir` and wires a controller against the
/// configured HTTP backend.
pub fn open(
    app_dir: &Path,
    remote: Arc<dyn DocumentStore>,
) -> Result<ConversationController, SetupError> {
    let db = Arc::new(Database::new(app_dir)?);
    let settings = AppSettings::load(&db)?;

    let mut http = HttpConfig::new(settings.backend_url.clone());
    http.request_timeout = settings.request_timeout;
    let backend = Arc::new(HttpBackend::new(http)?);

    info!(backend_url = %settings.backend_url, "prompt pilot core ready");
    Ok(assemble(db, remote, backend, &settings))
}

/// Wires a controller from already constructed parts.
pub fn assemble(
    db: Arc<Database>,
    remote: Arc<dyn DocumentStore>,
    backend: Arc<dyn ChatBackend>,
    settings: &AppSettings,
) -> ConversationController {
    let store = Arc::new(ConversationStore::new(Arc::clone(&db), remote));
    let stager = Arc::new(AttachmentStager::new(db));
    ConversationController::new(
        backend,
        store,
        stager,
        Arc::new(chat::ChatState::new()),
        settings.into(),
        settings.default_model.clone(),
    )
}
