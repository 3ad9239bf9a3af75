use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tracing::info;

use tianyi_agent::TurnOrchestrator;
use tianyi_core::config::TianyiConfig;
use tianyi_music::SongLibrary;
use tianyi_speech::SpeechClient;
use tianyi_store::{HotCache, LogStore, MemoryStore, VectorIndex};
use tianyi_users::AccountService;

/// Central shared state, passed as Arc<AppState> to all handlers.
pub struct AppState {
    pub config: TianyiConfig,
    pub logs: LogStore,
    pub store: Arc<MemoryStore>,
    pub accounts: AccountService,
    pub orchestrator: Arc<TurnOrchestrator>,
}

impl AppState {
    /// Construct every subsystem once at startup; components receive
    /// explicit handles, never globals.
    pub async fn init(config: TianyiConfig) -> anyhow::Result<Self> {
        let logs = LogStore::open(&config.database.path)?;
        let cache = HotCache::connect(&config.cache.url, config.cache.ttl_secs).await?;
        let vector = VectorIndex::connect(&config.vector).await?;
        let store = Arc::new(MemoryStore::new(cache, vector));

        let music = Arc::new(SongLibrary::load(&config.music.resource_path));
        let speech = Arc::new(SpeechClient::new(&config.speech));
        let accounts = AccountService::new(&config.auth);

        let orchestrator = Arc::new(TurnOrchestrator::new(
            &config,
            logs.clone(),
            Arc::clone(&store),
            music,
            speech,
        ));

        info!("all subsystems initialised");
        Ok(Self {
            config,
            logs,
            store,
            accounts,
            orchestrator,
        })
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/auth/register", post(crate::http::auth::register_handler))
        .route("/auth/login", post(crate::http::auth::login_handler))
        .route("/auth/auto_login", post(crate::http::auth::auto_login_handler))
        .route("/chat", post(crate::http::chat::chat_handler))
        .route("/picture_chat", post(crate::http::chat::picture_chat_handler))
        .route("/history", get(crate::http::history::history_handler))
        .route("/get_image", post(crate::http::image::get_image_handler))
        .route(
            "/update_image_client_path",
            post(crate::http::image::update_client_path_handler),
        )
        .layer(axum::extract::DefaultBodyLimit::max(32 * 1024 * 1024))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
