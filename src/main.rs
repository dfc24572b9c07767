use std::sync::Arc;
use std::time::Duration;

use chat_sync::api::client::ApiClient;
use chat_sync::app::{AppState, Credentials};
use chat_sync::session::{PushSession, SessionConfig};
use chat_sync::{EngineConfig, SyncEngine};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut state = AppState::load();
    if state.base_url.is_empty()
        || state.current_token().is_none()
        || state.current_user_id().is_none()
    {
        error!("base_url, token and user_id must be set in chat-sync.toml");
        std::process::exit(2);
    }
    if state.device_id.is_empty() {
        state.ensure_device_id();
        if let Err(e) = state.save() {
            error!("failed to persist device id: {e}");
        }
    }

    let push_url = match state.push_url() {
        Ok(url) => url,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };
    let session = PushSession::new(SessionConfig {
        url: push_url,
        device_type: state.device_type.clone(),
        device_id: state.device_id.clone(),
    });
    let http = match reqwest::Client::builder().timeout(Duration::from_secs(15)).build() {
        Ok(http) => http,
        Err(e) => {
            error!("failed to build http client: {e}");
            std::process::exit(1);
        }
    };
    let config = EngineConfig {
        page_size: state.page_size,
        ..EngineConfig::default()
    };
    let credentials: Arc<dyn Credentials> = Arc::new(state.clone());
    let api = ApiClient::with_http(http, &state.base_url, Arc::clone(&credentials));
    let mut engine = SyncEngine::new(api, session, credentials, config);

    if let Err(e) = engine.start().await {
        error!("startup failed: {e}");
        std::process::exit(1);
    }
    info!("{} conversations loaded", engine.conversations().len());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    };
    if let Err(e) = engine.run(shutdown).await {
        error!("sync loop ended: {e}");
        std::process::exit(1);
    }
}
