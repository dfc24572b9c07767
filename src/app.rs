use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::SyncError;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const DEFAULT_DEVICE_TYPE: &str = "desktop";

/// Read-only access to the credentials issued and stored elsewhere.
///
/// Both values are read on every use; rotation happens behind this trait.
pub trait Credentials: Send + Sync {
    fn current_token(&self) -> Option<String>;
    fn current_user_id(&self) -> Option<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppState {
    pub base_url: String,
    /// Push endpoint; derived from `base_url` when unset.
    pub socket_url: Option<String>,
    pub token: Option<String>,
    pub user_id: Option<String>,
    pub device_type: String,
    pub device_id: String,
    pub page_size: u32,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            socket_url: None,
            token: None,
            user_id: None,
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            device_id: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    fn toml_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        let cfg_dir = base.config_dir();
        Some(cfg_dir.join("chat-sync.toml"))
    }

    /// Load from the platform config dir, falling back to defaults.
    pub fn load() -> Self {
        if let Some(path) = Self::toml_path() {
            if let Ok(state) = Self::load_from(&path) {
                return state;
            }
        }
        Self::new()
    }

    pub fn load_from(path: &Path) -> Result<Self, SyncError> {
        let text = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        let mut state: AppState =
            toml::from_str(&text).map_err(|e| SyncError::Config(e.to_string()))?;
        state.base_url = crate::utils::normalize_url(&state.base_url);
        Ok(state)
    }

    pub fn save(&self) -> std::io::Result<()> {
        if let Some(path) = Self::toml_path() {
            self.save_to(&path)
        } else {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "No config dir"))
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let toml = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        fs::write(path, toml)
    }

    pub fn push_url(&self) -> Result<String, SyncError> {
        match &self.socket_url {
            Some(url) if !url.trim().is_empty() => Ok(url.trim().to_string()),
            _ => crate::utils::websocket_url(&self.base_url),
        }
    }

    /// Stable device id, generated once when the config carries none.
    pub fn ensure_device_id(&mut self) -> &str {
        if self.device_id.is_empty() {
            self.device_id = format!("{}_{}", self.device_type, uuid::Uuid::new_v4());
        }
        &self.device_id
    }
}

impl Credentials for AppState {
    fn current_token(&self) -> Option<String> {
        self.token.clone().filter(|t| !t.is_empty())
    }

    fn current_user_id(&self) -> Option<String> {
        self.user_id.clone().filter(|u| !u.is_empty())
    }
}

/// Credentials that an external collaborator may rotate in place.
impl Credentials for RwLock<AppState> {
    fn current_token(&self) -> Option<String> {
        self.read().ok().and_then(|s| s.current_token())
    }

    fn current_user_id(&self) -> Option<String> {
        self.read().ok().and_then(|s| s.current_user_id())
    }
}
