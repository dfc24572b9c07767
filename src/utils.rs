use url::Url;

use crate::error::{ConnectionError, SyncError};

/// Path of the push endpoint relative to the server root.
pub const PUSH_PATH: &str = "/ws";

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Derive the websocket endpoint from an HTTP base url.
pub fn websocket_url(base_url: &str) -> Result<String, SyncError> {
    let normalized = normalize_url(base_url);
    let mut url = Url::parse(&normalized)
        .map_err(|e| ConnectionError::InvalidUrl(format!("{base_url}: {e}")))?;
    let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::InvalidUrl(base_url.to_string()))?;
    url.set_path(PUSH_PATH);
    Ok(url.to_string())
}
