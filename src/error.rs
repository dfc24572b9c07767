use thiserror::Error;

/// Failures establishing or using the push session.
///
/// These are configuration or reachability problems; the session never
/// retries them on its own.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no auth token available for push connection")]
    MissingToken,
    #[error("invalid push url: {0}")]
    InvalidUrl(String),
    #[error("push transport unreachable: {0}")]
    Unreachable(String),
    #[error("push session is not connected")]
    NotConnected,
}

/// Failures of a single request/response call.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("malformed response envelope: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Request(#[from] RequestError),
    /// A fetch result arrived for a conversation that is no longer active.
    #[error("stale result for conversation {conversation_id}")]
    StaleResult { conversation_id: String },
    #[error("malformed {event} event: {reason}")]
    MalformedEvent { event: String, reason: String },
    #[error("message has neither text nor attachments")]
    EmptyMessage,
    #[error("no authenticated user")]
    NotAuthenticated,
    #[error("config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Request failures are presentable as a retryable action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Request(_) | SyncError::Connection(ConnectionError::Unreachable(_))
        )
    }
}
