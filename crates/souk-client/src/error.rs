use souk_models::gateway::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("gateway rejected the session")]
    InvalidSession,
    #[error("gateway protocol error: {0}")]
    Protocol(String),
    #[error("send rejected ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("no acknowledgement within {0:?}")]
    AckTimeout(std::time::Duration),
    #[error("realtime connection closed")]
    Closed,
    #[error("message is empty")]
    EmptyMessage,
}

impl ClientError {
    /// The SEND may or may not have been appended: only the log can tell.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ClientError::AckTimeout(_) | ClientError::Closed)
    }
}
