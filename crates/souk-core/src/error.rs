use souk_models::gateway::ErrorCode;
use souk_util::validation::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("rate limited")]
    RateLimited,
    #[error("database error: {0}")]
    Database(#[from] souk_db::DbError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for CoreError {
    fn from(err: ValidationError) -> Self {
        CoreError::InvalidPayload(err.to_string())
    }
}

impl CoreError {
    /// Wire code used in gateway ACKs and join rejections.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::NotFound => ErrorCode::NotFound,
            CoreError::Forbidden => ErrorCode::Forbidden,
            CoreError::InvalidPayload(_) => ErrorCode::InvalidPayload,
            CoreError::Unauthenticated => ErrorCode::Unauthenticated,
            CoreError::RateLimited => ErrorCode::RateLimited,
            CoreError::Database(_) | CoreError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Message safe to show the caller. Storage and internal details stay
    /// in the logs.
    pub fn public_message(&self) -> String {
        match self {
            CoreError::Database(_) | CoreError::Internal(_) => "internal server error".into(),
            other => other.to_string(),
        }
    }
}
