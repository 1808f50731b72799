use uuid::Uuid;

use crate::types::UserId;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("user {0} is not allowed to submit scripts")]
    UserNotAllowed(UserId),

    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("job {job} is not owned by user {user}")]
    NotOwner { job: Uuid, user: UserId },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
