use axum::http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

pub type ChatResult<T> = Result<T, ChatError>;

/// Everything a room operation can fail with. Errors are reported to the
/// originating connection only and never stop delivery to the rest of a room.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("party identity must not be empty")]
    InvalidIdentity,

    #[error("a call is already active in this room")]
    CallAlreadyActive,

    #[error("no active call with id {0}")]
    UnknownCall(Uuid),

    #[error("call {0} has already been resolved")]
    CallAlreadyResolved(Uuid),

    #[error("message store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("no identity on this session")]
    Unauthenticated,
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable code carried by `error` events.
    pub fn code(&self) -> &'static str {
        use ChatError::*;
        match self {
            Validation(_) => "VALIDATION_ERROR",
            InvalidIdentity => "INVALID_IDENTITY",
            CallAlreadyActive => "CALL_ALREADY_ACTIVE",
            UnknownCall(_) => "UNKNOWN_CALL",
            CallAlreadyResolved(_) => "CALL_ALREADY_RESOLVED",
            StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Unauthenticated => "UNAUTHENTICATED",
        }
    }

    pub fn status(&self) -> StatusCode {
        use ChatError::*;
        match self {
            Validation(_) | InvalidIdentity => StatusCode::BAD_REQUEST,
            CallAlreadyActive | CallAlreadyResolved(_) => StatusCode::CONFLICT,
            UnknownCall(_) => StatusCode::NOT_FOUND,
            StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Unauthenticated => StatusCode::UNAUTHORIZED,
        }
    }
}
