use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeysError {
    #[error("authentication failed")]
    Unauthenticated,

    #[error("identity key change not permitted from a linked device")]
    Forbidden,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("no keys available")]
    NotFound,

    #[error("rate limit exceeded, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("accessor called on stale account snapshot")]
    StaleAccount,

    #[error("storage error: {0}")]
    Storage(String),
}

impl KeysError {
    /// HTTP-style status code for this error, used by transport adapters.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthenticated => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Validation(_) => 422,
            Self::RateLimited { .. } => 429,
            Self::StaleAccount | Self::Storage(_) => 500,
        }
    }

    /// Suggested delay before a retry, if the caller may retry at all.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
