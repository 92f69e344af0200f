use std::time::Duration;
use thiserror::Error;

/// Outcome classes for a single upstream request.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP 429. `retry_after` is the server hint, or the configured default.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// HTTP 404, or a redirect away from the requested resource.
    #[error("resource not found")]
    NotFound,

    /// HTTP 403 or an explicit ban/quarantine marker in the body.
    #[error("access forbidden: {reason}")]
    Forbidden { reason: String },

    /// Timeouts, connection failures and 5xx after in-request retries ran out.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error(transparent)]
    RateLimiter(#[from] RateLimitError),
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("timed out after {0:?} waiting for a request slot")]
    AcquireTimeout(Duration),

    #[error("rate limit store: {0}")]
    Store(#[from] sea_orm::DbErr),
}
