// =============================================================================
// Typed exchange errors with a retryability classifier
// =============================================================================
//
// The order manager translates these into result codes: RATE_LIMITED for 429,
// EXCHANGE_RETRYABLE for transient failures, EXCHANGE_FATAL otherwise.
// =============================================================================

use thiserror::Error;

use crate::types::ExitCode;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Non-2xx HTTP response. `retry_after_ms` is populated from the
    /// Retry-After header on 429 responses.
    #[error("exchange returned HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
        retry_after_ms: Option<u64>,
    },

    /// Transport-level failure (connect, timeout, broken pipe).
    #[error("transport error: {0}")]
    Transport(String),

    /// Response arrived but could not be decoded as JSON.
    #[error("failed to decode exchange response: {0}")]
    Decode(String),

    /// JWT construction failed. Never retried.
    #[error("request signing failed: {0}")]
    Signing(String),

    /// Malformed request input. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ExchangeError {
    /// Retryable: transient I/O, 5xx, and 429 (which additionally honours
    /// Retry-After). 4xx other than 429, signing and decode errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Status { status: 429, .. })
    }

    /// Suggested delay before the next attempt, from Retry-After.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Status { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Map to the shared result-code taxonomy.
    pub fn exit_code(&self) -> ExitCode {
        if self.is_rate_limited() {
            ExitCode::RateLimited
        } else if self.is_retryable() {
            ExitCode::ExchangeRetryable
        } else if matches!(self, Self::InvalidArgument(_)) {
            ExitCode::InvalidArgs
        } else {
            ExitCode::ExchangeFatal
        }
    }
}
