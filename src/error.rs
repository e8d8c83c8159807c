use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse classification of a failed dispatch, used for the report's error summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimit,
    ApiError,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::ApiError => "api_error",
            FailureKind::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a reasoning service call.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("API key not provided (set llm.api_key or DEEPSEEK_API_KEY)")]
    MissingApiKey,

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response format: {0}")]
    InvalidResponse(String),
}

impl DispatchError {
    /// Whether retrying the same call has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::Timeout(_)
            | DispatchError::RateLimited(_)
            | DispatchError::Transport(_) => true,
            DispatchError::Api { status, .. } => *status >= 500,
            DispatchError::MissingApiKey | DispatchError::InvalidResponse(_) => false,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DispatchError::Timeout(_) => FailureKind::Timeout,
            DispatchError::RateLimited(_) => FailureKind::RateLimit,
            DispatchError::Api { .. } | DispatchError::InvalidResponse(_) => FailureKind::ApiError,
            DispatchError::MissingApiKey | DispatchError::Transport(_) => FailureKind::Other,
        }
    }
}

/// Errors raised while reading entities out of a PLC XML document.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("XML syntax error at byte {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("document contains no analyzable PLC elements")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(DispatchError::Timeout(30).is_transient());
        assert!(DispatchError::RateLimited("slow down".into()).is_transient());
        assert!(DispatchError::Transport("connection reset".into()).is_transient());
        assert!(DispatchError::Api { status: 503, message: "unavailable".into() }.is_transient());
        assert!(!DispatchError::Api { status: 401, message: "unauthorized".into() }.is_transient());
        assert!(!DispatchError::MissingApiKey.is_transient());
    }

    #[test]
    fn failure_kinds_follow_error_variant() {
        assert_eq!(DispatchError::Timeout(1).failure_kind(), FailureKind::Timeout);
        assert_eq!(
            DispatchError::RateLimited(String::new()).failure_kind(),
            FailureKind::RateLimit
        );
        assert_eq!(
            DispatchError::Api { status: 500, message: String::new() }.failure_kind(),
            FailureKind::ApiError
        );
        assert_eq!(DispatchError::MissingApiKey.failure_kind(), FailureKind::Other);
    }
}
