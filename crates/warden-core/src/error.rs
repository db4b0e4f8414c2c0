use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur across Warden.
///
/// The first group wraps ambient failure domains (I/O, configuration,
/// serialization, storage). The second group is the review pipeline's failure
/// taxonomy; every variant there decides how the orchestrator retries.
///
/// # Examples
///
/// ```
/// use warden_core::{ErrorKind, WardenError};
///
/// let err = WardenError::NotFound("pull request #42".into());
/// assert_eq!(err.kind(), ErrorKind::NotFound);
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Storage backend failure.
    #[error("database error: {0}")]
    Database(String),

    /// The remote API rejected the credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The change request (or repository) no longer exists.
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote API throttled the request.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Server-provided hint for the earliest sensible retry.
        retry_after: Option<Duration>,
        /// Description of the throttled call.
        message: String,
    },

    /// Network failure or server-side (5xx) error.
    #[error("transient error: {0}")]
    Transient(String),

    /// The review generator did not answer in time.
    #[error("review generation timed out after {}s", .0.as_secs())]
    GenerationTimeout(Duration),

    /// The identity never completed authorization.
    #[error("no credential: {0}")]
    NoCredential(String),

    /// The identity is authorized but has no target repository selected.
    #[error("no repository selected: {0}")]
    NoRepositorySelected(String),

    /// Ledger or bookkeeping failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The inbound notification is missing required fields.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The remote API refused the request for a non-retryable reason.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl WardenError {
    /// Project this error onto the serialisable [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            WardenError::Io(_)
            | WardenError::Config(_)
            | WardenError::Serialization(_)
            | WardenError::Toml(_)
            | WardenError::Database(_)
            | WardenError::Internal(_) => ErrorKind::Internal,
            WardenError::Unauthorized(_) => ErrorKind::Unauthorized,
            WardenError::NotFound(_) => ErrorKind::NotFound,
            WardenError::RateLimited { .. } => ErrorKind::RateLimited,
            WardenError::Transient(_) => ErrorKind::Transient,
            WardenError::GenerationTimeout(_) => ErrorKind::GenerationTimeout,
            WardenError::NoCredential(_) => ErrorKind::NoCredential,
            WardenError::NoRepositorySelected(_) => ErrorKind::NoRepositorySelected,
            WardenError::InvalidEvent(_) => ErrorKind::InvalidEvent,
            WardenError::Rejected(_) => ErrorKind::Rejected,
        }
    }

    /// Whether the generic backoff loop may try the failed call again.
    ///
    /// `Unauthorized` is deliberately absent: it is handled by a single
    /// credential refresh, not by backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WardenError::Transient(_)
                | WardenError::RateLimited { .. }
                | WardenError::GenerationTimeout(_)
        )
    }

    /// The server's retry-after hint, if this is a rate-limit error that carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            WardenError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Failure classification recorded on failed jobs.
///
/// # Examples
///
/// ```
/// use warden_core::ErrorKind;
///
/// let kind = ErrorKind::NoRepositorySelected;
/// assert_eq!(kind.to_string(), "no_repository_selected");
/// assert_eq!(serde_json::to_string(&kind).unwrap(), "\"no_repository_selected\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    NotFound,
    RateLimited,
    Transient,
    GenerationTimeout,
    NoCredential,
    NoRepositorySelected,
    Internal,
    InvalidEvent,
    Rejected,
}

impl ErrorKind {
    /// Stable identifier used in storage and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::GenerationTimeout => "generation_timeout",
            ErrorKind::NoCredential => "no_credential",
            ErrorKind::NoRepositorySelected => "no_repository_selected",
            ErrorKind::Internal => "internal",
            ErrorKind::InvalidEvent => "invalid_event",
            ErrorKind::Rejected => "rejected",
        }
    }

    /// Inverse of [`ErrorKind::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "unauthorized" => ErrorKind::Unauthorized,
            "not_found" => ErrorKind::NotFound,
            "rate_limited" => ErrorKind::RateLimited,
            "transient" => ErrorKind::Transient,
            "generation_timeout" => ErrorKind::GenerationTimeout,
            "no_credential" => ErrorKind::NoCredential,
            "no_repository_selected" => ErrorKind::NoRepositorySelected,
            "internal" => ErrorKind::Internal,
            "invalid_event" => ErrorKind::InvalidEvent,
            "rejected" => ErrorKind::Rejected,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts_to_internal() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: WardenError = io_err.into();
        assert!(err.to_string().contains("gone"));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(WardenError::Transient("502".into()).is_retryable());
        assert!(WardenError::GenerationTimeout(Duration::from_secs(5)).is_retryable());
        assert!(WardenError::RateLimited {
            retry_after: None,
            message: "slow down".into()
        }
        .is_retryable());

        assert!(!WardenError::Unauthorized("bad token".into()).is_retryable());
        assert!(!WardenError::NotFound("closed".into()).is_retryable());
        assert!(!WardenError::NoCredential("alice".into()).is_retryable());
        assert!(!WardenError::Internal("ledger".into()).is_retryable());
        assert!(!WardenError::Rejected("422".into()).is_retryable());
    }

    #[test]
    fn retry_after_only_on_rate_limit() {
        let err = WardenError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
            message: "secondary rate limit".into(),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(WardenError::Transient("x".into()).retry_after(), None);
    }

    #[test]
    fn kind_string_roundtrips_through_parse() {
        for kind in [
            ErrorKind::Unauthorized,
            ErrorKind::NotFound,
            ErrorKind::RateLimited,
            ErrorKind::Transient,
            ErrorKind::GenerationTimeout,
            ErrorKind::NoCredential,
            ErrorKind::NoRepositorySelected,
            ErrorKind::Internal,
            ErrorKind::InvalidEvent,
            ErrorKind::Rejected,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("exploded"), None);
    }

    #[test]
    fn generation_timeout_displays_seconds() {
        let err = WardenError::GenerationTimeout(Duration::from_secs(60));
        assert_eq!(err.to_string(), "review generation timed out after 60s");
    }
}
