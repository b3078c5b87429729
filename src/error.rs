use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML decode error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("TOML decode error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("logging initialization error: {0}")]
    Telemetry(String),

    #[error("credential store unavailable: {0}")]
    CredentialStoreUnavailable(String),

    #[error("no credential for provider '{provider}' (scope '{scope}')")]
    CredentialNotFound { provider: String, scope: String },

    #[error("plan contains a dependency cycle: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step id '{0}' is declared more than once")]
    DuplicateStep(String),

    #[error(
        "step '{step}' references outputs of '{referenced}' which is not listed in its depends_on"
    )]
    UndeclaredReference { step: String, referenced: String },

    #[error("no adapter registered for provider '{provider}' (step '{step}')")]
    UnknownProvider { provider: String, step: String },

    #[error("provider '{provider}' does not support '{capability}' (step '{step}')")]
    UnsupportedCapability {
        provider: String,
        capability: String,
        step: String,
    },

    #[error("orchestration run already {0}; build a new orchestrator to run again")]
    AlreadyStarted(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Failure reported by a provider adapter for a single external call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("provider API error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    PermanentApi {
        status: Option<u16>,
        message: String,
    },
}

impl ProviderError {
    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderError::PermanentApi {
            status: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Auth(_) => ErrorKind::AuthError,
            ProviderError::RateLimit { .. } => ErrorKind::RateLimitError,
            ProviderError::TransientNetwork(_) => ErrorKind::TransientNetworkError,
            ProviderError::PermanentApi { .. } => ErrorKind::PermanentApiError,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Closed classification recorded on a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    AuthError,
    RateLimitError,
    TransientNetworkError,
    #[serde(rename = "PermanentAPIError")]
    PermanentApiError,
    TimeoutError,
    InvalidInputError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthError => "AuthError",
            ErrorKind::RateLimitError => "RateLimitError",
            ErrorKind::TransientNetworkError => "TransientNetworkError",
            ErrorKind::PermanentApiError => "PermanentAPIError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::InvalidInputError => "InvalidInputError",
            ErrorKind::InternalError => "InternalError",
        }
    }

    /// Only rate limiting and transient network failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimitError | ErrorKind::TransientNetworkError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limit_and_transient_are_retryable() {
        assert!(ErrorKind::RateLimitError.is_retryable());
        assert!(ErrorKind::TransientNetworkError.is_retryable());
        assert!(!ErrorKind::AuthError.is_retryable());
        assert!(!ErrorKind::PermanentApiError.is_retryable());
        assert!(!ErrorKind::TimeoutError.is_retryable());
        assert!(!ErrorKind::InvalidInputError.is_retryable());
    }

    #[test]
    fn provider_errors_map_to_kinds() {
        let err = ProviderError::RateLimit {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.kind(), ErrorKind::RateLimitError);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));

        let err = ProviderError::PermanentApi {
            status: Some(422),
            message: "name taken".into(),
        };
        assert_eq!(err.kind(), ErrorKind::PermanentApiError);
        assert_eq!(format!("{err}"), "provider API error (HTTP 422): name taken");
    }

    #[test]
    fn cycle_error_lists_path() {
        let err = OrchestratorError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(format!("{err}"), "plan contains a dependency cycle: a -> b -> a");
    }
}
