use serde::{Deserialize, Serialize};
use serde_json::Value;

/// # NDOC
/// component: `contracts`
/// purpose: Standard result alias for typed component boundaries.
pub type EngineResult<T> = Result<T, EngineError>;

/// # NDOC
/// component: `contracts`
/// purpose: Stable machine-readable error category.
/// invariants:
///   - Variants are part of the external status surface; changes require compatibility review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineErrorKind {
    ValidationError,
    AdmissionError,
    ConfigurationError,
    ProviderError,
    RateLimitError,
    TimeoutError,
    ResourceError,
    NavigationError,
    InteractionError,
    InternalError,
}

/// # NDOC
/// component: `contracts`
/// purpose: Canonical error payload used across all components.
/// invariants:
///   - `message` is user-safe.
///   - `retryable` indicates whether automated retry is acceptable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
    pub retryable: bool,
    pub details: Option<Value>,
}

impl EngineError {
    pub fn new(
        kind: EngineErrorKind,
        message: impl Into<String>,
        retryable: bool,
        details: Option<Value>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            details,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::ValidationError, message, false, None)
    }

    pub fn admission(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::AdmissionError, message, true, None)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::ConfigurationError, message, false, None)
    }

    pub fn provider(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(EngineErrorKind::ProviderError, message, retryable, None)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::RateLimitError, message, true, None)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::TimeoutError, message, true, None)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::ResourceError, message, false, None)
    }

    pub fn navigation(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::NavigationError, message, true, None)
    }

    pub fn interaction(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::InteractionError, message, true, None)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::InternalError, message, false, None)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        EngineError::internal(value.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        EngineError::validation(value.to_string())
    }
}
