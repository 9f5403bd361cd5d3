//! Error types for the fragment pipeline.

use thiserror::Error;

/// Fatal errors raised before any fragment is processed.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration value for {key}: {message}")]
    Configuration { key: String, message: String },
}

impl PipelineError {
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Coarse failure class of a rewrite call; the retry policy only looks at this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimit,
    Connection,
    Auth,
    Unknown,
    EmptyResponse,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Connection => "connection",
            ErrorClass::Auth => "auth",
            ErrorClass::Unknown => "unknown",
            ErrorClass::EmptyResponse => "empty_response",
        }
    }
}

/// Fragment-scoped failure of the external rewrite operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("provider error: {0}")]
    Unknown(String),

    #[error("empty response from rewrite backend")]
    EmptyResponse,
}

impl RewriteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RewriteError::RateLimit(_) => ErrorClass::RateLimit,
            RewriteError::Connection(_) => ErrorClass::Connection,
            RewriteError::Auth(_) => ErrorClass::Auth,
            RewriteError::Unknown(_) => ErrorClass::Unknown,
            RewriteError::EmptyResponse => ErrorClass::EmptyResponse,
        }
    }

    /// `Auth` and `Unknown` end the attempt loop immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::RateLimit | ErrorClass::Connection | ErrorClass::EmptyResponse
        )
    }

    pub fn message(&self) -> &str {
        match self {
            RewriteError::RateLimit(m)
            | RewriteError::Connection(m)
            | RewriteError::Auth(m)
            | RewriteError::Unknown(m) => m,
            RewriteError::EmptyResponse => "",
        }
    }
}
