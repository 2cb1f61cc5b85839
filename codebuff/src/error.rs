//! Error types for the codebuff runtime.
//!
//! Tool-level failures are deliberately **not** errors: they are converted
//! into `{errorMessage}` result parts by the executor and folded back into
//! the conversation. [`Error`] is reserved for the failures that abort a
//! run or a request: sandbox faults, transport faults, invalid sessions,
//! model-call failures, and cancellation.

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid engine or server configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Incoming session state or prompt payload failed validation.
    #[error("session validation error: {0}")]
    Session(String),

    /// Failure inside the JS sandbox hosting `handleSteps` source.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Wire-protocol send/receive failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Failure from the injected LLM provider.
    #[error("model error: {0}")]
    Model(String),

    /// JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The run was cancelled by the user.
    #[error("Run cancelled by user")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a new session validation error.
    #[must_use]
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }

    /// Create a new sandbox error.
    #[must_use]
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox(message.into())
    }

    /// Create a new transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new model error.
    #[must_use]
    pub fn model(message: impl Into<String>) -> Self {
        Self::Model(message.into())
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` if this error was caused by user cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::sandbox("stack overflow");
        assert_eq!(err.to_string(), "sandbox error: stack overflow");

        let err = Error::Cancelled;
        assert_eq!(err.to_string(), "Run cancelled by user");
        assert!(err.is_cancelled());
    }

    #[test]
    fn json_errors_convert() {
        let json_err = serde_json::from_str::<serde_json::Value>("nope").expect_err("invalid");
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
