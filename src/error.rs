//! Errors surfaced by the control surface.
//!
//! Collaborator contracts (video backends, detection adapters, sinks) report
//! failures with `anyhow::Error`; the kernel classifies them here at the
//! boundary where a caller needs to act on the difference.

/// Result alias for control operations.
pub type Result<T> = std::result::Result<T, PresenceError>;

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    /// The camera/stream could not be opened. Fatal for the current start attempt.
    #[error("source unavailable: {source_descriptor}: {reason}")]
    SourceUnavailable {
        source_descriptor: String,
        reason: String,
    },

    /// The detection model could not be loaded.
    #[error("model unavailable: {model}: {reason}")]
    ModelUnavailable { model: String, reason: String },

    /// A recognized parameter carried an unusable value.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    /// A background task panicked or could not be joined.
    #[error("task error: {0}")]
    Task(String),
}

impl PresenceError {
    pub fn source_unavailable(source: &str, reason: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            source_descriptor: source.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<rusqlite::Error> for PresenceError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PresenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for PresenceError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
