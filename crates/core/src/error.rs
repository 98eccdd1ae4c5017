use serde::{Deserialize, Serialize};

/// Errors crossing the library boundary.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum WeirError {
    #[error("not_found: {resource} {name:?}")]
    NotFound { resource: String, name: String },
    /// Network or (de)serialization failure talking to the remote source.
    #[error("transport: {0}")]
    Transport(String),
    /// The requested resource version is gone; the caller must relist.
    #[error("expired: {0}")]
    Expired(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    /// The operation's cancellation token fired first, or the controller
    /// it targets was already stopped.
    #[error("cancelled")]
    Cancelled,
}

impl WeirError {
    pub fn not_found(resource: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into(), name: name.into() }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }
}

pub type WeirResult<T> = Result<T, WeirError>;

/// Failure reported by a handler.
///
/// Anything converted from `anyhow::Error` or [`WeirError`] is transient and
/// the key is retried with backoff. Terminal errors are logged and published to
/// the controller's error sink, never retried.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("transient: {0:#}")]
    Transient(anyhow::Error),
    #[error("terminal: {0:#}")]
    Terminal(anyhow::Error),
}

impl HandlerError {
    pub fn terminal(err: impl Into<anyhow::Error>) -> Self { Self::Terminal(err.into()) }

    pub fn is_terminal(&self) -> bool { matches!(self, Self::Terminal(_)) }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self { Self::Transient(e) }
}

impl From<WeirError> for HandlerError {
    fn from(e: WeirError) -> Self { Self::Transient(e.into()) }
}
