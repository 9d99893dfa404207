use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use crate::ast::PlanError;
use crate::config::ConfigError;
use crate::duplex::DuplexError;
use crate::eval::EvalError;
use crate::eval::security::SecurityViolation;
use crate::protocol::ProtocolError;
use crate::provider::ProviderError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Duplex error: {0}")]
    Duplex(#[from] DuplexError),
    #[error("Eval error: {0}")]
    Eval(#[from] EvalError),
    #[error("Security violation: {0}")]
    Security(#[from] SecurityViolation),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}

/// Classification of an error that crossed (or may cross) the session boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum RemoteErrorKind {
    /// A running pipeline or pushed stream faulted.
    Stream,
    /// A single duplex call could not be fulfilled.
    CallFailed,
    /// The plan was rejected by the security visitor.
    SecurityViolation,
    /// The pipeline faulted while it was being built or subscribed.
    Subscription,
    /// Any other server-side failure.
    Server,
    /// A send or receive on the transport failed.
    Transport,
    /// The session was cancelled.
    Cancelled,
    /// An error value raised by user code (`throw`) inside a plan.
    User,
}

/// Serializable error carried in protocol messages and termination records.
///
/// `detail` holds the rendered source chain of the original error and is
/// removed before security-sensitive errors leave the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RemoteError {
    pub fn new<S: Into<String>>(kind: RemoteErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn user<S: Into<String>>(message: S) -> Self {
        Self::new(RemoteErrorKind::User, message)
    }

    /// Builds a remote error from any local error, keeping its source chain as detail.
    pub fn from_error(kind: RemoteErrorKind, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(inner) = source {
            chain.push(inner.to_string());
            source = inner.source();
        }
        Self {
            kind,
            message: error.to_string(),
            detail: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\ncaused by: "))
            },
        }
    }

    pub fn with_detail<S: Into<String>>(mut self, detail: S) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn strip_detail(mut self) -> Self {
        self.detail = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("outer")]
    struct Outer(#[source] Inner);

    #[derive(Debug, Error)]
    #[error("inner")]
    struct Inner;

    #[test]
    fn test_from_error_keeps_source_chain() {
        let error = RemoteError::from_error(RemoteErrorKind::Server, &Outer(Inner));
        assert_eq!(error.message, "outer");
        assert_eq!(error.detail.as_deref(), Some("inner"));
        assert_eq!(error.clone().strip_detail().detail, None);
        assert_eq!(error.to_string(), "Server: outer");
    }
}
