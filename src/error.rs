use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no view is connected to the command channel")]
    NotConnected,
    #[error("view did not reply within {0:?}")]
    RequestTimeout(Duration),
    #[error("unknown bridge function: {0}")]
    UnknownFunction(String),
    #[error("bridge function {function} failed: {source}")]
    Invocation {
        function: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid identity tag: {0:?}")]
    InvalidIdentity(String),
    #[error("{0}")]
    Precondition(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("view script failed: {0}")]
    Script(String),
    #[error("element {0} is no longer present in the document")]
    ElementMissing(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub(crate) fn malformed(err: impl std::fmt::Display) -> Self {
        Self::MalformedPayload(err.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
