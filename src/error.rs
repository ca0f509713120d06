//! Contains the `Error` and `Result` types that `mongowire` uses.

use std::sync::Arc;

use thiserror::Error;

use crate::{bson::Document, options::ServerAddress};

/// The result type for all methods that can return an error in `mongowire`.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while sending a request or tracking a deployment.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Arc<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    pub(crate) fn connection_lost(message: impl Into<String>) -> Self {
        ErrorKind::ConnectionLost {
            message: message.into(),
            source: None,
        }
        .into()
    }

    pub(crate) fn connection_lost_caused_by(
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        ErrorKind::ConnectionLost {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
        .into()
    }

    pub(crate) fn framing(message: impl Into<String>) -> Self {
        ErrorKind::Framing {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn reply_validation(message: impl Into<String>) -> Self {
        ErrorKind::ReplyValidation {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn no_suitable_server(message: impl Into<String>) -> Self {
        ErrorKind::NoSuitableServer {
            message: message.into(),
        }
        .into()
    }

    /// Whether the session that produced this error is no longer usable. The
    /// dispatcher consults this when deciding to retry on the next candidate.
    pub fn is_network_error(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::ConnectionLost { .. } | ErrorKind::ConnectionNotAvailable { .. }
        )
    }

    /// Whether the dispatcher may transparently retry the operation once.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::ConnectionLost { .. }
                | ErrorKind::ConnectionNotAvailable { .. }
                | ErrorKind::ShardConfigStale { .. }
        )
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self::new(err.into())
    }
}

impl std::ops::Deref for Error {
    type Target = ErrorKind;

    fn deref(&self) -> &Self::Target {
        &self.kind
    }
}

/// The types of errors that can occur.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The socket broke while an operation was in flight.
    #[error("connection to {message} lost")]
    ConnectionLost {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    /// A send was attempted on a session that is not open.
    #[error("connection to {address} is not available")]
    ConnectionNotAvailable { address: ServerAddress },

    /// The session or dispatcher is draining and no longer accepts requests.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// No candidate server satisfied the read preference, even after
    /// attempting reconnection.
    #[error("no suitable server: {message}")]
    NoSuitableServer { message: String },

    /// A primary-required operation was issued while no primary exists.
    #[error("no primary available in the replica set")]
    NoPrimary,

    /// The server reported a duplicate unique-index key.
    #[error("duplicate key: {message}")]
    DuplicateKey { code: i32, message: String },

    /// A GET_MORE referenced a cursor the server no longer knows.
    #[error("cursor {cursor_id} not found")]
    CursorNotFound { cursor_id: i64 },

    /// The server flagged the reply as a query failure; details are carried
    /// in the first reply document.
    #[error("query failed: {message}")]
    QueryFailure { message: String, document: Document },

    /// The mongos router requires a configuration refresh.
    #[error("shard configuration stale")]
    ShardConfigStale { document: Document },

    /// A command reply did not have the expected shape.
    #[error("invalid reply: {message}")]
    ReplyValidation { message: String },

    /// The per-operation deadline elapsed before a reply arrived.
    #[error("operation timed out")]
    OperationTimedOut,

    /// The caller cancelled the operation before a reply arrived.
    #[error("operation cancelled")]
    Cancelled,

    /// Incoming bytes could not be decoded as a wire message or document.
    #[error("malformed message: {message}")]
    Framing { message: String },

    /// An invalid argument was provided, e.g. a bad connection string.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An I/O error occurred outside of an established session.
    #[error("I/O error: {0}")]
    Io(#[from] Arc<std::io::Error>),
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn network_errors_are_retryable() {
        let err = Error::connection_lost("localhost:27017");
        assert!(err.is_network_error());
        assert!(err.is_retryable());

        let err: Error = ErrorKind::OperationTimedOut.into();
        assert!(!err.is_network_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn io_errors_keep_their_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io.into();
        assert!(matches!(*err.kind, ErrorKind::Io(_)));
        assert!(std::error::Error::source(&*err.kind).is_some());
    }
}
