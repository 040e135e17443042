//! Contains the `Error` and `Result` types that `ferrodb` uses.

use std::{collections::HashSet, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

const RECOVERING_CODES: &[i32] = &[11600, 11602, 13436, 189, 91];
const NOT_PRIMARY_CODES: &[i32] = &[10107, 13435];
const RETRYABLE_READ_CODES: &[i32] = &[11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001];

/// The label attached to server and network errors that are safe to retry a
/// write for.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// The label attached to server and network errors that are safe to retry a
/// read for.
pub const RETRYABLE_READ_ERROR: &str = "RetryableReadError";

/// The label a server attaches to a failure that is known to have performed
/// no writes.
pub const NO_WRITES_PERFORMED: &str = "NoWritesPerformed";

/// The server error code returned by legacy MMAPv1-backed deployments when a
/// retryable write is attempted against them.
pub(crate) const MMAPV1_RETRY_WRITES_ERROR_CODE: i32 = 20;

pub(crate) const RETRYABLE_WRITES_UNSUPPORTED_MESSAGE: &str =
    "This FerroDB deployment does not support retryable writes. Please set retry_writes to false \
     in your client options.";

/// The result type for all methods that can return an error in the `ferrodb`
/// crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `ferrodb` crate. The inner [`ErrorKind`] is
/// boxed to keep the type cheap to move through deep `Result` chains.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels.map(|ls| ls.into_iter().collect()).unwrap_or_default(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
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

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// Returns a copy of this error with the specified label added.
    pub(crate) fn with_label<T: AsRef<str>>(mut self, label: T) -> Self {
        self.labels.insert(label.as_ref().to_string());
        self
    }

    /// Whether this error is a transport-level failure.
    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    /// Whether this error originated from the server.
    pub(crate) fn is_server_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(..))
    }

    /// Whether the retry decision table applies to this error at all. Errors
    /// that are neither server nor network failures (argument errors, invariant
    /// violations, serialization failures) are never retried.
    pub(crate) fn is_retry_classifiable(&self) -> bool {
        self.is_server_error() || self.is_network_error()
    }

    /// Gets the server error code from this error, if applicable.
    pub(crate) fn code(&self) -> Option<i32> {
        self.code_and_message().map(|(code, _)| code)
    }

    pub(crate) fn code_and_message(&self) -> Option<(i32, &str)> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref cmd_err) => Some((cmd_err.code, cmd_err.message.as_str())),
            _ => None,
        }
    }

    /// Whether a read operation should be retried if this error occurs.
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        if self.contains_label(RETRYABLE_READ_ERROR) {
            return true;
        }
        match self.code_and_message() {
            Some((code, message)) => {
                RETRYABLE_READ_CODES.contains(&code)
                    || is_not_primary(code, message)
                    || is_recovering(code, message)
            }
            None => false,
        }
    }

    /// Whether a write operation should be retried if this error occurs.
    pub(crate) fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether a `RetryableWriteError` label should be added to this error. On
    /// 4.4+ servers the server itself attaches the label, so only network
    /// errors qualify; on older servers the recognized code list also counts.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        const RETRYABLE_WRITE_CODES: &[i32] =
            &[11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262];

        if max_wire_version > 8 {
            return self.is_network_error();
        }
        if self.is_network_error() {
            return true;
        }
        match self.code_and_message() {
            Some((code, _)) => RETRYABLE_WRITE_CODES.contains(&code),
            None => false,
        }
    }

    /// Rewrites a legacy storage-engine failure into the fixed user-facing
    /// message, preserving the original code and labels.
    pub(crate) fn rewrite_for_mmapv1(self) -> Self {
        let code_name = match self.kind.as_ref() {
            ErrorKind::Command(ref err) => err.code_name.clone(),
            _ => String::new(),
        };
        Error {
            kind: Box::new(ErrorKind::Command(CommandError {
                code: MMAPV1_RETRY_WRITES_ERROR_CODE,
                code_name,
                message: RETRYABLE_WRITES_UNSUPPORTED_MESSAGE.to_string(),
            })),
            labels: self.labels,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self {
            kind: Box::new(err.into()),
            labels: Default::default(),
        }
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(Arc<crate::bson::de::Error>),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(Arc<crate::bson::ser::Error>),

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// The connection pool for a server was cleared during operation
    /// execution due to a concurrent error, causing the operation to fail.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// The server does not support a feature the operation requires.
    #[error("The server does not support a database feature: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// An internal invariant of the driver was violated.
    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("{0}")]
    Io(Arc<std::io::Error>),

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// A required collaborator was not provided.
    #[error("A required dependency was not provided: {message}")]
    #[non_exhaustive]
    MissingDependency { message: String },

    /// The operation was cancelled before it could complete.
    #[error("The operation was cancelled: {message}")]
    #[non_exhaustive]
    Cancelled { message: String },

    /// The client was not able to select a server for the operation.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// A session was used incorrectly.
    #[error("{message}")]
    #[non_exhaustive]
    Session { message: String },

    /// A transaction-state precondition was violated.
    #[error("{message}")]
    #[non_exhaustive]
    Transaction { message: String },
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<crate::bson::de::Error> for ErrorKind {
    fn from(err: crate::bson::de::Error) -> Self {
        Self::BsonDeserialization(Arc::new(err))
    }
}

impl From<crate::bson::ser::Error> for ErrorKind {
    fn from(err: crate::bson::ser::Error) -> Self {
        Self::BsonSerialization(Arc::new(err))
    }
}

fn is_not_primary(code: i32, message: &str) -> bool {
    if NOT_PRIMARY_CODES.contains(&code) {
        return true;
    } else if is_recovering(code, message) {
        return false;
    }
    message.contains("not primary")
}

fn is_recovering(code: i32, message: &str) -> bool {
    if RECOVERING_CODES.contains(&code) {
        return true;
    }
    message.contains("not primary or secondary") || message.contains("node is recovering")
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg")]
    pub message: String,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "({}): {}", self.code_name, self.message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn command_error(code: i32, message: &str) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: message.to_string(),
        })
        .into()
    }

    #[test]
    fn labels_are_deduplicated() {
        let err = command_error(91, "shutting down")
            .with_label(RETRYABLE_WRITE_ERROR)
            .with_label(RETRYABLE_WRITE_ERROR);
        assert_eq!(err.labels().len(), 1);
        assert!(err.contains_label(RETRYABLE_WRITE_ERROR));
        assert!(err.is_write_retryable());
    }

    #[test]
    fn read_retryability_by_code_and_message() {
        assert!(command_error(11600, "").is_read_retryable());
        assert!(command_error(1, "node is recovering").is_read_retryable());
        assert!(command_error(1, "not primary").is_read_retryable());
        assert!(!command_error(1, "boring failure").is_read_retryable());
        assert!(!Error::invalid_argument("nope").is_read_retryable());
    }

    #[test]
    fn network_errors_are_read_retryable() {
        let err: Error = ErrorKind::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))
        .into();
        assert!(err.is_read_retryable());
        assert!(err.is_retry_classifiable());
    }

    #[test]
    fn pool_cleared_errors_count_as_network_errors() {
        let err = Error::new(
            ErrorKind::ConnectionPoolCleared {
                message: "pool for example.com:27017 cleared".to_string(),
            },
            Some([RETRYABLE_WRITE_ERROR.to_string()]),
        );
        assert!(err.is_network_error());
        assert!(err.is_read_retryable());
        assert!(err.is_write_retryable());
    }

    #[test]
    fn mmapv1_rewrite_preserves_code_and_labels() {
        let err = command_error(MMAPV1_RETRY_WRITES_ERROR_CODE, "Transaction numbers are only...")
            .with_label(NO_WRITES_PERFORMED);
        let rewritten = err.rewrite_for_mmapv1();
        assert_eq!(rewritten.code(), Some(MMAPV1_RETRY_WRITES_ERROR_CODE));
        assert!(rewritten.contains_label(NO_WRITES_PERFORMED));
        assert_eq!(
            rewritten.code_and_message().unwrap().1,
            RETRYABLE_WRITES_UNSUPPORTED_MESSAGE
        );
    }
}
