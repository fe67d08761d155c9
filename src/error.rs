//! Contains the `Error` and `Result` types used throughout this crate.

use std::{collections::HashSet, fmt, sync::Arc};

use thiserror::Error;

use crate::sdam::ServerAddress;

// Error codes per the MongoDB SDAM and retryable reads/writes specs.
const NOT_MASTER_CODES: [i32; 3] = [10107, 13435, 10058];
const NODE_IS_RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const SHUTDOWN_CODES: [i32; 2] = [11600, 91];
const RETRYABLE_READ_CODES: [i32; 13] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 134, 262,
];
const RETRYABLE_WRITE_CODES: [i32; 12] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262,
];

/// Label attached to a write error when it is eligible for the dispatcher's single automatic
/// retry.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Label attached to errors raised inside an active transaction that may be safely retried as a
/// whole.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Label attached when it is unknown whether a transaction commit was applied.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by the dispatcher, a monitor, the session pool, or a [`crate::Link`].
///
/// The inner [`ErrorKind`] is wrapped in an `Arc` so that `Error` can be cloned cheaply, which is
/// needed since the same error is often recorded both in a [`crate::sdam::ServerDescription`] and
/// returned to the caller.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    pub kind: Arc<ErrorKind>,
    labels: HashSet<String>,
    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        Self {
            kind: Arc::new(kind),
            labels: labels.map(|l| l.into_iter().collect()).unwrap_or_default(),
            source: None,
        }
    }

    pub(crate) fn with_source(mut self, source: Error) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        ErrorKind::Configuration {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn server_selection_timeout(message: impl Into<String>) -> Self {
        ErrorKind::ServerSelectionTimeout {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn pool_cleared(address: &ServerAddress, cause: &Error) -> Self {
        ErrorKind::ConnectionPoolCleared {
            message: format!("connection pool for {address} cleared because: {cause}"),
        }
        .into()
    }

    /// The labels attached to this error (e.g. [`RETRYABLE_WRITE_ERROR`]).
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error carries the given label.
    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub(crate) fn add_label(&mut self, label: impl Into<String>) {
        self.labels.insert(label.into());
    }

    /// The server error code for this error, if it originated from a command reply. Network and
    /// local errors have no code.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(c) => Some(c.code),
            ErrorKind::WriteConcern(c) => Some(c.code),
            _ => None,
        }
        .or_else(|| self.source.as_ref().and_then(|s| s.code()))
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Network(_) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Network(io) if io.kind() == std::io::ErrorKind::TimedOut)
    }

    /// Whether this error should invalidate the topology's view of the server it came from, per
    /// the SDAM spec: network errors and "not master"/"node is recovering" command errors.
    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_network_error() || self.is_not_master() || self.is_node_is_recovering()
    }

    pub(crate) fn is_not_master(&self) -> bool {
        self.code().map(|c| NOT_MASTER_CODES.contains(&c)).unwrap_or(false)
    }

    pub(crate) fn is_node_is_recovering(&self) -> bool {
        self.code()
            .map(|c| NODE_IS_RECOVERING_CODES.contains(&c))
            .unwrap_or(false)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.code().map(|c| SHUTDOWN_CODES.contains(&c)).unwrap_or(false)
    }

    /// Whether a read operation is eligible for retry because of this error (spec §4.4.2).
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        self.code().map(|c| RETRYABLE_READ_CODES.contains(&c)).unwrap_or(false)
    }

    /// Whether a write's first-attempt error reports itself as retryable (spec §4.4.1 step 4),
    /// i.e. whether it should carry [`RETRYABLE_WRITE_ERROR`].
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if max_wire_version > 8 {
            return self.is_network_error();
        }
        if self.is_network_error() {
            return true;
        }
        self.code().map(|c| RETRYABLE_WRITE_CODES.contains(&c)).unwrap_or(false)
    }

    pub(crate) fn is_retryable_write(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    pub(crate) fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelectionTimeout { .. })
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Network(Arc::new(err))
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        ErrorKind::BsonDeserialization(Arc::new(err))
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        ErrorKind::BsonSerialization(Arc::new(err))
    }
}

/// The different kinds of errors this crate can surface. New variants may be added in a
/// non-breaking release, so callers should not exhaustively match this enum.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A caller passed an invalid argument: bad namespace, conflicting options, etc.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An option combination the deployment cannot satisfy (e.g. `maxStalenessSeconds` too small,
    /// or sessions requested against a deployment that doesn't advertise
    /// `logicalSessionTimeoutMinutes`).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Socket-level failure talking to a server. May be retryable; see
    /// [`Error::is_network_error`].
    #[error("network error: {0}")]
    Network(Arc<std::io::Error>),

    /// The connection pool for a server was cleared mid-operation because a concurrent operation
    /// failed against it.
    #[error("{message}")]
    ConnectionPoolCleared { message: String },

    /// The server replied with a "not master"/"node is recovering" family error. Always
    /// invalidates the originating [`crate::sdam::ServerDescription`].
    #[error("server reported a state change: {0}")]
    Command(CommandError),

    /// A write concern could not be satisfied. The write itself was applied.
    #[error("write concern error: {0}")]
    WriteConcern(CommandError),

    /// No server matching the read preference/selector was found within
    /// `serverSelectionTimeoutMillis`.
    #[error("server selection timeout: {message}")]
    ServerSelectionTimeout { message: String },

    /// `maxTimeMS` elapsed on the server before the command completed.
    #[error("operation exceeded its maxTimeMS")]
    ExecutionTimeout,

    /// An error occurred during handshake/authentication against a [`crate::Link`].
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// The deployment does not support sessions.
    #[error("attempted to start a session on a deployment that does not support sessions")]
    SessionsNotSupported,

    /// An error occurred while managing a transaction.
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// Wrapper around a BSON deserialization failure from the codec boundary.
    #[error("{0}")]
    BsonDeserialization(Arc<bson::de::Error>),

    /// Wrapper around a BSON serialization failure from the codec boundary.
    #[error("{0}")]
    BsonSerialization(Arc<bson::ser::Error>),

    /// An internal invariant was violated; indicates a bug in this crate.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// The dispatcher was used after the owning client was shut down.
    #[error("client has been shut down")]
    Shutdown,
}

/// A command-failure reply from the server, shared by ordinary command errors and write concern
/// errors.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
    pub code: i32,
    #[serde(default)]
    pub code_name: String,
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}: {}", self.code, self.code_name, self.message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn command_error(code: i32) -> Error {
        Error::new(
            ErrorKind::Command(CommandError {
                code,
                code_name: String::new(),
                message: "not master".into(),
            }),
            None::<Option<String>>,
        )
    }

    fn network_error() -> Error {
        Error::new(
            ErrorKind::Network(Arc::new(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))),
            None::<Option<String>>,
        )
    }

    #[test]
    fn not_master_code_is_a_state_change_error() {
        let err = command_error(10107);
        assert!(err.is_not_master());
        assert!(err.is_state_change_error());
    }

    #[test]
    fn network_errors_are_always_state_change_and_retryable() {
        let err = network_error();
        assert!(err.is_state_change_error());
        assert!(err.is_read_retryable());
        assert!(err.should_add_retryable_write_label(6));
        assert!(err.should_add_retryable_write_label(9));
    }

    #[test]
    fn post_4_2_servers_only_trust_the_network_error_check_not_the_code_table() {
        // max_wire_version 9 corresponds to a server new enough to attach its own
        // RetryableWriteError label; a bare not-master code must not be second-guessed via the
        // older code table.
        let err = command_error(10107);
        assert!(!err.should_add_retryable_write_label(9));
    }

    #[test]
    fn pre_4_2_servers_fall_back_to_the_retryable_write_code_table() {
        let err = command_error(10107);
        assert!(err.should_add_retryable_write_label(6));

        let unretryable = command_error(121);
        assert!(!unretryable.should_add_retryable_write_label(6));
    }

    #[test]
    fn code_134_is_retryable_for_reads_but_not_writes() {
        let err = command_error(134);
        assert!(err.is_read_retryable());
        assert!(!err.should_add_retryable_write_label(6));
    }

    #[test]
    fn contains_label_reflects_labels_added_after_construction() {
        let mut err = command_error(10107);
        assert!(!err.contains_label(RETRYABLE_WRITE_ERROR));
        err.add_label(RETRYABLE_WRITE_ERROR);
        assert!(err.contains_label(RETRYABLE_WRITE_ERROR));
        assert!(err.is_retryable_write());
    }
}
