use serde_derive::{Deserialize, Serialize};

/// A meshdb error. Errors are serializable, since the leader returns them
/// across the wire to nodes that escalated commands to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was canceled by shutdown or loss of the current role.
    Canceled,
    /// A local store write conflict. Replication retries these internally.
    Conflict,
    /// A peer refused a role change or transaction.
    Denied(String),
    /// Commit content diverged from the cluster. Fatal for the current role:
    /// the node falls back to SEARCHING and reconnects to all peers.
    HashMismatch(String),
    /// An invalid query or request payload.
    InvalidInput(String),
    /// An operation that the current node state does not permit.
    InvalidState(String),
    /// An I/O error. Transient: connections recover with backoff.
    IO(String),
    /// A deadline elapsed while waiting on the cluster.
    Timeout(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Canceled => write!(f, "operation canceled"),
            Error::Conflict => write!(f, "store write conflict"),
            Error::Denied(msg) => write!(f, "denied: {msg}"),
            Error::HashMismatch(msg) => write!(f, "hash mismatch: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Timeout(msg) => write!(f, "timeout: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidState error as an Err result.
#[macro_export]
macro_rules! invalid_state {
    ($($args:tt)*) => {
        Err($crate::error::Error::InvalidState(format!($($args)*)))
    };
}

/// Constructs an Error::InvalidInput error as an Err result.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => {
        Err($crate::error::Error::InvalidInput(format!($($args)*)))
    };
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidState(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::Canceled
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(_: crossbeam::channel::RecvError) -> Self {
        Error::Canceled
    }
}

/// A meshdb result.
pub type Result<T> = std::result::Result<T, Error>;
