use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// brindex errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// An I/O failure reported by the backing store.
    Backend(String),
    /// A malformed dropping file or index stream, typically a size that is
    /// not a whole multiple of the record size, a truncated stream, or a
    /// chunk id pointing outside the chunk table.
    Format(String),
    /// An operation invoked in a mode that forbids it, e.g. adding a write
    /// record to a read-only index. These are programming errors.
    State(String),
    /// An operation outside the current contract (optimize, getattr-size).
    Unsupported(String),
    /// A path that does not exist on the backing store. Scans treat a
    /// missing meta directory as empty rather than surfacing this.
    NotFound(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Backend(msg) => write!(f, "backend error: {msg}"),
            Error::Format(msg) => write!(f, "format error: {msg}"),
            Error::State(msg) => write!(f, "invalid state: {msg}"),
            Error::Unsupported(msg) => write!(f, "unsupported operation: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

/// Constructs an Error::Format for the given format string.
#[macro_export]
macro_rules! errfmt {
    ($($args:tt)*) => { $crate::error::Error::Format(format!($($args)*)) };
}

/// Constructs an Error::State for the given format string.
#[macro_export]
macro_rules! errstate {
    ($($args:tt)*) => { $crate::error::Error::State(format!($($args)*)) };
}

/// A brindex Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            _ => Error::Backend(err.to_string()),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::State(err.to_string())
    }
}
