use std::{error::Error as StdError, fmt, io};

use strum_macros::{Display, EnumIter, EnumString};

/// The kind of an [`Error`].
///
/// Kinds follow the failure classes of a call: transport, pool, protocol,
/// routing and application failures are kept apart so callers can decide
/// whether a new pick is worth a retry.
#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, Hash, EnumIter, EnumString)]
pub enum ErrorKind {
    /// connect/read/write failure of the underlying stream.
    Network,
    /// the connection pool is at capacity and the caller may not wait.
    PoolExhausted,
    /// malformed frame or length mismatch.
    Protocol,
    /// a header field can not be put on the wire.
    Encode,
    Serialize,
    Compress,
    NoConnectionAvailable,
    ServiceNotFound,
    MethodNotFound,
    /// error returned by the remote handler.
    Server,
    Timeout,
    Canceled,
    Oneway,
    Registry,
    Config,
    Client,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, err: E) -> Error
    where
        E: ToString,
    {
        Error {
            kind,
            msg: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Transport and protocol failures leave the connection in an unknown
    /// state; it must not go back to the pool.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Network | ErrorKind::Protocol | ErrorKind::Timeout | ErrorKind::Canceled
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.msg)
        }
    }
}

impl StdError for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            msg: String::new(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => ErrorKind::Protocol,
            _ => ErrorKind::Network,
        };
        Error::new(kind, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Serialize, err)
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::new(ErrorKind::Serialize, err)
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::new(ErrorKind::Serialize, err)
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::new(ErrorKind::Other, msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::new(ErrorKind::Other, msg)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err: Error = ErrorKind::NoConnectionAvailable.into();
        assert_eq!("NoConnectionAvailable", err.to_string());

        let err = Error::new(ErrorKind::ServiceNotFound, "ghost-service");
        assert_eq!("ServiceNotFound: ghost-service", err.to_string());
        assert_eq!(ErrorKind::ServiceNotFound, err.kind());
    }

    #[test]
    fn io_errors_are_classified() {
        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert_eq!(ErrorKind::Protocol, err.kind());
        assert!(err.is_connection_fatal());

        let err: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(ErrorKind::Network, err.kind());
    }

    #[test]
    fn kind_from_str() {
        let kind: ErrorKind = "PoolExhausted".parse().unwrap();
        assert_eq!(ErrorKind::PoolExhausted, kind);
    }
}
