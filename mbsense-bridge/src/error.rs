//! Error taxonomy of the polling engine.

use std::time::Duration;

use thiserror::Error;
use tokio_modbus::ExceptionCode;

/// Engine errors.
///
/// `Parse` and `Lookup` are raised while building units from configuration
/// and abort that unit's setup. The remaining variants are runtime failures
/// reported to the caller of a sensor or admin verb.
#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("I/O error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        /// The link is unusable and must be reopened.
        fatal: bool,
    },

    #[error("device exception: {0:?}")]
    Exception(ExceptionCode),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("format error: {0}")]
    Format(String),

    #[error("lookup error: {0}")]
    Lookup(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Common(#[from] mbsense_common::Error),
}

impl Error {
    /// Wrap an I/O error from the link, classifying whether it requires a
    /// reconnect.
    ///
    /// A peer that closed or reset the socket surfaces under many kinds
    /// depending on the platform, so every transport error counts as fatal
    /// except the request-level ones: timeouts, interruptions and a garbled
    /// frame.
    pub fn io(source: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let fatal = !matches!(source.kind(), TimedOut | WouldBlock | Interrupted | InvalidData);
        Error::Io { source, fatal }
    }

    /// True when the failure means the link has to be reopened.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io { fatal: true, .. })
    }

    /// Short machine-readable tag, used in replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Parse(_) => "parse",
            Error::Connection(_) => "connection",
            Error::Io { .. } => "io",
            Error::Exception(_) => "exception",
            Error::Timeout(_) => "timeout",
            Error::Format(_) => "format",
            Error::Lookup(_) => "lookup",
            Error::Unsupported(_) => "unsupported",
            Error::NotConnected(_) => "not-connected",
            Error::Config(_) => "config",
            Error::Common(_) => "internal",
        }
    }
}

impl From<tokio_modbus::Error> for Error {
    fn from(e: tokio_modbus::Error) -> Self {
        match e {
            tokio_modbus::Error::Transport(io) => Error::io(io),
            other => Error::Connection(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
