//! Error taxonomy for the bridge.
//!
//! A single enum covers every failure class the daemon distinguishes. The
//! classes matter operationally: `Timeout` and `Device` errors are returned to
//! the caller without touching the connection, while `Transport` and
//! `Protocol` errors force the owning commander through a reconnect because
//! the byte stream can no longer be trusted to be in sync.

use thiserror::Error;

/// Convenience alias for results using the bridge error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A command did not receive its response within the commander timeout.
    /// Transient; does not invalidate the connection.
    #[error("timeout")]
    Timeout,

    /// A query was issued against a commander that is not online.
    #[error("not connected")]
    NotConnected,

    /// The connection was torn down while the command was queued or in
    /// flight.
    #[error("disconnect requested")]
    Disconnected,

    /// Read/write/dial failure on the underlying byte stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or out-of-sync device response (wrong prefix, bad field
    /// count, undecodable payload).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A well-formed error reply from the instrument itself.
    #[error("device error: {0}")]
    Device(String),

    /// Invalid configuration; fatal at startup.
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// True for errors that mean the stream is unusable and the commander
    /// must drop the connection and reconnect.
    pub fn forces_reconnect(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Protocol(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            // Serial drivers surface expired read timeouts as TimedOut or
            // WouldBlock; both normalise to the shared timeout sentinel.
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Transport(err.to_string()),
        }
    }
}
