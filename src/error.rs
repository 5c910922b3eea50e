//! Error types for the slsk-client library.

use std::io;
use std::string::FromUtf8Error;
use std::time::Duration;

use crate::waiter::WaitKey;

/// Result type alias for slsk-client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during protocol and network operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("UTF-8 decoding error: {0}")]
    Utf8(#[from] FromUtf8Error),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Buffer underflow: needed {needed} bytes, had {available}")]
    BufferUnderflow { needed: usize, available: usize },

    #[error("Invalid server code: {0}")]
    InvalidServerCode(u32),

    #[error("Invalid peer code: {0}")]
    InvalidPeerCode(u32),

    #[error("Invalid peer init code: {0}")]
    InvalidPeerInitCode(u8),

    #[error("Invalid distributed code: {0}")]
    InvalidDistributedCode(u8),

    #[error("Unknown solicitation token: {0}")]
    UnknownSolicitation(u32),

    #[error("Connection timed out")]
    ConnectionTimeout,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection inactive for {0:?}")]
    InactivityTimeout(Duration),

    #[error("Failed to connect to {username}: {reason}")]
    ConnectionFailed { username: String, reason: String },

    #[error("Login rejected: {reason}")]
    LoginFailed { reason: String },

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Timed out waiting for {0}")]
    WaitTimeout(WaitKey),

    #[error("A wait for {0} is already registered")]
    WaitKeyCollision(WaitKey),

    #[error("Operation canceled")]
    Canceled,

    #[error("Transfer rejected: {0}")]
    TransferRejected(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Invalid argument {name}: {constraint}")]
    InvalidArgument {
        name: &'static str,
        constraint: &'static str,
    },

    #[error("{0}")]
    DownloadEnqueue(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Invalid connection type: {0}")]
    InvalidConnectionType(String),

    #[error("Invalid user status: {0}")]
    InvalidUserStatus(u32),

    #[error("Invalid transfer direction: {0}")]
    InvalidTransferDirection(u32),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether this error indicates the remote side is unreachable or gone,
    /// as opposed to a local programming or protocol error.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectionTimeout
                | Error::ConnectionRefused
                | Error::ConnectionClosed
                | Error::InactivityTimeout(_)
                | Error::ConnectionFailed { .. }
        )
    }
}
