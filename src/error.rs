//! Error types for the chat server
//!
//! Defines application-level errors plus the framing and handshake errors
//! that end a single connection. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// user errors (reported back to the client as a system message).
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or oversized frame (fatal)
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Upgrade or HTTP request rejected (fatal)
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Peer stayed silent past the idle deadline (fatal)
    #[error("Idle timeout")]
    Timeout,

    /// Named room does not exist
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Client is not in any room
    #[error("Not in room")]
    NotInRoom,

    /// No connected client has the target username
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Command was missing an argument
    #[error("Usage: {0}")]
    Usage(&'static str),

    /// Slash command nobody knows
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Client asked to join the room it is already in
    #[error("Already in room: {0}")]
    AlreadyInRoom(String),

    /// Framed client sent a second login
    #[error("Already logged in")]
    AlreadyLoggedIn,
}

/// Binary frame read errors
///
/// Any of these ends the framed connection; there is no resynchronization.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Short read or socket failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Declared payload length exceeds the configured limit
    #[error("Frame too large: {len} bytes (max {max})")]
    TooLarge { len: u64, max: usize },
}

/// Upgrade / HTTP request errors
///
/// Each maps to a 4xx response before the connection is closed.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Socket failure while reading the request
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Request line or header not parseable
    #[error("Malformed request: {0}")]
    Malformed(&'static str),

    /// Request head exceeded the size limit
    #[error("Request head too large")]
    HeadTooLarge,

    /// Method other than GET
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// Required upgrade header absent or wrong
    #[error("Missing or invalid header: {0}")]
    MissingHeader(&'static str),

    /// Request head not complete before the handshake deadline
    #[error("Request timed out")]
    Timeout,
}

impl HandshakeError {
    /// HTTP status line for the rejection response
    pub fn status(&self) -> &'static str {
        match self {
            HandshakeError::MethodNotAllowed(_) => "405 Method Not Allowed",
            HandshakeError::HeadTooLarge => "431 Request Header Fields Too Large",
            HandshakeError::Timeout => "408 Request Timeout",
            _ => "400 Bad Request",
        }
    }
}
