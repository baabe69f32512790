//! Error variants surfaced over the control socket.

use thiserror::Error;

/// The two protocol-level failure kinds the control socket ever reports
/// back to a client; everything else (framing, EOF, partner hung up) is
/// handled at the connection layer and never reaches the client as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request body did not parse as a recognized request shape.
    BadRequest,
    /// The request parsed, but named a command we don't recognize.
    UnknownRequest,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::UnknownRequest => "UnknownRequest",
        }
    }
}

/// A request that failed to parse as valid JSON, or as one of the two
/// recognized request shapes (bare command string, or `[command, token,
/// ...]` array).
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct ProtocolError {
    pub message: String,
    pub request: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>, request: impl Into<String>) -> Self {
        Self { message: message.into(), request: request.into() }
    }
}
