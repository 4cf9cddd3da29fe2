//! Error taxonomy shared by the hub and the client.
//!
//! Transport failures end a session (hub) or trigger a reconnect (client).
//! Everything else is recoverable and turns into a plain text reply.

use std::{io, time::Duration};

use thiserror::Error;

use crate::session::SessionId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("line exceeds {0} bytes")]
    FrameTooLong(usize),
}

/// A malformed command. Always answered with a reply, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid username")]
    InvalidNickname,

    #[error("Usage: /pm <username> <message>")]
    MalformedPrivateMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Username '{0}' is already taken")]
    NicknameTaken(String),

    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),

    #[error("User '{0}' not found")]
    NotFound(String),

    #[error("session {0} is not registered")]
    UnknownSession(SessionId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("outbound queue is full")]
    Backlogged,

    #[error("client has shut down")]
    Closed,
}
