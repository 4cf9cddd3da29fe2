//! Frame transports.
//!
//! A connection is split into a [`FrameSource`] owned by the task that reads
//! it and a [`FrameSink`] shared by everyone that needs to write to it. The
//! hub and the client only ever see these two traits, so TCP, WebSocket and
//! in-memory connections are interchangeable.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::error::TransportError;

pub mod memory;
pub mod tcp;
pub mod ws;

/// Write half of a connection. Shared, so every method takes `&self`.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Sends one line. The line must not contain a trailing newline.
    async fn send(&self, line: &str) -> Result<(), TransportError>;

    /// Releases the connection. Later sends fail with [`TransportError::Closed`].
    async fn close(&self);
}

/// Read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound line, or `None` once the peer has closed cleanly.
    async fn receive(&mut self) -> Result<Option<String>, TransportError>;
}

pub type SharedSink = Arc<dyn FrameSink>;
pub type BoxedSource = Box<dyn FrameSource>;

/// Both halves of a freshly established connection.
pub struct Connection {
    pub source: BoxedSource,
    pub sink: SharedSink,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Client-side factory for connections, called once per (re)connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    fn endpoint(&self) -> String;

    async fn connect(&self) -> Result<Connection, TransportError>;
}

/// Where a client should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`, optionally written as `tcp://host:port`.
    Tcp(String),
    /// A full `ws://` or `wss://` URL.
    WebSocket(String),
}

impl Endpoint {
    pub fn connector(&self, write_timeout: Duration) -> Box<dyn Connector> {
        match self {
            Endpoint::Tcp(addr) => Box::new(tcp::TcpConnector::new(addr.clone(), write_timeout)),
            Endpoint::WebSocket(url) => Box::new(ws::WsConnector::new(url.clone(), write_timeout)),
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.starts_with("ws://") || raw.starts_with("wss://") {
            return Ok(Endpoint::WebSocket(raw.to_string()));
        }

        let addr = raw.strip_prefix("tcp://").unwrap_or(raw);
        if addr.is_empty() || !addr.contains(':') {
            return Err(format!(
                "expected host:port, tcp://host:port or ws://host:port/path, got '{raw}'"
            ));
        }
        Ok(Endpoint::Tcp(addr.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::WebSocket(url) => f.write_str(url),
        }
    }
}
