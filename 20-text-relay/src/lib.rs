//! Line-oriented chat relay: one hub, many terminal clients.
//!
//! Each module has one job:
//!
//! - [`hub`] accepts TCP (and optionally WebSocket) sessions and drives one
//!   read loop per session.
//! - [`router`] interprets each inbound line and fans replies out through
//!   the [`registry`], which owns every live [`session`].
//! - [`protocol`] holds command parsing, nickname rules and the exact text
//!   of every server line.
//! - [`transport`] abstracts a connection into a source and a sink, with TCP,
//!   WebSocket and in-memory implementations.
//! - [`reconnect`] is the client's connection state machine; [`client`]
//!   puts a terminal in front of it.
//! - [`cli`], [`clock`] and [`error`] are the glue.

pub mod cli;
pub mod client;
pub mod clock;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;
