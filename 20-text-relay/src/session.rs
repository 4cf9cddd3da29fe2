use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::transport::SharedSink;

/// Identifies one connection for its whole lifetime. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out increasing session ids.
#[derive(Debug)]
pub struct SessionIds {
    next: AtomicU64,
}

impl SessionIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// One connected participant as tracked by the registry.
///
/// The nickname starts empty and only changes through the registry, so
/// readers holding a registry lock never see a half-applied rename.
pub struct Session {
    pub id: SessionId,
    pub endpoint: String,
    pub nickname: String,
    pub sink: SharedSink,
}

impl Session {
    pub fn new(id: SessionId, endpoint: impl Into<String>, sink: SharedSink) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            nickname: String::new(),
            sink,
        }
    }

    pub fn has_nickname(&self) -> bool {
        !self.nickname.is_empty()
    }

    /// A lock-free copy of what delivery code needs.
    pub fn peer(&self) -> Peer {
        Peer {
            id: self.id,
            nickname: self.nickname.clone(),
            sink: Arc::clone(&self.sink),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("nickname", &self.nickname)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a session taken under the registry lock and used after it
/// has been released.
#[derive(Clone)]
pub struct Peer {
    pub id: SessionId,
    pub nickname: String,
    pub sink: SharedSink,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("nickname", &self.nickname)
            .finish_non_exhaustive()
    }
}
