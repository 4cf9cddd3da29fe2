//! The hub's table of live sessions.
//!
//! All access goes through one readers-writer lock. Writers are `add`,
//! `remove`, `rename` and `drain`; everything else takes the read lock just
//! long enough to copy out what it needs. No method touches a transport, so
//! a slow peer can never hold the lock hostage.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    error::RegistryError,
    session::{Peer, Session, SessionId},
};

#[derive(Debug, Default)]
pub struct Registry {
    // Ordered by id, which is join order.
    sessions: RwLock<BTreeMap<SessionId, Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, session: Session) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(RegistryError::DuplicateSession(session.id));
        }
        debug!(session = %session.id, endpoint = %session.endpoint, "session registered");
        sessions.insert(session.id, session);
        Ok(())
    }

    /// Removes a session, handing it back to the one caller that got there
    /// first. Later calls for the same id return `None`.
    pub async fn remove(&self, id: SessionId) -> Option<Session> {
        self.sessions.write().await.remove(&id)
    }

    /// Sets a session's nickname and returns the previous one.
    ///
    /// Fails without changing anything if another live session already uses
    /// `nickname` (exact, case-sensitive match). Renaming a session to the
    /// nickname it already holds succeeds.
    pub async fn rename(&self, id: SessionId, nickname: &str) -> Result<String, RegistryError> {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(&id) {
            return Err(RegistryError::UnknownSession(id));
        }
        let taken = sessions
            .values()
            .any(|session| session.id != id && session.nickname == nickname);
        if taken {
            return Err(RegistryError::NicknameTaken(nickname.to_string()));
        }

        let session = sessions
            .get_mut(&id)
            .ok_or(RegistryError::UnknownSession(id))?;
        Ok(std::mem::replace(&mut session.nickname, nickname.to_string()))
    }

    pub async fn find_by_nickname(&self, nickname: &str) -> Result<Peer, RegistryError> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .find(|session| session.has_nickname() && session.nickname == nickname)
            .map(Session::peer)
            .ok_or_else(|| RegistryError::NotFound(nickname.to_string()))
    }

    pub async fn peer(&self, id: SessionId) -> Option<Peer> {
        self.sessions.read().await.get(&id).map(Session::peer)
    }

    /// Every live session except `excluded`, in join order.
    pub async fn peers_except(&self, excluded: SessionId) -> Vec<Peer> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| session.id != excluded)
            .map(Session::peer)
            .collect()
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.sessions.read().await.values().map(Session::peer).collect()
    }

    /// Nicknames of sessions that have set one, in join order.
    pub async fn nicknames(&self) -> Vec<String> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| session.has_nickname())
            .map(|session| session.nickname.clone())
            .collect()
    }

    /// Endpoints of all sessions, anonymous ones included, in join order.
    pub async fn endpoints(&self) -> Vec<String> {
        self.sessions
            .read()
            .await
            .values()
            .map(|session| session.endpoint.clone())
            .collect()
    }

    /// Removes and returns every session.
    pub async fn drain(&self) -> Vec<Session> {
        let mut sessions = self.sessions.write().await;
        std::mem::take(&mut *sessions).into_values().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
