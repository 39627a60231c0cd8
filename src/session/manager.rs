//! Registry of live chat sessions.

use crate::session::{ChatSession, Direction, SessionId, SessionOutcome};
use chrono::{DateTime, Utc};
use futures::future;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Summary of one registered session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier
    pub id: SessionId,
    /// Remote peer
    pub peer: PeerId,
    /// Which side opened the stream
    pub direction: Direction,
    /// Session start time
    pub opened_at: DateTime<Utc>,
}

/// Tracks sessions so they can be looked up and shut down together
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, ChatSession>>,
}

impl SessionManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, ChatSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `session`, dropping sessions that have already finished
    pub fn insert(&self, session: ChatSession) -> SessionId {
        let id = session.id();
        let mut sessions = self.lock();
        sessions.retain(|_, s| !s.is_finished());
        sessions.insert(id, session);
        id
    }

    /// Register a session with `peer` unless a live one takes precedence.
    ///
    /// Without a live session for `peer`, `start` runs and its session is
    /// registered. Otherwise `replaces` gets the live session's direction:
    /// on `true` the live session is cancelled and replaced, on `false`
    /// `start` is dropped unused and the live session's id is returned.
    pub fn insert_unique<F, R>(&self, peer: PeerId, replaces: R, start: F) -> SessionId
    where
        F: FnOnce() -> ChatSession,
        R: FnOnce(Direction) -> bool,
    {
        let mut sessions = self.lock();
        sessions.retain(|_, s| !s.is_finished());

        let live = sessions
            .values()
            .find(|s| s.peer() == peer)
            .map(|s| (s.id(), s.direction()));
        if let Some((id, direction)) = live {
            if !replaces(direction) {
                return id;
            }
            if let Some(previous) = sessions.remove(&id) {
                previous.cancel();
            }
        }

        let session = start();
        let id = session.id();
        sessions.insert(id, session);
        id
    }

    /// Remove finished sessions; returns how many were removed
    pub fn prune(&self) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_finished());
        before - sessions.len()
    }

    /// Whether a live session with `peer` exists
    pub fn contains_peer(&self, peer: &PeerId) -> bool {
        self.lock()
            .values()
            .any(|s| s.peer() == *peer && !s.is_finished())
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.lock().values().filter(|s| !s.is_finished()).count()
    }

    /// Whether no live session exists
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered session IDs
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.lock().keys().copied().collect()
    }

    /// Summaries of the live sessions, oldest first
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .lock()
            .values()
            .filter(|s| !s.is_finished())
            .map(|s| SessionInfo {
                id: s.id(),
                peer: s.peer(),
                direction: s.direction(),
                opened_at: s.opened_at(),
            })
            .collect();
        infos.sort_by_key(|info| info.opened_at);
        infos
    }

    /// Wait until session `id` stops; returns immediately if it is unknown
    pub async fn wait_closed(&self, id: &SessionId) {
        let closed = self.lock().get(id).map(ChatSession::closed);
        if let Some(closed) = closed {
            closed.await;
        }
    }

    /// Stop every session, each bounded by `timeout`
    pub async fn close_all(&self, timeout: Duration) -> Vec<SessionOutcome> {
        let sessions: Vec<ChatSession> = self.lock().drain().map(|(_, s)| s).collect();
        if !sessions.is_empty() {
            log::info!("Closing {} session(s)", sessions.len());
        }
        future::join_all(sessions.into_iter().map(|s| s.close(timeout)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Console;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    fn open(console: &Console, peer: PeerId) -> (ChatSession, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(1024);
        let io = console.session_io();
        let session = ChatSession::start(local.compat(), peer, Direction::Inbound, io);
        (session, remote)
    }

    #[tokio::test]
    async fn test_insert_and_lookup_by_peer() {
        let (console, _events) = Console::new(8);
        let manager = SessionManager::new();
        let peer = PeerId::random();
        let (session, _remote) = open(&console, peer);

        let id = manager.insert(session);
        assert!(manager.contains_peer(&peer));
        assert!(!manager.contains_peer(&PeerId::random()));
        assert_eq!(manager.session_ids(), vec![id]);
        assert_eq!(manager.sessions()[0].peer, peer);
    }

    #[tokio::test]
    async fn test_finished_sessions_are_not_live() {
        let (console, _events) = Console::new(8);
        let manager = SessionManager::new();
        let peer = PeerId::random();
        let (session, remote) = open(&console, peer);
        let id = manager.insert(session);

        drop(remote);
        tokio::time::timeout(Duration::from_secs(2), manager.wait_closed(&id))
            .await
            .unwrap();

        assert!(!manager.contains_peer(&peer));
        assert!(manager.is_empty());
        assert_eq!(manager.prune(), 1);
        assert!(manager.session_ids().is_empty());
    }

    #[tokio::test]
    async fn test_close_all_stops_every_session() {
        let (console, _events) = Console::new(8);
        let manager = SessionManager::new();
        let mut remotes = Vec::new();
        for _ in 0..3 {
            let (session, remote) = open(&console, PeerId::random());
            manager.insert(session);
            remotes.push(remote);
        }
        assert_eq!(manager.len(), 3);

        let outcomes = manager.close_all(Duration::from_secs(2)).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.error().is_none()));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_insert_unique_keeps_or_replaces_live_session() {
        let (console, _events) = Console::new(8);
        let manager = SessionManager::new();
        let peer = PeerId::random();
        let (session, _remote) = open(&console, peer);
        let first = manager.insert(session);

        let (duplicate, _dup_remote) = open(&console, peer);
        let kept = manager.insert_unique(peer, |_| false, || duplicate);
        assert_eq!(kept, first);
        assert_eq!(manager.session_ids(), vec![first]);

        let (replacement, _new_remote) = open(&console, peer);
        let replacement_id = replacement.id();
        let replaced = manager.insert_unique(
            peer,
            |live| {
                assert_eq!(live, Direction::Inbound);
                true
            },
            || replacement,
        );
        assert_eq!(replaced, replacement_id);
        assert_eq!(manager.session_ids(), vec![replacement_id]);

        let other = PeerId::random();
        let (session, _other_remote) = open(&console, other);
        manager.insert_unique(other, |_| false, || session);
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_wait_closed_for_unknown_session_returns() {
        let manager = SessionManager::new();
        manager.wait_closed(&SessionId::new_v4()).await;
    }
}
