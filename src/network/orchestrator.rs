//! Turns discovered candidates into chat sessions.
//!
//! Candidates are attempted one at a time in the order they arrive. A failed
//! or slow peer costs at most one connect timeout and never stops the loop.
//!
//! Two nodes that find each other at the same time open one stream each. Both
//! keep the stream opened by the lower peer id and drop the other, so every
//! pair of peers ends up with a single session.

use crate::network::{PeerAddress, StreamDialer};
use crate::session::{ChatSession, Console, Direction, SessionId, SessionManager};
use crate::utils::{NetworkError, Result};
use futures::stream::{Stream, StreamExt};
use libp2p::PeerId;
use std::time::Duration;

/// Upper bound for each session to wind down on shutdown
pub const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Counters for one pass over a candidate stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Connection attempts made
    pub attempted: usize,
    /// Attempts that produced a session
    pub connected: usize,
    /// Attempts that failed or timed out
    pub failed: usize,
    /// Candidates skipped because a session with them was already live
    pub skipped: usize,
}

/// Opens sessions to candidates and accepts inbound ones
pub struct ConnectionOrchestrator<D: StreamDialer> {
    dialer: D,
    local_peer_id: PeerId,
    console: Console,
    sessions: SessionManager,
    connect_timeout: Duration,
}

impl<D: StreamDialer> ConnectionOrchestrator<D> {
    /// Create an orchestrator dialing through `dialer` on behalf of `local_peer_id`
    pub fn new(
        dialer: D,
        local_peer_id: PeerId,
        console: Console,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            dialer,
            local_peer_id,
            console,
            sessions: SessionManager::new(),
            connect_timeout,
        }
    }

    /// Registry of sessions started by this orchestrator
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Open a chat stream to `peer` and start a session over it
    ///
    /// # Errors
    ///
    /// Returns the dialer's error, or `NetworkError::Timeout` if no stream
    /// was open within the connect timeout.
    pub async fn connect(&self, peer: &PeerAddress) -> Result<SessionId> {
        log::info!("Connecting to: {}", peer);
        let stream = match tokio::time::timeout(self.connect_timeout, self.dialer.open_stream(peer))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(NetworkError::Timeout {
                    operation: format!("connect to {}", peer.peer_id),
                }
                .into())
            }
        };
        log::info!("Connected to: {}", peer.peer_id);
        Ok(self.start_session(stream, peer.peer_id, Direction::Outbound))
    }

    /// Start a session over a stream opened by `peer`
    pub fn accept(&self, peer: PeerId, stream: D::Stream) -> SessionId {
        log::info!("Got a new stream from {}", peer);
        self.start_session(stream, peer, Direction::Inbound)
    }

    fn start_session(&self, stream: D::Stream, peer: PeerId, direction: Direction) -> SessionId {
        let preferred = self.preferred_direction(&peer);
        self.sessions.insert_unique(
            peer,
            |live| {
                let replace = live != direction && direction == preferred;
                log::debug!(
                    "Second session with {}, keeping the {:?} one",
                    peer,
                    if replace { direction } else { live }
                );
                replace
            },
            || ChatSession::start(stream, peer, direction, self.console.session_io()),
        )
    }

    /// Direction of the stream opened by whichever of the two peers has the lower id
    fn preferred_direction(&self, peer: &PeerId) -> Direction {
        if self.local_peer_id < *peer {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }

    /// Attempt every candidate until the stream ends
    pub async fn run<S>(&self, candidates: S) -> OrchestratorStats
    where
        S: Stream<Item = PeerAddress>,
    {
        let mut stats = OrchestratorStats::default();
        futures::pin_mut!(candidates);

        while let Some(peer) = candidates.next().await {
            if self.sessions.contains_peer(&peer.peer_id) {
                log::debug!("Already chatting with {}, skipping", peer.peer_id);
                stats.skipped += 1;
                continue;
            }

            stats.attempted += 1;
            match self.connect(&peer).await {
                Ok(_) => stats.connected += 1,
                Err(e) => {
                    stats.failed += 1;
                    if e.is_recoverable() {
                        log::warn!("Connection failed to {}: {}", peer.peer_id, e);
                    } else {
                        log::error!("Connection failed to {}: {}", peer.peer_id, e);
                    }
                }
            }
        }

        stats
    }

    /// Close every session; returns how many were closed
    pub async fn shutdown(&self) -> usize {
        self.sessions.close_all(SESSION_CLOSE_TIMEOUT).await.len()
    }
}
