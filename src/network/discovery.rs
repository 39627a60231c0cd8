//! Rendezvous-based peer discovery.
//!
//! The [`DiscoveryResolver`] drives the DHT collaborator through bootstrap and
//! advertisement and turns its raw lookup results into a stream of
//! connectable candidates: never the local node, and never the same peer
//! twice during the resolver's lifetime.

use crate::network::{PeerAddress, Rendezvous, RendezvousTopic};
use crate::utils::{DiscoveryConfig, DiscoveryError, Result};
use futures::future;
use futures::stream::{BoxStream, Stream, StreamExt};
use libp2p::PeerId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Set of peer ids already handed out as candidates.
///
/// Cloning shares the set, so several candidate sources feeding one resolver
/// de-duplicate against each other.
#[derive(Debug, Clone, Default)]
pub struct SeenPeers {
    inner: Arc<Mutex<HashSet<PeerId>>>,
}

impl SeenPeers {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `peer_id`; returns true only the first time it is seen
    pub fn insert_if_new(&self, peer_id: PeerId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer_id)
    }

    /// Whether `peer_id` has been seen
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(peer_id)
    }

    /// Number of distinct peers seen
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no peer has been seen yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns DHT participation into a de-duplicated candidate stream
pub struct DiscoveryResolver<R> {
    /// DHT collaborator
    rendezvous: R,
    /// Identifier of the local node, never yielded
    local_peer_id: PeerId,
    /// Candidates handed out so far
    seen: SeenPeers,
    /// Upper bound for the bootstrap query
    bootstrap_timeout: Duration,
    /// Wait after bootstrap before lookups are trusted
    settle_delay: Duration,
}

impl<R: Rendezvous> DiscoveryResolver<R> {
    /// Create a resolver using the timeouts from `config`
    pub fn new(rendezvous: R, local_peer_id: PeerId, config: &DiscoveryConfig) -> Self {
        Self::with_timeouts(
            rendezvous,
            local_peer_id,
            config.bootstrap_timeout(),
            config.settle_delay(),
        )
    }

    /// Create a resolver with explicit timeouts
    pub fn with_timeouts(
        rendezvous: R,
        local_peer_id: PeerId,
        bootstrap_timeout: Duration,
        settle_delay: Duration,
    ) -> Self {
        Self {
            rendezvous,
            local_peer_id,
            seen: SeenPeers::new(),
            bootstrap_timeout,
            settle_delay,
        }
    }

    /// The set of peers already yielded
    pub fn seen(&self) -> &SeenPeers {
        &self.seen
    }

    /// Join the DHT through `seeds`
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::Bootstrap` if there is no usable seed, the
    /// bootstrap query fails, or it does not finish within the timeout.
    pub async fn bootstrap(&self, seeds: &[PeerAddress]) -> Result<()> {
        let seeds: Vec<PeerAddress> = seeds
            .iter()
            .filter(|seed| seed.peer_id != self.local_peer_id)
            .cloned()
            .collect();

        if seeds.is_empty() {
            return Err(DiscoveryError::Bootstrap {
                reason: "no seed peers available".to_string(),
            }
            .into());
        }

        log::info!("Bootstrapping DHT through {} seed peer(s)", seeds.len());
        let bootstrap = self.rendezvous.bootstrap(&seeds);
        match tokio::time::timeout(self.bootstrap_timeout, bootstrap).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DiscoveryError::Bootstrap {
                    reason: format!("timed out after {:?}", self.bootstrap_timeout),
                }
                .into())
            }
        }

        // Routing table population continues asynchronously after bootstrap.
        tokio::time::sleep(self.settle_delay).await;
        Ok(())
    }

    /// Publish this node under `topic`; safe to repeat
    pub async fn advertise(&self, topic: &RendezvousTopic) -> Result<()> {
        log::info!("Announcing ourselves under '{}'", topic);
        self.rendezvous.advertise(topic).await?;
        log::info!("Successfully announced under '{}'", topic);
        Ok(())
    }

    /// Filtered candidate stream for `topic`
    pub async fn find_peers(
        &self,
        topic: &RendezvousTopic,
    ) -> Result<BoxStream<'static, PeerAddress>> {
        log::info!("Searching for other peers under '{}'", topic);
        let raw = self.rendezvous.find_peers(topic).await?;
        Ok(self.filter_candidates(raw))
    }

    /// Apply self-exclusion and first-seen de-duplication to any candidate
    /// source
    pub fn filter_candidates<S>(&self, candidates: S) -> BoxStream<'static, PeerAddress>
    where
        S: Stream<Item = PeerAddress> + Send + 'static,
    {
        let local_peer_id = self.local_peer_id;
        let seen = self.seen.clone();
        candidates
            .filter(move |peer| {
                let keep = peer.peer_id != local_peer_id && seen.insert_if_new(peer.peer_id);
                if keep {
                    log::info!("Found peer: {}", peer);
                }
                future::ready(keep)
            })
            .boxed()
    }
}
