//! Peer addressing and rendezvous topics.

use crate::utils::{NetworkError, Result};
use libp2p::kad::RecordKey;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A remote node: its identifier and the locations it may be reachable at.
///
/// Equality and hashing only look at the peer id.
#[derive(Debug, Clone)]
pub struct PeerAddress {
    /// Peer identifier
    pub peer_id: PeerId,
    /// Zero or more transport addresses, without the `/p2p` suffix
    pub addresses: Vec<Multiaddr>,
}

impl PeerAddress {
    /// Create a peer address
    pub fn new(peer_id: PeerId, addresses: Vec<Multiaddr>) -> Self {
        Self { peer_id, addresses }
    }

    /// A peer known only by its identifier
    pub fn from_peer_id(peer_id: PeerId) -> Self {
        Self::new(peer_id, Vec::new())
    }

    /// Parse a literal `/…/p2p/<peer-id>` multiaddress
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::InvalidAddress` if the string is not a
    /// multiaddress and `NetworkError::MissingPeerId` if it has no peer id.
    pub fn parse(addr: &str) -> Result<Self> {
        let multiaddr: Multiaddr = addr.parse().map_err(|_| NetworkError::InvalidAddress {
            address: addr.to_string(),
        })?;
        Self::from_multiaddr(multiaddr)
    }

    /// Split a multiaddress into its transport part and peer id
    pub fn from_multiaddr(mut multiaddr: Multiaddr) -> Result<Self> {
        match multiaddr.pop() {
            Some(Protocol::P2p(peer_id)) => {
                let addresses = if multiaddr.is_empty() {
                    Vec::new()
                } else {
                    vec![multiaddr]
                };
                Ok(Self::new(peer_id, addresses))
            }
            Some(protocol) => {
                multiaddr.push(protocol);
                Err(NetworkError::MissingPeerId {
                    address: multiaddr.to_string(),
                }
                .into())
            }
            None => Err(NetworkError::MissingPeerId {
                address: String::new(),
            }
            .into()),
        }
    }

    /// Full dialable addresses, each ending in `/p2p/<peer-id>`
    pub fn to_p2p_addrs(&self) -> Vec<Multiaddr> {
        self.addresses
            .iter()
            .map(|addr| addr.clone().with(Protocol::P2p(self.peer_id)))
            .collect()
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer_id.hash(state);
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}: [", self.peer_id)?;
        for (i, addr) in self.addresses.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{addr}")?;
        }
        write!(f, "]}}")
    }
}

/// A shared meeting point in the DHT
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RendezvousTopic(String);

impl RendezvousTopic {
    /// Create a topic from its name
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    /// Topic name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// DHT key the topic's provider records are stored under
    pub fn record_key(&self) -> RecordKey {
        let digest = Sha256::digest(self.0.as_bytes());
        RecordKey::new(&digest)
    }
}

impl fmt::Display for RendezvousTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
