//! Interfaces the discovery and orchestration core needs from the network.
//!
//! The libp2p node implements both traits; tests substitute in-memory fakes.

use crate::network::{PeerAddress, RendezvousTopic};
use crate::utils::Result;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::stream::BoxStream;

/// Distributed rendezvous (DHT) operations
#[async_trait]
pub trait Rendezvous: Send + Sync + 'static {
    /// Join the DHT through the given seed peers
    async fn bootstrap(&self, seeds: &[PeerAddress]) -> Result<()>;

    /// Publish this node's presence under `topic`
    async fn advertise(&self, topic: &RendezvousTopic) -> Result<()>;

    /// Unfiltered, potentially infinite sequence of peers found under `topic`
    async fn find_peers(&self, topic: &RendezvousTopic) -> Result<BoxStream<'static, PeerAddress>>;
}

/// Opens chat streams to remote peers
#[async_trait]
pub trait StreamDialer: Send + Sync + 'static {
    /// Duplex byte stream type produced by this dialer
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open a duplex stream to `peer` under the chat protocol
    async fn open_stream(&self, peer: &PeerAddress) -> Result<Self::Stream>;
}
