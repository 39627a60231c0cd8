//! # P2P Chat
//!
//! A peer-to-peer chat node built on libp2p. Nodes meet under a shared
//! rendezvous topic in the Kademlia DHT (or on the local network through
//! mDNS) and exchange newline-delimited text over a dedicated stream
//! protocol.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use p2p_chat::{App, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::default();
//!     let mut app = App::new(config).await?;
//!     app.start_console();
//!     app.run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: node identity
//! - [`transport`]: libp2p swarm runtime and line framing
//! - [`network`]: peer addressing, rendezvous discovery and connection
//!   orchestration
//! - [`session`]: chat sessions, their registry, and the console
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod network;
pub mod session;
pub mod transport;
pub mod utils;

pub use app::App;
pub use crypto::NodeIdentity;
pub use network::{ConnectionOrchestrator, DiscoveryResolver, PeerAddress, RendezvousTopic};
pub use session::{ChatSession, Console, SessionManager};
pub use utils::{NodeConfig, NodeError, Result};

use libp2p::StreamProtocol;

/// Protocol tag negotiated for chat streams
pub const CHAT_PROTOCOL: StreamProtocol = StreamProtocol::new("/chat/1.0.0");

/// Protocol version announced through identify
pub const IDENTIFY_PROTOCOL: &str = "/p2p-chat/id/1.0.0";

/// Maximum size of one chat line in bytes, delimiter excluded (64KiB)
pub const MAX_LINE_SIZE: usize = 64 * 1024;

/// Default configuration values
pub mod defaults {
    /// Listen on every interface, on a port chosen by the OS
    pub const DEFAULT_LISTEN_ADDRESS: &str = "/ip4/0.0.0.0/tcp/0";

    /// Default rendezvous topic
    pub const DEFAULT_TOPIC: &str = "p2p-chat/rendezvous";

    /// Default connect timeout in seconds
    pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;

    /// Default DHT bootstrap timeout in seconds
    pub const DEFAULT_BOOTSTRAP_TIMEOUT: u64 = 30;

    /// Default number of liveness probes in direct-connect mode
    pub const DEFAULT_PING_COUNT: usize = 10;
}
