//! Peer addressing, discovery and connection orchestration.
//!
//! Discovery produces candidates (DHT rendezvous and mDNS), the resolver
//! filters them, and the orchestrator turns the survivors into chat sessions.

pub mod bootstrap;
pub mod discovery;
pub mod orchestrator;
pub mod peer;
pub mod queue;
pub mod rendezvous;

pub use bootstrap::*;
pub use discovery::*;
pub use orchestrator::*;
pub use peer::*;
pub use queue::*;
pub use rendezvous::*;
