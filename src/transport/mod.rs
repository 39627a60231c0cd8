//! Transport layer.
//!
//! The libp2p node runtime (TCP, Noise, Yamux, DHT, mDNS) and the line framer
//! used on chat streams.

pub mod behaviour;
pub mod framer;
pub mod node;

pub use behaviour::NodeBehaviour;
pub use framer::{LineReader, LineWriter};
pub use node::{spawn_node, NodeHandle};
