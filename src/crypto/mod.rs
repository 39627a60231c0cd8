//! Node identity and key material.
//!
//! The transport layer authenticates every connection with the node keypair,
//! so this module only has to create, persist and expose that identity.

pub mod identity;

pub use identity::*;
