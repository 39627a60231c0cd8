//! Node identity management.
//!
//! A node is identified on the network by the [`PeerId`] derived from its
//! ed25519 keypair. The keypair is either generated fresh for every run or
//! persisted in a key file holding its protobuf encoding.

use crate::utils::{IdentityError, Result};
use libp2p::identity::Keypair;
use libp2p::PeerId;
use std::fmt;
use std::path::Path;

/// Cryptographic identity of the local node
#[derive(Clone)]
pub struct NodeIdentity {
    /// The node keypair
    keypair: Keypair,
    /// Identifier derived from the public key
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Generate a new random ed25519 identity
    ///
    /// # Example
    ///
    /// ```rust
    /// use p2p_chat::crypto::NodeIdentity;
    ///
    /// let identity = NodeIdentity::generate();
    /// assert_eq!(identity.peer_id(), identity.keypair().public().to_peer_id());
    /// ```
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    /// Wrap an existing keypair
    pub fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    /// Decode an identity from the protobuf keypair encoding
    ///
    /// # Errors
    ///
    /// Returns `IdentityError::InvalidKey` if the bytes are not a keypair
    pub fn from_protobuf(bytes: &[u8]) -> Result<Self> {
        let keypair =
            Keypair::from_protobuf_encoding(bytes).map_err(|e| IdentityError::InvalidKey {
                reason: e.to_string(),
            })?;
        Ok(Self::from_keypair(keypair))
    }

    /// Encode the keypair for storage
    pub fn to_protobuf(&self) -> Result<Vec<u8>> {
        self.keypair.to_protobuf_encoding().map_err(|e| {
            IdentityError::Encoding {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Load the identity stored at `path`, generating and storing a new one
    /// if the file does not exist yet
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        let identity = Self::generate();
        identity.save(path)?;
        log::info!("Generated new node identity {} at {}", identity.peer_id, path.display());
        Ok(identity)
    }

    /// Load the identity stored at `path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| IdentityError::KeyFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_protobuf(&bytes)
    }

    /// Write the identity to `path`, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let key_file_error = |e: std::io::Error| IdentityError::KeyFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(key_file_error)?;
        }
        std::fs::write(path, self.to_protobuf()?).map_err(key_file_error)?;
        Ok(())
    }

    /// The node's network identifier
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The node keypair, handed to the transport
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Hex of the protobuf-encoded public key
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public().encode_protobuf())
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identities_differ() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_protobuf_restores_same_peer_id() {
        let original = NodeIdentity::generate();
        let bytes = original.to_protobuf().unwrap();

        let restored = NodeIdentity::from_protobuf(&bytes).unwrap();
        assert_eq!(original.peer_id(), restored.peer_id());
        assert_eq!(original.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn test_invalid_key_bytes() {
        let result = NodeIdentity::from_protobuf(b"definitely not a key");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.key");

        let first = NodeIdentity::load_or_generate(&path).unwrap();
        assert!(path.exists());

        let second = NodeIdentity::load_or_generate(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = NodeIdentity::load(dir.path().join("absent.key")).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let identity = NodeIdentity::generate();
        let debug = format!("{identity:?}");
        assert!(debug.contains(&identity.peer_id().to_string()));
        assert!(!debug.contains("keypair"));
    }
}
