//! Error types and handling for the chat node.
//!
//! Errors are layered the same way the node is: identity, network/transport,
//! discovery, per-session stream errors and configuration. Everything funnels
//! into [`NodeError`] so library calls can use a single `Result` alias.
//! [`NodeError::is_recoverable`] marks failures local to one peer and
//! [`NodeError::is_fatal`] those no fallback can work around.

use thiserror::Error;

/// Result type alias for the chat node library
pub type Result<T> = std::result::Result<T, NodeError>;

/// Top-level error type for all node operations
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    /// Identity creation or loading errors
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Transport and connection errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Rendezvous/DHT discovery errors
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Errors scoped to a single chat stream
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Node identity errors
#[derive(Error, Debug, Clone)]
pub enum IdentityError {
    /// Key bytes could not be decoded into a keypair
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Key file could not be read or written
    #[error("Key file {path}: {reason}")]
    KeyFile { path: String, reason: String },

    /// Keypair could not be encoded for storage
    #[error("Key encoding failed: {reason}")]
    Encoding { reason: String },
}

/// Transport and connection errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Binding a listen address failed
    #[error("Failed to listen on {address}: {reason}")]
    Listen { address: String, reason: String },

    /// Opening a connection or stream to a peer failed
    #[error("Connection failed to {peer}: {reason}")]
    Connect { peer: String, reason: String },

    /// Timeout during network operation
    #[error("Network timeout: {operation}")]
    Timeout { operation: String },

    /// Invalid network address
    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },

    /// Address without a `/p2p/<peer-id>` component
    #[error("Address has no peer id: {address}")]
    MissingPeerId { address: String },

    /// Building the transport stack failed
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// The inbound handler for a protocol could not be registered
    #[error("Protocol already registered: {protocol}")]
    ProtocolRegistered { protocol: String },

    /// The node event loop is gone
    #[error("Node is not running")]
    NodeStopped,
}

/// Rendezvous discovery errors
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    /// No seed peer reachable
    #[error("Bootstrap failed: {reason}")]
    Bootstrap { reason: String },

    /// Publishing under the rendezvous topic failed
    #[error("Advertise under '{topic}' failed: {reason}")]
    Advertise { topic: String, reason: String },

    /// Provider lookup failed
    #[error("Lookup of '{topic}' failed: {reason}")]
    Lookup { topic: String, reason: String },

    /// DHT discovery is switched off in this node
    #[error("DHT discovery is disabled")]
    Disabled,
}

/// Chat stream errors; each one is scoped to exactly one session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Remote side closed the stream (normal loop end)
    #[error("Stream closed")]
    Closed,

    /// Reading from the stream failed
    #[error("Stream read failed: {reason}")]
    Read { reason: String },

    /// Writing to the stream failed
    #[error("Stream write failed: {reason}")]
    Write { reason: String },

    /// Incoming line exceeded the maximum line size
    #[error("Line too long: more than {max} bytes")]
    LineTooLong { max: usize },

    /// Outgoing content contained the line delimiter
    #[error("Line content contains a newline delimiter")]
    EmbeddedDelimiter,
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl NodeError {
    /// Returns true if this error is local to one peer and the caller should
    /// simply move on to the next one
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::Timeout { .. })
                | Self::Network(NetworkError::Connect { .. })
                | Self::Discovery(DiscoveryError::Advertise { .. })
                | Self::Stream(_)
        )
    }

    /// Returns true if no fallback can work around this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Identity(_)
                | Self::Config(_)
                | Self::Network(NetworkError::Listen { .. })
                | Self::Network(NetworkError::Transport { .. })
        )
    }
}

impl StreamError {
    /// Returns true when this is the normal end-of-stream signal
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<libp2p::multiaddr::Error> for NodeError {
    fn from(err: libp2p::multiaddr::Error) -> Self {
        Self::Network(NetworkError::InvalidAddress {
            address: err.to_string(),
        })
    }
}

impl From<libp2p::swarm::DialError> for NodeError {
    fn from(err: libp2p::swarm::DialError) -> Self {
        Self::Network(NetworkError::Connect {
            peer: "unknown".to_string(),
            reason: err.to_string(),
        })
    }
}

impl From<libp2p::identity::DecodingError> for NodeError {
    fn from(err: libp2p::identity::DecodingError) -> Self {
        Self::Identity(IdentityError::InvalidKey {
            reason: err.to_string(),
        })
    }
}
