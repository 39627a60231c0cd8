//! Application lifecycle and coordination.
//!
//! [`App`] wires the node runtime, discovery resolver, connection
//! orchestrator and console together and drives the two operating modes:
//! listening for peers under a rendezvous topic, and connecting directly to a
//! known address.

use crate::{
    crypto::NodeIdentity,
    network::{
        bootstrap_peers, ConnectionOrchestrator, DiscoveryResolver, PeerAddress, RendezvousTopic,
    },
    session::{console, Console, ConsoleEvent},
    transport::{spawn_node, NodeHandle},
    utils::{NetworkError, NodeConfig, NodeError, Result},
};
use futures::stream::{self, BoxStream, StreamExt};
use libp2p::Multiaddr;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Unread input lines buffered per session
const INPUT_BUFFER: usize = 64;

/// Main application structure
pub struct App {
    /// Application configuration
    config: NodeConfig,
    /// Node identity
    identity: NodeIdentity,
    /// Handle to the libp2p node
    node: NodeHandle,
    /// Candidate filtering shared by every discovery source
    resolver: DiscoveryResolver<NodeHandle>,
    /// Session creation and registry
    orchestrator: Arc<ConnectionOrchestrator<NodeHandle>>,
    /// Local input and output
    console: Console,
    /// Events waiting for a renderer
    console_events: Option<mpsc::UnboundedReceiver<ConsoleEvent>>,
    /// Start time
    started_at: chrono::DateTime<chrono::Utc>,
}

impl App {
    /// Create a new application instance.
    ///
    /// The identity comes from the key file picked by
    /// [`IdentityConfig::startup_key_file`](crate::utils::IdentityConfig::startup_key_file);
    /// without one a fresh identity is generated for this run.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let identity = match config.identity.startup_key_file() {
            Some(path) => NodeIdentity::load_or_generate(&path)?,
            None => NodeIdentity::generate(),
        };
        Self::with_identity(config, identity)
    }

    /// Create an application instance around an existing identity
    pub fn with_identity(config: NodeConfig, identity: NodeIdentity) -> Result<Self> {
        let node = spawn_node(&identity, &config)?;
        let (console, console_events) = Console::new(INPUT_BUFFER);
        let resolver = DiscoveryResolver::new(node.clone(), identity.peer_id(), &config.discovery);
        let orchestrator = Arc::new(ConnectionOrchestrator::new(
            node.clone(),
            identity.peer_id(),
            console.clone(),
            config.network.connect_timeout(),
        ));

        log::info!("Peer ID: {}", identity.peer_id());

        Ok(Self {
            config,
            identity,
            node,
            resolver,
            orchestrator,
            console,
            console_events: Some(console_events),
            started_at: chrono::Utc::now(),
        })
    }

    /// Node identity
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Handle to the libp2p node
    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    /// Session creation and registry
    pub fn orchestrator(&self) -> &Arc<ConnectionOrchestrator<NodeHandle>> {
        &self.orchestrator
    }

    /// Local console
    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Take the console event receiver to render events elsewhere
    pub fn take_console_events(&mut self) -> Option<mpsc::UnboundedReceiver<ConsoleEvent>> {
        self.console_events.take()
    }

    /// Attach the console to the terminal: read standard input and render
    /// events to standard output
    pub fn start_console(&mut self) {
        if let Some(events) = self.console_events.take() {
            tokio::spawn(console::run_renderer(events));
        }
        if let Err(e) = self.console.spawn_stdin_reader() {
            log::error!("Failed to start console input: {}", e);
            self.console.close_input();
        }
    }

    /// Full addresses (including the peer id) this node can be reached on
    pub async fn addresses(&self) -> Result<Vec<Multiaddr>> {
        let peer = PeerAddress::new(self.identity.peer_id(), self.node.listen_addrs().await?);
        Ok(peer.to_p2p_addrs())
    }

    async fn print_addresses(&self) -> Result<()> {
        for addr in self.addresses().await? {
            println!("libp2p node address: {addr}");
        }
        Ok(())
    }

    /// Hand every inbound chat stream to the orchestrator
    pub fn serve_inbound(&self) -> Result<JoinHandle<()>> {
        let mut incoming = self.node.accept_chat()?;
        let orchestrator = Arc::clone(&self.orchestrator);
        Ok(tokio::spawn(async move {
            while let Some((peer, stream)) = incoming.next().await {
                orchestrator.accept(peer, stream);
            }
        }))
    }

    /// Publish this node under the configured topic
    pub async fn advertise(&self) -> Result<()> {
        let topic = RendezvousTopic::new(&self.config.discovery.topic);
        self.resolver.advertise(&topic).await
    }

    /// Join discovery and return the merged candidate stream.
    ///
    /// With the DHT enabled this bootstraps, advertises and starts the
    /// provider lookup; with mDNS enabled LAN peers are merged in. A failed
    /// bootstrap only ends discovery if there is no LAN discovery to fall
    /// back on or the error is fatal on its own.
    pub async fn discover(&self) -> Result<BoxStream<'static, PeerAddress>> {
        let discovery = &self.config.discovery;
        let topic = RendezvousTopic::new(&discovery.topic);
        let mut sources: Vec<BoxStream<'static, PeerAddress>> = Vec::new();

        if discovery.enable_dht {
            let seeds = bootstrap_peers(&discovery.bootstrap_nodes);
            match self.resolver.bootstrap(&seeds).await {
                Ok(()) => {
                    if let Err(e) = self.resolver.advertise(&topic).await {
                        log::warn!("Failed to announce under '{}': {}", topic, e);
                    }
                    sources.push(self.resolver.find_peers(&topic).await?);
                }
                Err(e) if discovery.enable_mdns && !e.is_fatal() => {
                    log::warn!("DHT unavailable, continuing with mDNS only: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        if discovery.enable_mdns {
            let lan = self.node.mdns_peers().into_stream();
            sources.push(self.resolver.filter_candidates(lan));
        }

        Ok(stream::select_all(sources).boxed())
    }

    /// Rendezvous mode: accept inbound sessions and connect to every peer
    /// found under the topic until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        log::info!("Starting p2p chat node");
        tokio::pin!(shutdown);

        self.print_addresses().await?;
        let inbound = self.serve_inbound()?;

        let discovery = async {
            let candidates = self.discover().await?;
            let stats = self.orchestrator.run(candidates).await;
            log::info!("Discovery ended: {:?}", stats);
            Ok::<(), NodeError>(())
        };

        let result = tokio::select! {
            result = discovery => match result {
                // Established sessions stay up until shutdown.
                Ok(()) => {
                    (&mut shutdown).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            _ = &mut shutdown => Ok(()),
        };

        inbound.abort();
        self.shutdown().await?;
        result
    }

    /// Direct mode: dial `target`, probe it, then chat with it unless
    /// `ping_only` is set
    pub async fn run_direct<F>(
        self,
        target: PeerAddress,
        ping_only: bool,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        self.print_addresses().await?;
        let inbound = self.serve_inbound()?;

        let result = tokio::select! {
            result = self.connect_direct(&target, ping_only) => result,
            _ = &mut shutdown => Ok(()),
        };

        inbound.abort();
        self.shutdown().await?;
        result
    }

    /// Dial `target`, report liveness probes, and open a chat session that
    /// runs until it ends
    pub async fn connect_direct(&self, target: &PeerAddress, ping_only: bool) -> Result<()> {
        let timeout = self.config.network.connect_timeout();
        match tokio::time::timeout(timeout, self.node.dial(target)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(NetworkError::Timeout {
                    operation: format!("dial {}", target),
                }
                .into())
            }
        }

        let count = self.config.chat.ping_count;
        if count > 0 {
            println!("sending {} ping messages to {}", count, target);
            for rtt in self.probe(target, count).await? {
                println!("pinged {} in {:?}", target, rtt);
            }
        }

        if ping_only {
            return Ok(());
        }

        let id = self.orchestrator.connect(target).await?;
        self.orchestrator.sessions().wait_closed(&id).await;
        Ok(())
    }

    /// Collect `count` round-trip times to a connected peer
    pub async fn probe(&self, target: &PeerAddress, count: usize) -> Result<Vec<Duration>> {
        let mut rtts = self.node.ping(target.peer_id, count).await?;
        let wait = Duration::from_secs(self.config.chat.ping_interval)
            + self.config.network.connect_timeout();
        let mut measured = Vec::with_capacity(count);

        while measured.len() < count {
            match tokio::time::timeout(wait, rtts.recv()).await {
                Ok(Some(rtt)) => measured.push(rtt),
                Ok(None) => {
                    return Err(NetworkError::Connect {
                        peer: target.peer_id.to_string(),
                        reason: "connection closed while probing".to_string(),
                    }
                    .into())
                }
                Err(_) => {
                    return Err(NetworkError::Timeout {
                        operation: format!("ping {}", target.peer_id),
                    }
                    .into())
                }
            }
        }

        Ok(measured)
    }

    /// Get application statistics
    pub fn stats(&self) -> AppStats {
        AppStats {
            peer_id: self.identity.peer_id().to_string(),
            active_sessions: self.orchestrator.sessions().len(),
            discovered_peers: self.resolver.seen().len(),
            uptime: chrono::Utc::now().signed_duration_since(self.started_at),
        }
    }

    /// Close every session, then stop the node
    pub async fn shutdown(self) -> Result<()> {
        log::info!("Shutting down");
        let closed = self.orchestrator.shutdown().await;
        log::debug!("Closed {} session(s)", closed);
        self.node.shutdown().await
    }
}

/// Application statistics
#[derive(Debug, Clone)]
pub struct AppStats {
    /// Network peer ID
    pub peer_id: String,
    /// Number of live chat sessions
    pub active_sessions: usize,
    /// Number of distinct peers discovered
    pub discovered_peers: usize,
    /// Application uptime
    pub uptime: chrono::Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.network.listen_addresses = vec!["/ip4/127.0.0.1/tcp/0".to_string()];
        config.network.connect_timeout = 5;
        config.discovery.topic = "p2p-chat/test".to_string();
        config.discovery.enable_mdns = false;
        config.discovery.settle_delay_ms = 0;
        config.discovery.bootstrap_timeout = 10;
        config.chat.ping_interval = 1;
        config.identity.ephemeral = true;
        config
    }

    async fn next_message(
        events: &mut mpsc::UnboundedReceiver<ConsoleEvent>,
    ) -> (libp2p::PeerId, String) {
        loop {
            if let ConsoleEvent::Message { peer, content } = events.recv().await.unwrap() {
                return (peer, content);
            }
        }
    }

    #[tokio::test]
    async fn test_app_creation_and_stats() {
        let app = App::new(test_config()).await.unwrap();
        let stats = app.stats();

        assert_eq!(stats.peer_id, app.identity().peer_id().to_string());
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.discovered_peers, 0);

        let addrs = app.addresses().await.unwrap();
        assert!(addrs[0].to_string().contains("/p2p/"));
        app.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_identity_persisted_through_key_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.identity.key_file = Some(temp_dir.path().join("node.key"));

        let first = App::new(config.clone()).await.unwrap();
        let peer_id = first.identity().peer_id();
        first.shutdown().await.unwrap();

        let second = App::new(config).await.unwrap();
        assert_eq!(second.identity().peer_id(), peer_id);
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.discovery.topic = "  ".to_string();
        assert!(App::new(config).await.is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_failure_without_mdns_is_fatal() {
        let mut config = test_config();
        // Nothing listens on this seed.
        let unreachable = PeerAddress::new(
            libp2p::PeerId::random(),
            vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()],
        );
        config.discovery.bootstrap_nodes = vec![unreachable.to_p2p_addrs()[0].to_string()];
        config.discovery.bootstrap_timeout = 5;

        let app = App::new(config).await.unwrap();
        assert!(app.discover().await.is_err());
        app.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_two_nodes_meet_under_topic_and_chat() {
        let mut x = App::new(test_config()).await.unwrap();
        let mut x_events = x.take_console_events().unwrap();
        let x_inbound = x.serve_inbound().unwrap();
        let x_addr = x.addresses().await.unwrap()[0].clone();

        x.advertise().await.unwrap();

        let mut y_config = test_config();
        y_config.discovery.bootstrap_nodes = vec![x_addr.to_string()];
        y_config.discovery.rediscovery_interval = 1;
        let y = App::new(y_config).await.unwrap();

        let candidates = y.discover().await.unwrap();

        let stats = tokio::time::timeout(
            Duration::from_secs(30),
            y.orchestrator().run(candidates.take(1)),
        )
        .await
        .unwrap();
        assert_eq!(stats.connected, 1);
        assert!(y.orchestrator().sessions().contains_peer(&x.identity().peer_id()));

        assert_eq!(y.console().submit("hello"), 1);
        let (from, content) =
            tokio::time::timeout(Duration::from_secs(10), next_message(&mut x_events))
                .await
                .unwrap();
        assert_eq!(from, y.identity().peer_id());
        assert_eq!(content, "hello");
        assert_eq!(y.stats().discovered_peers, 1);

        x_inbound.abort();
        y.shutdown().await.unwrap();
        x.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_provider_found_through_a_third_node_is_reached() {
        let seed = App::new(test_config()).await.unwrap();
        let seed_addr = seed.addresses().await.unwrap()[0].to_string();

        let mut x_config = test_config();
        x_config.discovery.bootstrap_nodes = vec![seed_addr.clone()];
        let mut x = App::new(x_config.clone()).await.unwrap();
        let mut x_events = x.take_console_events().unwrap();
        let x_inbound = x.serve_inbound().unwrap();
        let x_seeds = bootstrap_peers(&x_config.discovery.bootstrap_nodes);
        x.resolver.bootstrap(&x_seeds).await.unwrap();
        x.advertise().await.unwrap();

        let mut y_config = test_config();
        y_config.discovery.bootstrap_nodes = vec![seed_addr];
        y_config.discovery.rediscovery_interval = 1;
        let y = App::new(y_config).await.unwrap();
        let candidates = y.discover().await.unwrap();

        let stats = tokio::time::timeout(
            Duration::from_secs(30),
            y.orchestrator().run(candidates.take(1)),
        )
        .await
        .unwrap();
        assert_eq!(stats.connected, 1);
        assert!(y.orchestrator().sessions().contains_peer(&x.identity().peer_id()));
        assert!(!y.orchestrator().sessions().contains_peer(&seed.identity().peer_id()));

        assert_eq!(y.console().submit("via the seed"), 1);
        let (from, content) =
            tokio::time::timeout(Duration::from_secs(10), next_message(&mut x_events))
                .await
                .unwrap();
        assert_eq!(from, y.identity().peer_id());
        assert_eq!(content, "via the seed");

        x_inbound.abort();
        y.shutdown().await.unwrap();
        x.shutdown().await.unwrap();
        seed.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_connect_probes_liveness() {
        let x = App::new(test_config()).await.unwrap();
        let target = PeerAddress::from_multiaddr(x.addresses().await.unwrap()[0].clone()).unwrap();

        let mut y_config = test_config();
        y_config.chat.ping_count = 2;
        let y = App::new(y_config).await.unwrap();

        tokio::time::timeout(Duration::from_secs(15), y.connect_direct(&target, true))
            .await
            .unwrap()
            .unwrap();
        let rtts = y.probe(&target, 1).await.unwrap();
        assert_eq!(rtts.len(), 1);

        y.shutdown().await.unwrap();
        x.shutdown().await.unwrap();
    }
}
