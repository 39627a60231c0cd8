//! libp2p node runtime.
//!
//! The swarm is owned by a single event-loop task. Everything else talks to it
//! through a [`NodeHandle`], which sends commands over a channel and awaits
//! the replies. Chat streams bypass the loop entirely via the
//! `libp2p_stream` control.

use crate::crypto::NodeIdentity;
use crate::network::{
    PeerAddress, PeerQueue, PushOutcome, Rendezvous, RendezvousTopic, StreamDialer,
};
use crate::transport::behaviour::{NodeBehaviour, NodeBehaviourEvent};
use crate::utils::{DiscoveryError, NetworkError, NodeConfig, NodeError, Result};
use crate::CHAT_PROTOCOL;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{DialError, SwarmEvent};
use libp2p::{
    identify, kad, mdns, noise, ping, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const COMMAND_BUFFER: usize = 64;

/// Requests served by the event loop
enum Command {
    Bootstrap {
        seeds: Vec<PeerAddress>,
        reply: oneshot::Sender<Result<()>>,
    },
    StartProviding {
        topic: RendezvousTopic,
        reply: oneshot::Sender<Result<()>>,
    },
    GetProviders {
        topic: RendezvousTopic,
        sender: mpsc::Sender<PeerAddress>,
    },
    Dial {
        peer: PeerAddress,
        reply: oneshot::Sender<Result<()>>,
    },
    Ping {
        peer_id: PeerId,
        sender: mpsc::Sender<Duration>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct NodeHandle {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
    mdns_peers: PeerQueue<PeerAddress>,
    dht_enabled: bool,
    rediscovery_interval: Duration,
    lookup_capacity: usize,
}

/// Build the swarm for `identity`, start listening and spawn the event loop.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Fails if the transport cannot be built or a listen address is invalid or
/// cannot be bound.
pub fn spawn_node(identity: &NodeIdentity, config: &NodeConfig) -> Result<NodeHandle> {
    let mut behaviour = NodeBehaviour::new(identity, config)?;
    let control = behaviour.stream.new_control();
    let idle_timeout = Duration::from_secs(config.network.idle_connection_timeout);

    let mut swarm = SwarmBuilder::with_existing_identity(identity.keypair().clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(transport_error)?
        .with_dns()
        .map_err(transport_error)?
        .with_behaviour(move |_| behaviour)
        .map_err(transport_error)?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
        .build();

    for address in &config.network.listen_addresses {
        let addr: Multiaddr = address.parse().map_err(|_| NetworkError::InvalidAddress {
            address: address.clone(),
        })?;
        swarm.listen_on(addr).map_err(|e| NetworkError::Listen {
            address: address.clone(),
            reason: e.to_string(),
        })?;
    }

    let mdns_peers = PeerQueue::new(
        config.discovery.queue_capacity,
        config.discovery.overflow_policy,
    );
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);

    let runner = NodeRunner::new(swarm, commands_rx, mdns_peers.clone());
    tokio::spawn(runner.run());

    Ok(NodeHandle {
        local_peer_id: identity.peer_id(),
        commands: commands_tx,
        control,
        mdns_peers,
        dht_enabled: config.discovery.enable_dht,
        rediscovery_interval: config.discovery.rediscovery_interval(),
        lookup_capacity: config.discovery.queue_capacity.max(1),
    })
}

fn transport_error<E: std::fmt::Display>(e: E) -> NodeError {
    NetworkError::Transport {
        reason: e.to_string(),
    }
    .into()
}

impl NodeHandle {
    /// Identifier of the local node
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Peers found on the local network, in discovery order
    pub fn mdns_peers(&self) -> PeerQueue<PeerAddress> {
        self.mdns_peers.clone()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetworkError::NodeStopped.into())
    }

    async fn request<T>(&self, command: Command, reply: oneshot::Receiver<T>) -> Result<T> {
        self.send(command).await?;
        reply.await.map_err(|_| NetworkError::NodeStopped.into())
    }

    /// Addresses the node listens on, waiting until at least one is bound
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::ListenAddrs { reply }, rx).await
    }

    /// Establish a connection to `peer` through its known addresses
    pub async fn dial(&self, peer: &PeerAddress) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Dial {
                peer: peer.clone(),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Subscribe to round-trip times measured against `peer_id`
    pub async fn ping(&self, peer_id: PeerId, capacity: usize) -> Result<mpsc::Receiver<Duration>> {
        let (sender, rx) = mpsc::channel(capacity.max(1));
        self.send(Command::Ping { peer_id, sender }).await?;
        Ok(rx)
    }

    /// Register the inbound chat stream handler
    ///
    /// # Errors
    ///
    /// Only one handler may exist per node.
    pub fn accept_chat(&self) -> Result<libp2p_stream::IncomingStreams> {
        self.control
            .clone()
            .accept(CHAT_PROTOCOL)
            .map_err(|_| {
                NetworkError::ProtocolRegistered {
                    protocol: CHAT_PROTOCOL.to_string(),
                }
                .into()
            })
    }

    /// Stop the event loop, closing every connection and listener
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Shutdown { reply }, rx).await
    }

    fn ensure_dht(&self) -> Result<()> {
        if self.dht_enabled {
            Ok(())
        } else {
            Err(DiscoveryError::Disabled.into())
        }
    }
}

#[async_trait]
impl Rendezvous for NodeHandle {
    async fn bootstrap(&self, seeds: &[PeerAddress]) -> Result<()> {
        self.ensure_dht()?;
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Bootstrap {
                seeds: seeds.to_vec(),
                reply,
            },
            rx,
        )
        .await?
    }

    async fn advertise(&self, topic: &RendezvousTopic) -> Result<()> {
        self.ensure_dht()?;
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::StartProviding {
                topic: topic.clone(),
                reply,
            },
            rx,
        )
        .await?
    }

    async fn find_peers(&self, topic: &RendezvousTopic) -> Result<BoxStream<'static, PeerAddress>> {
        self.ensure_dht()?;
        let (tx, rx) = mpsc::channel(self.lookup_capacity);
        let handle = self.clone();
        let topic = topic.clone();

        // Provider lookups repeat until the consumer goes away or the node stops.
        tokio::spawn(async move {
            loop {
                let (round_tx, mut round_rx) = mpsc::channel(handle.lookup_capacity);
                let command = Command::GetProviders {
                    topic: topic.clone(),
                    sender: round_tx,
                };
                if handle.send(command).await.is_err() {
                    break;
                }
                while let Some(peer) = round_rx.recv().await {
                    if tx.send(peer).await.is_err() {
                        return;
                    }
                }
                log::debug!("Provider lookup for '{}' finished", topic);

                tokio::select! {
                    _ = tokio::time::sleep(handle.rediscovery_interval) => {}
                    _ = tx.closed() => return,
                }
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|peer| (peer, rx))
        })
        .boxed())
    }
}

#[async_trait]
impl StreamDialer for NodeHandle {
    type Stream = libp2p::Stream;

    async fn open_stream(&self, peer: &PeerAddress) -> Result<Self::Stream> {
        self.dial(peer).await?;

        let mut control = self.control.clone();
        control
            .open_stream(peer.peer_id, CHAT_PROTOCOL)
            .await
            .map_err(|e| {
                NetworkError::Connect {
                    peer: peer.peer_id.to_string(),
                    reason: e.to_string(),
                }
                .into()
            })
    }
}

/// Event loop state
struct NodeRunner {
    swarm: Swarm<NodeBehaviour>,
    commands: mpsc::Receiver<Command>,
    mdns_peers: PeerQueue<PeerAddress>,
    listen_addrs: Vec<Multiaddr>,
    listen_waiters: Vec<oneshot::Sender<Vec<Multiaddr>>>,
    known_addresses: HashMap<PeerId, Vec<Multiaddr>>,
    pending_bootstrap: HashMap<kad::QueryId, oneshot::Sender<Result<()>>>,
    pending_providing: HashMap<kad::QueryId, (RendezvousTopic, oneshot::Sender<Result<()>>)>,
    pending_lookups: HashMap<kad::QueryId, (RendezvousTopic, mpsc::Sender<PeerAddress>)>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<()>>>>,
    ping_probes: HashMap<PeerId, Vec<mpsc::Sender<Duration>>>,
}

impl NodeRunner {
    fn new(
        swarm: Swarm<NodeBehaviour>,
        commands: mpsc::Receiver<Command>,
        mdns_peers: PeerQueue<PeerAddress>,
    ) -> Self {
        Self {
            swarm,
            commands,
            mdns_peers,
            listen_addrs: Vec::new(),
            listen_waiters: Vec::new(),
            known_addresses: HashMap::new(),
            pending_bootstrap: HashMap::new(),
            pending_providing: HashMap::new(),
            pending_lookups: HashMap::new(),
            pending_dials: HashMap::new(),
            ping_probes: HashMap::new(),
        }
    }

    async fn run(mut self) {
        log::info!("Node {} started", self.swarm.local_peer_id());

        let reply = loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => break Some(reply),
                    Some(command) => self.handle_command(command),
                    None => break None,
                },
            }
        };

        self.mdns_peers.close();
        let local_peer_id = *self.swarm.local_peer_id();
        drop(self);
        log::info!("Node {} stopped", local_peer_id);

        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Bootstrap { seeds, reply } => {
                for seed in &seeds {
                    self.learn_addresses(seed.peer_id, &seed.addresses);
                }
                let Some(kademlia) = self.swarm.behaviour_mut().kademlia.as_mut() else {
                    let _ = reply.send(Err(DiscoveryError::Disabled.into()));
                    return;
                };
                match kademlia.bootstrap() {
                    Ok(query_id) => {
                        self.pending_bootstrap.insert(query_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(DiscoveryError::Bootstrap {
                            reason: e.to_string(),
                        }
                        .into()));
                    }
                }
            }
            Command::StartProviding { topic, reply } => {
                let Some(kademlia) = self.swarm.behaviour_mut().kademlia.as_mut() else {
                    let _ = reply.send(Err(DiscoveryError::Disabled.into()));
                    return;
                };
                match kademlia.start_providing(topic.record_key()) {
                    Ok(query_id) => {
                        self.pending_providing.insert(query_id, (topic, reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(DiscoveryError::Advertise {
                            topic: topic.to_string(),
                            reason: e.to_string(),
                        }
                        .into()));
                    }
                }
            }
            Command::GetProviders { topic, sender } => {
                // Without the DHT the sender is dropped and the round is empty.
                if let Some(kademlia) = self.swarm.behaviour_mut().kademlia.as_mut() {
                    let query_id = kademlia.get_providers(topic.record_key());
                    self.pending_lookups.insert(query_id, (topic, sender));
                }
            }
            Command::Dial { peer, reply } => {
                if self.swarm.is_connected(&peer.peer_id) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.learn_addresses(peer.peer_id, &peer.addresses);
                let addresses = self
                    .known_addresses
                    .get(&peer.peer_id)
                    .cloned()
                    .unwrap_or_default();
                let opts = DialOpts::peer_id(peer.peer_id)
                    .condition(PeerCondition::DisconnectedAndNotDialing)
                    .addresses(addresses)
                    .extend_addresses_through_behaviour()
                    .build();
                match self.swarm.dial(opts) {
                    // An attempt already in flight settles this reply as well.
                    Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => self
                        .pending_dials
                        .entry(peer.peer_id)
                        .or_default()
                        .push(reply),
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            Command::Ping { peer_id, sender } => {
                self.ping_probes.entry(peer_id).or_default().push(sender);
            }
            Command::ListenAddrs { reply } => {
                if self.listen_addrs.is_empty() {
                    self.listen_waiters.push(reply);
                } else {
                    let _ = reply.send(self.listen_addrs.clone());
                }
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                log::info!("Listening on {}", address);
                self.listen_addrs.push(address);
                for waiter in self.listen_waiters.drain(..) {
                    let _ = waiter.send(self.listen_addrs.clone());
                }
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                log::debug!("Connected to {} via {}", peer_id, endpoint.get_remote_address());
                if endpoint.is_dialer() {
                    let address = endpoint.get_remote_address().clone();
                    self.learn_addresses(peer_id, &[address]);
                }
                for reply in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = reply.send(Ok(()));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                cause,
                num_established,
                ..
            } => {
                log::debug!("Connection to {} closed: {:?}", peer_id, cause);
                if num_established == 0 && self.ping_probes.remove(&peer_id).is_some() {
                    log::debug!("Dropped ping subscribers of disconnected {}", peer_id);
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                log::debug!("Dial to {} failed: {}", peer_id, error);
                if let Some(replies) = self.pending_dials.remove(&peer_id) {
                    let reason = error.to_string();
                    for reply in replies {
                        let _ = reply.send(Err(NetworkError::Connect {
                            peer: peer_id.to_string(),
                            reason: reason.clone(),
                        }
                        .into()));
                    }
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Kademlia(event)) => {
                self.handle_kad_event(event)
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Mdns(event)) => {
                self.handle_mdns_event(event)
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                log::debug!("Identified {} ({})", peer_id, info.agent_version);
                if info.protocols.contains(&kad::PROTOCOL_NAME) {
                    self.learn_addresses(peer_id, &info.listen_addrs);
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Ping(ping::Event { peer, result, .. })) => {
                match result {
                    Ok(rtt) => {
                        if let Some(probes) = self.ping_probes.get_mut(&peer) {
                            probes.retain(|probe| probe.try_send(rtt).is_ok());
                            if probes.is_empty() {
                                self.ping_probes.remove(&peer);
                            }
                        }
                    }
                    Err(e) => log::debug!("Ping to {} failed: {}", peer, e),
                }
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => match result {
                kad::QueryResult::Bootstrap(result) => {
                    let Some(reply) = self.pending_bootstrap.remove(&id) else {
                        return;
                    };
                    let outcome: Result<()> = match result {
                        Ok(_) if self.swarm.connected_peers().next().is_none() => {
                            Err(DiscoveryError::Bootstrap {
                                reason: "no seed peer reachable".to_string(),
                            }
                            .into())
                        }
                        Ok(_) => Ok(()),
                        Err(e) => Err(DiscoveryError::Bootstrap {
                            reason: e.to_string(),
                        }
                        .into()),
                    };
                    let _ = reply.send(outcome);
                }
                kad::QueryResult::StartProviding(result) => {
                    if let Some((topic, reply)) = self.pending_providing.remove(&id) {
                        let outcome: Result<()> = result.map(|_| ()).map_err(|e| {
                            DiscoveryError::Advertise {
                                topic: topic.to_string(),
                                reason: e.to_string(),
                            }
                            .into()
                        });
                        let _ = reply.send(outcome);
                    }
                }
                kad::QueryResult::GetProviders(result) => {
                    match result {
                        Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                            self.forward_providers(id, providers)
                        }
                        Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
                        Err(e) => {
                            if let Some((topic, _)) = self.pending_lookups.get(&id) {
                                let error = DiscoveryError::Lookup {
                                    topic: topic.to_string(),
                                    reason: e.to_string(),
                                };
                                log::warn!("{}", error);
                            }
                        }
                    }
                    if step.last {
                        self.pending_lookups.remove(&id);
                    }
                }
                _ => {}
            },
            kad::Event::RoutingUpdated { peer, .. } => {
                log::debug!("Routing table updated with {}", peer);
            }
            _ => {}
        }
    }

    fn forward_providers(&mut self, id: kad::QueryId, providers: impl IntoIterator<Item = PeerId>) {
        let Some(sender) = self.pending_lookups.get(&id).map(|(_, sender)| sender.clone()) else {
            return;
        };
        let local_peer_id = *self.swarm.local_peer_id();
        for provider in providers {
            let addresses = self.known_addresses.get(&provider).cloned().unwrap_or_default();
            match sender.try_send(PeerAddress::new(provider, addresses)) {
                Ok(()) => {
                    if provider != local_peer_id {
                        self.connect_provider(provider);
                    }
                }
                Err(mpsc::error::TrySendError::Full(peer)) => {
                    log::debug!("Lookup consumer busy, dropping {}", peer.peer_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.pending_lookups.remove(&id);
                    if let Some(kademlia) = self.swarm.behaviour_mut().kademlia.as_mut() {
                        if let Some(mut query) = kademlia.query_mut(&id) {
                            query.finish();
                        }
                    }
                    return;
                }
            }
        }
    }

    /// Dial a provider while its lookup, the only holder of its addresses,
    /// is still running. Once connected, identify keeps the addresses.
    fn connect_provider(&mut self, peer_id: PeerId) {
        if self.swarm.is_connected(&peer_id) {
            return;
        }
        let opts = DialOpts::peer_id(peer_id)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .build();
        match self.swarm.dial(opts) {
            Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {}
            Err(e) => log::debug!("Could not dial provider {}: {}", peer_id, e),
        }
    }

    fn handle_mdns_event(&mut self, event: mdns::Event) {
        match event {
            mdns::Event::Discovered(list) => {
                let mut grouped: Vec<PeerAddress> = Vec::new();
                for (peer_id, addr) in list {
                    match grouped.iter_mut().find(|p| p.peer_id == peer_id) {
                        Some(peer) => peer.addresses.push(addr),
                        None => grouped.push(PeerAddress::new(peer_id, vec![addr])),
                    }
                }
                for peer in grouped {
                    log::debug!("mDNS discovered {}", peer);
                    self.learn_addresses(peer.peer_id, &peer.addresses);
                    let peer_id = peer.peer_id;
                    match self.mdns_peers.push(peer) {
                        PushOutcome::Queued => {}
                        PushOutcome::EvictedOldest => {
                            log::warn!("Discovery queue full, evicted oldest candidate");
                        }
                        PushOutcome::Discarded => {
                            log::warn!("Discovery queue full, dropped {}", peer_id);
                        }
                        PushOutcome::Closed => {}
                    }
                }
            }
            mdns::Event::Expired(list) => {
                for (peer_id, addr) in list {
                    log::debug!("mDNS record expired: {} {}", peer_id, addr);
                }
            }
        }
    }

    fn learn_addresses(&mut self, peer_id: PeerId, addresses: &[Multiaddr]) {
        if addresses.is_empty() {
            return;
        }
        let known = self.known_addresses.entry(peer_id).or_default();
        for addr in addresses {
            if !known.contains(addr) {
                known.push(addr.clone());
            }
        }
        if let Some(kademlia) = self.swarm.behaviour_mut().kademlia.as_mut() {
            for addr in addresses {
                kademlia.add_address(&peer_id, addr.clone());
            }
        }
    }
}
