//! Composite libp2p behaviour of a chat node.

use crate::crypto::NodeIdentity;
use crate::utils::{NetworkError, NodeConfig};
use libp2p::swarm::{behaviour::toggle::Toggle, NetworkBehaviour};
use libp2p::{identify, kad, mdns, ping};
use std::time::Duration;

/// Network behaviours driven by the node event loop
#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    /// DHT rendezvous, absent when DHT discovery is disabled
    pub kademlia: Toggle<kad::Behaviour<kad::store::MemoryStore>>,
    /// LAN discovery, absent when mDNS is disabled
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Address exchange with connected peers
    pub identify: identify::Behaviour,
    /// Liveness probes
    pub ping: ping::Behaviour,
    /// Raw protocol streams used for chat
    pub stream: libp2p_stream::Behaviour,
}

impl NodeBehaviour {
    /// Build the behaviour set for `identity` according to `config`
    pub fn new(identity: &NodeIdentity, config: &NodeConfig) -> crate::utils::Result<Self> {
        let peer_id = identity.peer_id();

        let kademlia = if config.discovery.enable_dht {
            let mut kad_config = kad::Config::default();
            kad_config.set_provider_publication_interval(Some(Duration::from_secs(
                config.discovery.provider_publication_interval,
            )));
            kad_config.set_query_timeout(Duration::from_secs(config.discovery.bootstrap_timeout));

            let store = kad::store::MemoryStore::new(peer_id);
            let mut behaviour = kad::Behaviour::with_config(peer_id, store, kad_config);
            behaviour.set_mode(Some(kad::Mode::Server));
            Some(behaviour)
        } else {
            None
        };

        let mdns = if config.discovery.enable_mdns {
            let behaviour = mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                .map_err(|e| NetworkError::Transport {
                    reason: format!("mDNS: {e}"),
                })?;
            Some(behaviour)
        } else {
            None
        };

        let identify = identify::Behaviour::new(identify::Config::new(
            crate::IDENTIFY_PROTOCOL.to_string(),
            identity.keypair().public(),
        ));

        let ping = ping::Behaviour::new(
            ping::Config::new().with_interval(Duration::from_secs(config.chat.ping_interval)),
        );

        Ok(Self {
            kademlia: Toggle::from(kademlia),
            mdns: Toggle::from(mdns),
            identify,
            ping,
            stream: libp2p_stream::Behaviour::new(),
        })
    }
}
