//! Well-known DHT seed peers.

use crate::network::PeerAddress;

/// Public libp2p bootstrap nodes, used when no seed peers are configured
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

/// Parse seed addresses, skipping (and logging) the ones that do not parse
pub fn parse_bootstrap_nodes<S: AsRef<str>>(nodes: &[S]) -> Vec<PeerAddress> {
    nodes
        .iter()
        .filter_map(|node| match PeerAddress::parse(node.as_ref()) {
            Ok(peer) => Some(peer),
            Err(e) => {
                log::warn!("Ignoring bootstrap node {}: {}", node.as_ref(), e);
                None
            }
        })
        .collect()
}

/// Configured seeds, or the public bootstrap list when none are configured
pub fn bootstrap_peers<S: AsRef<str>>(configured: &[S]) -> Vec<PeerAddress> {
    if configured.is_empty() {
        parse_bootstrap_nodes(DEFAULT_BOOTSTRAP_NODES)
    } else {
        parse_bootstrap_nodes(configured)
    }
}
