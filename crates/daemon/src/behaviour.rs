//! CraftBlock swarm behaviour
//!
//! Kademlia for provider records, identify for address exchange, and
//! libp2p_stream for exchange message streams.

use std::time::Duration;

use craftblock_core::{IDENTIFY_PROTOCOL, KAD_PROTOCOL};
use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, kad, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, SwarmBuilder};
use tracing::{info, warn};

use craftblock_routing::PROVIDER_RECORD_TTL;

/// Type alias for the CraftBlock swarm.
pub type CraftBlockSwarm = libp2p::Swarm<CraftBlockBehaviour>;

/// Combined behaviour for CraftBlock nodes.
#[derive(NetworkBehaviour)]
pub struct CraftBlockBehaviour {
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    /// Exchange streams are accepted and opened through its `Control`.
    pub stream: libp2p_stream::Behaviour,
}

/// Streams one connection may carry: exchange streams in both directions
/// plus Kademlia and identify substreams.
const MAX_STREAMS_PER_CONNECTION: usize = 512;

fn muxer_config() -> yamux::Config {
    let mut config = yamux::Config::default();
    config.set_max_num_streams(MAX_STREAMS_PER_CONNECTION);
    config
}

fn kademlia(peer_id: PeerId) -> kad::Behaviour<MemoryStore> {
    let mut config = kad::Config::new(StreamProtocol::new(KAD_PROTOCOL));
    config.set_provider_record_ttl(Some(PROVIDER_RECORD_TTL));
    config.set_query_timeout(Duration::from_secs(60));
    let mut kad = kad::Behaviour::with_config(peer_id, MemoryStore::new(peer_id), config);
    kad.set_mode(Some(kad::Mode::Server));
    kad
}

/// The peer id a `/p2p/<id>` suffixed address points at.
pub fn peer_of(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer)) => Some(peer),
        _ => None,
    }
}

/// Build a swarm listening on `listen_port` with `boot_peers` seeded into
/// Kademlia.
pub fn build_swarm(
    keypair: Keypair,
    listen_port: u16,
    boot_peers: &[String],
    idle_timeout: Duration,
) -> Result<CraftBlockSwarm, Box<dyn std::error::Error + Send + Sync>> {
    let local_peer_id = PeerId::from(keypair.public());
    info!("Local peer ID: {}", local_peer_id);

    let mut swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default().nodelay(true), noise::Config::new, muxer_config)?
        .with_behaviour(|key| {
            let peer_id = PeerId::from(key.public());
            CraftBlockBehaviour {
                kademlia: kademlia(peer_id),
                identify: identify::Behaviour::new(identify::Config::new(
                    IDENTIFY_PROTOCOL.to_string(),
                    key.public(),
                )),
                stream: libp2p_stream::Behaviour::new(),
            }
        })?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
        .build();

    let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", listen_port).parse()?;
    swarm.listen_on(listen)?;

    let mut seeded = 0;
    for raw in boot_peers {
        let addr: Multiaddr = match raw.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Skipping boot peer {}: {}", raw, e);
                continue;
            }
        };
        let Some(peer) = peer_of(&addr) else {
            warn!("Skipping boot peer {}: missing /p2p/ suffix", raw);
            continue;
        };
        swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
        if let Err(e) = swarm.dial(addr) {
            warn!("Failed to dial boot peer {}: {}", raw, e);
        }
        seeded += 1;
    }
    if seeded > 0 {
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            warn!("Kademlia bootstrap failed: {:?}", e);
        }
    }

    Ok(swarm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_of_boot_address() {
        let peer = PeerId::random();
        let addr: Multiaddr = format!("/ip4/10.0.0.1/tcp/4001/p2p/{}", peer).parse().unwrap();
        assert_eq!(peer_of(&addr), Some(peer));

        let bare: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        assert_eq!(peer_of(&bare), None);
    }
}
