// Combined NetworkBehaviour for the overlay node
//
// Protocols by role policy:
// - gossipsub: topic fan-out for messages, announcements, status
// - kademlia: DHT backing the address -> peer directory
// - identify: peer metadata + listen address exchange
// - ping: connection liveness
// - connection_limits: hard cap on established connections
//
// Gossipsub and Kademlia sit behind Toggle so a LIGHT node runs the
// same swarm with both disabled.

use std::time::Duration;

use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{connection_limits, gossipsub, identify, kad, ping};

use crate::config::RolePolicy;

pub const IDENTIFY_PROTOCOL: &str = "/agentmesh/id/1.0.0";

/// The overlay network behaviour, assembled from the role policy.
#[derive(NetworkBehaviour)]
pub struct OverlayBehaviour {
    /// Deny connections beyond the policy budget.
    pub connection_limits: connection_limits::Behaviour,
    /// Pub/sub mesh for the three overlay topics.
    pub gossipsub: Toggle<gossipsub::Behaviour>,
    /// DHT for directory provide/lookup.
    pub kademlia: Toggle<kad::Behaviour<kad::store::MemoryStore>>,
    /// Peer identification
    pub identify: identify::Behaviour,
    /// Liveness
    pub ping: ping::Behaviour,
}

impl OverlayBehaviour {
    pub fn new(keypair: &libp2p::identity::Keypair, policy: &RolePolicy) -> anyhow::Result<Self> {
        let peer_id = keypair.public().to_peer_id();

        let limits = connection_limits::ConnectionLimits::default()
            .with_max_established(Some(policy.max_connections))
            .with_max_pending_outgoing(Some(policy.max_parallel_dials));
        let connection_limits = connection_limits::Behaviour::new(limits);

        let gossipsub = if policy.enable_gossip {
            let config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(policy.gossip_heartbeat)
                .validation_mode(gossipsub::ValidationMode::Strict)
                .build()
                .map_err(|e| anyhow::anyhow!("Gossipsub config error: {}", e))?;

            Some(
                gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(keypair.clone()),
                    config,
                )
                .map_err(|e| anyhow::anyhow!("Gossipsub error: {}", e))?,
            )
        } else {
            None
        };

        let kademlia = if policy.enable_dht {
            let mut config = kad::Config::default();
            config.set_query_timeout(Duration::from_secs(30));
            Some(kad::Behaviour::with_config(
                peer_id,
                kad::store::MemoryStore::new(peer_id),
                config,
            ))
        } else {
            None
        };

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                .with_agent_version(format!("agentmesh/{}", env!("CARGO_PKG_VERSION")))
                .with_push_listen_addr_updates(true),
        );

        Ok(Self {
            connection_limits,
            gossipsub: Toggle::from(gossipsub),
            kademlia: Toggle::from(kademlia),
            identify,
            ping: ping::Behaviour::default(),
        })
    }
}
