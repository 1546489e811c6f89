// Node configuration — role policy and the compiled-in bootstrap set
//
// The role policy is a pure function from the role tag to a fully
// populated parameter bundle. Nothing here touches the network; the
// overlay engine and the periodic tasks read these numbers and nothing
// else decides them.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

/// Operational role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Well-known rendezvous peer with a pinned overlay keypair.
    Bootstrap,
    /// Standard participant.
    Full,
    /// High-capacity participant that also relays mesh traffic.
    Server,
    /// Resource-constrained participant: no DHT, no gossip fan-out duty.
    Light,
}

impl FromStr for NodeRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bootstrap" => Ok(NodeRole::Bootstrap),
            "full" => Ok(NodeRole::Full),
            "server" => Ok(NodeRole::Server),
            "light" => Ok(NodeRole::Light),
            other => bail!("Unknown node type: {}", other),
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            NodeRole::Bootstrap => "bootstrap",
            NodeRole::Full => "full",
            NodeRole::Server => "server",
            NodeRole::Light => "light",
        };
        f.write_str(tag)
    }
}

/// The per-role parameter bundle consumed by the overlay engine, the
/// directory, and the messaging layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolePolicy {
    pub role: NodeRole,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_parallel_dials: u32,
    pub dial_timeout: Duration,
    pub auto_dial_interval: Duration,
    pub enable_dht: bool,
    pub dht_server_mode: bool,
    pub k_bucket_size: usize,
    pub enable_gossip: bool,
    pub gossip_heartbeat: Duration,
    pub allow_publish_to_zero_peers: bool,
    pub emit_self: bool,
    pub relay_messages: bool,
    pub bootstrap_required: bool,
    pub dht_update_interval: Duration,
    pub min_dht_update_interval: Duration,
}

impl RolePolicy {
    /// The policy table. Pure: same role in, same bundle out.
    pub fn for_role(role: NodeRole) -> Self {
        match role {
            NodeRole::Bootstrap => Self {
                role,
                max_connections: 1000,
                min_connections: 3,
                max_parallel_dials: 100,
                dial_timeout: Duration::from_secs(30),
                auto_dial_interval: Duration::from_secs(10),
                enable_dht: true,
                dht_server_mode: true,
                k_bucket_size: 200,
                enable_gossip: true,
                gossip_heartbeat: Duration::from_secs(1),
                allow_publish_to_zero_peers: true,
                emit_self: true,
                relay_messages: false,
                bootstrap_required: false,
                dht_update_interval: Duration::from_secs(30),
                min_dht_update_interval: Duration::from_secs(10),
            },
            NodeRole::Full => Self {
                role,
                max_connections: 50,
                min_connections: 1,
                max_parallel_dials: 25,
                dial_timeout: Duration::from_secs(30),
                auto_dial_interval: Duration::from_secs(10),
                enable_dht: true,
                dht_server_mode: false,
                k_bucket_size: 20,
                enable_gossip: true,
                gossip_heartbeat: Duration::from_secs(1),
                allow_publish_to_zero_peers: true,
                emit_self: true,
                relay_messages: false,
                bootstrap_required: true,
                dht_update_interval: Duration::from_secs(60),
                min_dht_update_interval: Duration::from_secs(20),
            },
            NodeRole::Server => Self {
                role,
                max_connections: 100,
                min_connections: 2,
                max_parallel_dials: 50,
                dial_timeout: Duration::from_secs(30),
                auto_dial_interval: Duration::from_secs(10),
                enable_dht: true,
                dht_server_mode: false,
                k_bucket_size: 20,
                enable_gossip: true,
                gossip_heartbeat: Duration::from_secs(1),
                allow_publish_to_zero_peers: true,
                emit_self: true,
                relay_messages: true,
                bootstrap_required: true,
                dht_update_interval: Duration::from_secs(45),
                min_dht_update_interval: Duration::from_secs(15),
            },
            NodeRole::Light => Self {
                role,
                max_connections: 10,
                min_connections: 1,
                max_parallel_dials: 10,
                dial_timeout: Duration::from_secs(30),
                auto_dial_interval: Duration::from_secs(20),
                enable_dht: false,
                dht_server_mode: false,
                k_bucket_size: 0,
                enable_gossip: false,
                gossip_heartbeat: Duration::from_secs(1),
                allow_publish_to_zero_peers: false,
                emit_self: true,
                relay_messages: false,
                bootstrap_required: true,
                dht_update_interval: Duration::from_secs(120),
                min_dht_update_interval: Duration::from_secs(30),
            },
        }
    }

    /// Announcement cadence, clamped below by the storm guard.
    pub fn announce_interval(&self) -> Duration {
        self.dht_update_interval.max(self.min_dht_update_interval)
    }
}

/// One well-known rendezvous peer. The multiaddress is always derived
/// from these fields, never learned from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub peer_id: String,
}

impl BootstrapPeer {
    pub fn new(name: &str, hostname: &str, port: u16, peer_id: &str) -> Self {
        Self {
            name: name.to_string(),
            hostname: hostname.to_string(),
            port,
            peer_id: peer_id.to_string(),
        }
    }

    /// `/dns4/<hostname>/tcp/<port>/p2p/<peer id>` (IP-literal
    /// hostnames render as `/ip4` or `/ip6`).
    pub fn multiaddr(&self) -> Result<Multiaddr> {
        format!(
            "{}/p2p/{}",
            host_multiaddr_string(&self.hostname, self.port),
            self.peer_id
        )
        .parse()
        .map_err(|e| anyhow!("Invalid bootstrap multiaddr for {}: {}", self.name, e))
    }

    pub fn parsed_peer_id(&self) -> Result<PeerId> {
        self.peer_id
            .parse()
            .map_err(|e| anyhow!("Invalid bootstrap peer id for {}: {}", self.name, e))
    }
}

/// Render a hostname + port as a multiaddr prefix, preferring the
/// literal IP protocols when the hostname is one.
pub fn host_multiaddr_string(hostname: &str, port: u16) -> String {
    match hostname.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(ip)) => format!("/ip4/{}/tcp/{}", ip, port),
        Ok(std::net::IpAddr::V6(ip)) => format!("/ip6/{}/tcp/{}", ip, port),
        Err(_) => format!("/dns4/{}/tcp/{}", hostname, port),
    }
}

/// The compiled-in bootstrap registry, keyed by network name.
///
/// Deployments add networks by extending this table.
pub fn bootstrap_set(network: &str) -> Vec<BootstrapPeer> {
    match network {
        "base" => vec![
            BootstrapPeer::new(
                "bootstrap-1",
                "bootstrap-1.agentmesh.network",
                9000,
                "12D3KooWBrjTYjNrEwi9MM3AKFenmymyWVXtXbQiSx7eDnDwv9qQ",
            ),
            BootstrapPeer::new(
                "bootstrap-2",
                "bootstrap-2.agentmesh.network",
                9000,
                "12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN",
            ),
            BootstrapPeer::new(
                "bootstrap-3",
                "bootstrap-3.agentmesh.network",
                9000,
                "12D3KooWFmmKJ7jXhTfoYDvKkPqe7s9pHH42iZdf2xRdM5ykma1p",
            ),
            BootstrapPeer::new(
                "bootstrap-4",
                "bootstrap-4.agentmesh.network",
                9000,
                "12D3KooWGGdvGNJb3JwkNpmYuapgk7SAZ4DsBmQsU989yhvnTB8W",
            ),
        ],
        "sepolia" => vec![
            BootstrapPeer::new(
                "bootstrap-1",
                "bootstrap-1.sepolia.agentmesh.network",
                9000,
                "12D3KooWGYQ8jsa4bEHaXT9vcpMkWwW7RV5jf9uD7BwK6PUTSJtE",
            ),
            BootstrapPeer::new(
                "bootstrap-2",
                "bootstrap-2.sepolia.agentmesh.network",
                9000,
                "12D3KooWHhbGYPu4kXfp3iNJq54RNFHA8SZk29vgNQwQ5zYJL5x1",
            ),
            BootstrapPeer::new(
                "bootstrap-3",
                "bootstrap-3.sepolia.agentmesh.network",
                9000,
                "12D3KooWKRrndodBFxEcDwpXaddSoBqTbrkcx55o4yrvyjPkrdnQ",
            ),
            BootstrapPeer::new(
                "bootstrap-4",
                "bootstrap-4.sepolia.agentmesh.network",
                9000,
                "12D3KooWLaLfqv5L7rL4NE6WYTGVFWLD8HKaDNTdBA97cMLfzA4x",
            ),
        ],
        _ => Vec::new(),
    }
}

/// Everything a node needs to start, resolved by the host binary from
/// the environment (`PRIVATE_KEY`, `NODE_TYPE`, `NETWORK`, ...).
#[derive(Clone)]
pub struct NodeOptions {
    /// Hex-encoded 32-byte account secret. Mandatory.
    pub private_key: String,
    /// Network context; selects the bootstrap set.
    pub network: String,
    /// Requested role. Overridden to Bootstrap when the name matches
    /// the bootstrap set.
    pub node_type: NodeRole,
    /// Overlay listen port.
    pub port: u16,
    /// Display name; for bootstrap peers this selects the pinned entry.
    pub agent_name: String,
    /// Whether outbound message content is sealed for the recipient.
    pub use_encryption: bool,
    /// Pinned overlay keypair for bootstrap peers (hex-encoded ed25519
    /// secret). Ignored for other roles.
    pub bootstrap_private_key: Option<String>,
    /// Explicit bootstrap set override. When `None`, the compiled-in
    /// table for `network` applies. Tests use this to point at a
    /// localhost rendezvous peer.
    pub bootstrap_peers: Option<Vec<BootstrapPeer>>,
}

impl std::fmt::Debug for NodeOptions {
    // Key material never reaches logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeOptions")
            .field("network", &self.network)
            .field("node_type", &self.node_type)
            .field("port", &self.port)
            .field("agent_name", &self.agent_name)
            .field("use_encryption", &self.use_encryption)
            .field("private_key", &"<redacted>")
            .field(
                "bootstrap_private_key",
                &self.bootstrap_private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("bootstrap_peers", &self.bootstrap_peers)
            .finish()
    }
}

impl NodeOptions {
    /// The effective bootstrap set for this node.
    pub fn bootstrap_set(&self) -> Vec<BootstrapPeer> {
        match &self.bootstrap_peers {
            Some(peers) => peers.clone(),
            None => bootstrap_set(&self.network),
        }
    }

    /// A node is Bootstrap iff its configured name matches an entry of
    /// the deployment's bootstrap set; otherwise the configured role
    /// stands.
    pub fn effective_role(&self) -> NodeRole {
        let is_pinned = self
            .bootstrap_set()
            .iter()
            .any(|peer| peer.name.eq_ignore_ascii_case(&self.agent_name));
        if is_pinned {
            NodeRole::Bootstrap
        } else {
            self.node_type
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!(NodeRole::from_str("full").unwrap(), NodeRole::Full);
        assert_eq!(NodeRole::from_str("BOOTSTRAP").unwrap(), NodeRole::Bootstrap);
        assert_eq!(NodeRole::from_str(" server ").unwrap(), NodeRole::Server);
        assert_eq!(NodeRole::from_str("light").unwrap(), NodeRole::Light);
        assert!(NodeRole::from_str("relay").is_err());
    }

    #[test]
    fn test_policy_is_pure() {
        assert_eq!(
            RolePolicy::for_role(NodeRole::Full),
            RolePolicy::for_role(NodeRole::Full)
        );
        assert_ne!(
            RolePolicy::for_role(NodeRole::Full),
            RolePolicy::for_role(NodeRole::Server)
        );
    }

    #[test]
    fn test_policy_table_spot_checks() {
        let bootstrap = RolePolicy::for_role(NodeRole::Bootstrap);
        assert_eq!(bootstrap.max_connections, 1000);
        assert!(bootstrap.dht_server_mode);
        assert!(!bootstrap.bootstrap_required);
        assert_eq!(bootstrap.k_bucket_size, 200);

        let light = RolePolicy::for_role(NodeRole::Light);
        assert!(!light.enable_dht);
        assert!(!light.enable_gossip);
        assert_eq!(light.max_connections, 10);
        assert_eq!(light.dht_update_interval, Duration::from_secs(120));

        let server = RolePolicy::for_role(NodeRole::Server);
        assert!(server.relay_messages);
        assert_eq!(server.max_connections, 100);
    }

    #[test]
    fn test_announce_interval_clamped() {
        let mut policy = RolePolicy::for_role(NodeRole::Full);
        policy.dht_update_interval = Duration::from_secs(1);
        assert_eq!(policy.announce_interval(), policy.min_dht_update_interval);
    }

    #[test]
    fn test_bootstrap_multiaddrs_derive() {
        for network in ["base", "sepolia"] {
            let set = bootstrap_set(network);
            assert_eq!(set.len(), 4);
            for peer in &set {
                let addr = peer.multiaddr().unwrap();
                let rendered = addr.to_string();
                assert!(rendered.contains(&peer.hostname));
                assert!(rendered.ends_with(&peer.peer_id));
                peer.parsed_peer_id().unwrap();
            }
        }
    }

    #[test]
    fn test_unknown_network_is_empty() {
        assert!(bootstrap_set("devnet").is_empty());
    }

    #[test]
    fn test_effective_role_promotion() {
        let options = NodeOptions {
            private_key: String::new(),
            network: "base".into(),
            node_type: NodeRole::Full,
            port: 0,
            agent_name: "bootstrap-2".into(),
            use_encryption: false,
            bootstrap_private_key: None,
            bootstrap_peers: None,
        };
        assert_eq!(options.effective_role(), NodeRole::Bootstrap);

        let plain = NodeOptions {
            agent_name: "alice".into(),
            ..options
        };
        assert_eq!(plain.effective_role(), NodeRole::Full);
    }
}
