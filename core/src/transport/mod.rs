// Overlay engine — owns the libp2p stack
//
// Brings the transport + security + muxer + DHT + pubsub stack up
// according to the role policy, dials the rendezvous set, and exposes
// a narrow async surface to the rest of the node. Individual dial
// failures are soft; a listener failure or an unreachable rendezvous
// set (for roles that require one) aborts startup.

pub mod behaviour;
pub mod swarm;

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::{BootstrapPeer, NodeRole, RolePolicy};

pub use behaviour::OverlayBehaviour;
pub use swarm::{OverlayEvent, SwarmHandle};

/// Per-attempt cap on a rendezvous dial.
const BOOTSTRAP_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between rendezvous dial attempts.
const BOOTSTRAP_DIAL_BACKOFF: Duration = Duration::from_secs(5);

/// DHT operation deadlines.
const DHT_GET_TIMEOUT: Duration = Duration::from_secs(10);
const DHT_PUT_TIMEOUT: Duration = Duration::from_secs(20);
const DHT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to bring the stack up.
pub struct OverlayConfig {
    pub policy: RolePolicy,
    pub keypair: libp2p::identity::Keypair,
    /// TCP listen port; 0 picks an ephemeral port.
    pub port: u16,
    /// Public DNS name a bootstrap peer advertises. Ignored for other
    /// roles.
    pub external_hostname: Option<String>,
    /// The rendezvous set for this deployment.
    pub bootstrap: Vec<BootstrapPeer>,
}

/// Running overlay stack. Cheap to clone; all clones drive the same
/// swarm task.
#[derive(Clone)]
pub struct OverlayEngine {
    peer_id: PeerId,
    handle: SwarmHandle,
    policy: RolePolicy,
    /// The dialable rendezvous set (own entry excluded), kept for
    /// connection maintenance.
    bootstrap: Vec<BootstrapPeer>,
}

impl OverlayEngine {
    /// Build the swarm, start listening, dial the rendezvous set, and
    /// hand back the engine. Events flow out on `event_tx` for the
    /// lifetime of the swarm task.
    pub async fn start(
        config: OverlayConfig,
        event_tx: mpsc::Sender<OverlayEvent>,
    ) -> Result<Self> {
        let OverlayConfig {
            policy,
            keypair,
            port,
            external_hostname,
            bootstrap,
        } = config;

        let local_peer_id = keypair.public().to_peer_id();
        tracing::info!(role = %policy.role, peer_id = %local_peer_id, "Starting overlay engine");

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )?
            .with_dns()?
            .with_behaviour(|key| {
                OverlayBehaviour::new(key, &policy).expect("Failed to create overlay behaviour")
            })?
            .with_swarm_config(|cfg| {
                cfg.with_idle_connection_timeout(Duration::from_secs(600))
            })
            .build();

        // A node that cannot listen cannot participate.
        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", port)
            .parse()
            .context("Invalid listen address")?;
        swarm
            .listen_on(listen_addr)
            .context("Failed to start overlay listener")?;

        if policy.role == NodeRole::Bootstrap {
            // Bootstrap peers are dialed by well-known DNS name; advertise
            // it so Identify hands the reachable address to everyone.
            if let Some(hostname) = &external_hostname {
                let external: Multiaddr = crate::config::host_multiaddr_string(hostname, port)
                    .parse()
                    .context("Invalid external hostname")?;
                tracing::info!("Advertising external address {}", external);
                swarm.add_external_address(external);
            }

            if policy.dht_server_mode {
                if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                    kademlia.set_mode(Some(libp2p::kad::Mode::Server));
                }
            }
        }

        // Seed the routing table and the gossip direct peers with the
        // rendezvous set. A bootstrap peer seeds the *other* bootstrap
        // peers; everyone else seeds all of them.
        let own_name_matches = |peer: &BootstrapPeer| {
            peer.parsed_peer_id()
                .map(|pid| pid == local_peer_id)
                .unwrap_or(false)
        };
        let dial_targets: Vec<BootstrapPeer> = bootstrap
            .iter()
            .filter(|peer| !own_name_matches(peer))
            .cloned()
            .collect();

        for peer in &dial_targets {
            let (Ok(pid), Ok(addr)) = (peer.parsed_peer_id(), peer.multiaddr()) else {
                tracing::warn!("Skipping malformed bootstrap entry {}", peer.name);
                continue;
            };
            if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                kademlia.add_address(&pid, addr);
            }
            if let Some(gossipsub) = swarm.behaviour_mut().gossipsub.as_mut() {
                gossipsub.add_explicit_peer(&pid);
            }
        }

        let handle = swarm::spawn_swarm_task(swarm, policy.clone(), event_tx);

        let engine = Self {
            peer_id: local_peer_id,
            handle,
            policy: policy.clone(),
            bootstrap: dial_targets.clone(),
        };

        engine.connect_bootstrap_set(&dial_targets).await?;

        // Walk the DHT once the rendezvous connections exist.
        if policy.enable_dht {
            let _ = engine.handle.trigger_bootstrap().await;
        }

        Ok(engine)
    }

    /// Dial every rendezvous peer with the per-role retry budget.
    async fn connect_bootstrap_set(&self, targets: &[BootstrapPeer]) -> Result<()> {
        if targets.is_empty() {
            if self.policy.bootstrap_required {
                bail!("No bootstrap peers configured and role {} requires one", self.policy.role);
            }
            return Ok(());
        }

        let attempts = if self.policy.role == NodeRole::Bootstrap {
            3
        } else {
            5
        };

        let dials = targets
            .iter()
            .map(|peer| self.dial_bootstrap_peer(peer, attempts));
        let results = futures::future::join_all(dials).await;
        let connected = results.iter().filter(|ok| **ok).count();

        tracing::info!(
            "Bootstrap dialing finished: {}/{} reachable",
            connected,
            targets.len()
        );

        if connected == 0 && self.policy.bootstrap_required {
            bail!(
                "No bootstrap peer reachable after {} attempts each",
                attempts
            );
        }
        Ok(())
    }

    async fn dial_bootstrap_peer(&self, peer: &BootstrapPeer, attempts: u32) -> bool {
        let (Ok(peer_id), Ok(addr)) = (peer.parsed_peer_id(), peer.multiaddr()) else {
            return false;
        };

        for attempt in 1..=attempts {
            if let Err(e) = self.handle.dial(addr.clone()).await {
                tracing::warn!(
                    "Bootstrap dial {} attempt {}/{} failed to start: {}",
                    peer.name,
                    attempt,
                    attempts,
                    e
                );
            } else if timeout(BOOTSTRAP_DIAL_TIMEOUT, self.wait_for_peer(peer_id))
                .await
                .is_ok()
            {
                tracing::info!("Connected to bootstrap {} ({})", peer.name, peer_id);
                return true;
            } else {
                tracing::warn!(
                    "Bootstrap dial {} attempt {}/{} timed out",
                    peer.name,
                    attempt,
                    attempts
                );
            }

            if attempt < attempts {
                tokio::time::sleep(BOOTSTRAP_DIAL_BACKOFF).await;
            }
        }
        false
    }

    /// Resolve once `peer_id` shows up in the connected set. Callers
    /// bound this with a timeout.
    async fn wait_for_peer(&self, peer_id: PeerId) {
        loop {
            match self.handle.connected_peers().await {
                Ok(peers) if peers.contains(&peer_id) => return,
                Ok(_) => {}
                Err(_) => return, // swarm gone; outer timeout reports failure
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn policy(&self) -> &RolePolicy {
        &self.policy
    }

    pub async fn listeners(&self) -> Result<Vec<Multiaddr>> {
        self.handle.listeners().await
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        self.handle.connected_peers().await
    }

    pub async fn dial(&self, addr: Multiaddr) -> Result<()> {
        self.handle.dial(addr).await
    }

    /// Best-effort direct connection to a peer already present in the
    /// routing table. The mesh routes regardless, so failure here only
    /// costs latency.
    pub async fn ensure_connected(&self, peer_id: PeerId) -> Result<()> {
        if self
            .handle
            .connected_peers()
            .await?
            .contains(&peer_id)
        {
            return Ok(());
        }
        self.handle.dial_peer(peer_id).await?;
        timeout(self.policy.dial_timeout, self.wait_for_peer(peer_id))
            .await
            .map_err(|_| anyhow!("Dial to {} timed out", peer_id))
    }

    /// One connection-maintenance sweep. When the connected set is
    /// below the role's minimum, re-dial rendezvous peers and the
    /// caller's known dialable entries, capped at the role's parallel
    /// dial budget. Failures are logged and counted, never fatal.
    /// Returns the number of connections restored.
    pub async fn maintain_connections(&self, known: &[(PeerId, Multiaddr)]) -> Result<usize> {
        let connected = self.handle.connected_peers().await?;
        if connected.len() >= self.policy.min_connections as usize {
            return Ok(0);
        }

        let mut candidates: Vec<(PeerId, Multiaddr)> = Vec::new();
        for peer in &self.bootstrap {
            if let (Ok(pid), Ok(addr)) = (peer.parsed_peer_id(), peer.multiaddr()) {
                candidates.push((pid, addr));
            }
        }
        candidates.extend(known.iter().cloned());

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|(pid, _)| {
            *pid != self.peer_id && !connected.contains(pid) && seen.insert(*pid)
        });
        candidates.truncate(self.policy.max_parallel_dials as usize);

        if candidates.is_empty() {
            return Ok(0);
        }
        tracing::debug!(
            "Below minimum of {} connection(s); dialing {} candidate(s)",
            self.policy.min_connections,
            candidates.len()
        );

        let dials = candidates.iter().map(|(pid, addr)| async move {
            if let Err(e) = self.handle.dial(addr.clone()).await {
                tracing::debug!("Maintenance dial of {} failed to start: {}", pid, e);
                return false;
            }
            timeout(self.policy.dial_timeout, self.wait_for_peer(*pid))
                .await
                .is_ok()
        });
        let restored = futures::future::join_all(dials)
            .await
            .into_iter()
            .filter(|connected| *connected)
            .count();

        if restored > 0 {
            tracing::info!("Connection maintenance restored {} peer(s)", restored);
        }
        Ok(restored)
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.handle.subscribe(topic).await
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        self.handle.publish(topic, data).await
    }

    /// Announce this node as a provider for `key`.
    pub async fn dht_provide(&self, key: &str) -> Result<()> {
        timeout(DHT_OP_TIMEOUT, self.handle.start_providing(key))
            .await
            .map_err(|_| anyhow!("DHT provide timed out"))?
    }

    /// Provider stream for `key`. Consumers apply their own deadline.
    pub async fn dht_find_providers(&self, key: &str) -> Result<mpsc::Receiver<PeerId>> {
        self.handle.find_providers(key).await
    }

    pub async fn dht_put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        timeout(DHT_PUT_TIMEOUT, self.handle.put_record(key, value))
            .await
            .map_err(|_| anyhow!("DHT put timed out"))?
    }

    /// Fetch a record; `None` for both missing records and deadline
    /// expiry; partial DHT failures are empty results, not errors.
    pub async fn dht_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match timeout(DHT_GET_TIMEOUT, self.handle.get_record(key)).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }

    pub async fn add_address(&self, peer_id: PeerId, addr: Multiaddr) -> Result<()> {
        self.handle.add_address(peer_id, addr).await
    }

    pub async fn routing_table_size(&self) -> usize {
        self.handle.routing_table_size().await.unwrap_or(0)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}
