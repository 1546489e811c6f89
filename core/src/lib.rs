// AgentMesh core — the overlay node
//
// An agent is a blockchain account that talks. Registration on the
// on-chain registry admits it to the overlay; from there the node
// publishes its address -> overlay identity binding, keeps a directory
// of everyone else's, and moves signed (optionally sealed) envelopes
// over the gossip mesh. A local gRPC control plane is the only door
// for client processes.

pub mod api;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod identity;
pub mod message;
pub mod registry;
pub mod status;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use directory::{Announcement, Directory, DirectoryEntry};
use message::{InboundMessage, SeenSet, TOPIC_ANNOUNCEMENTS, TOPIC_MESSAGES, TOPIC_STATUS};
use status::{NodeMetrics, StatusMetrics, StatusReport, StatusTable, STATUS_INTERVAL};
use transport::{OverlayConfig, OverlayEngine, OverlayEvent};

pub use config::{bootstrap_set, BootstrapPeer, NodeOptions, NodeRole, RolePolicy};
pub use identity::AgentKeys;
pub use registry::{AgentRecord, ContractRegistry, InMemoryRegistry, Registry, RegistryError};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Identity error: {0}")]
    Identity(String),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("No route to agent {0:#x}")]
    NoRoute(Address),
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Signature verification failed")]
    SignatureInvalid,
    #[error("Publish failed: {0}")]
    PublishFailed(String),
    #[error("Node is not running")]
    NotRunning,
    #[error("Node is already running")]
    AlreadyRunning,
    #[error("Node is shutting down")]
    Shutdown,
}

/// Node lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Events fanned out to control-plane streams.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected { peer_id: String },
    Message(InboundMessage),
    Error { code: String, message: String },
}

/// Capacity of the broadcast bus feeding API streams. Lagging
/// receivers lose the oldest events; fan-out is lossy by contract.
const EVENT_BUS_CAPACITY: usize = 256;

/// Bound on the inbound duplicate-suppression set.
const SEEN_SET_CAPACITY: usize = 1024;

/// Cadence of the status-table purge sweep.
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// AGENT NODE
// ============================================================================

/// The overlay node: identity, role policy, registry client, overlay
/// engine, directory, status table, and the local event bus.
pub struct AgentNode {
    options: NodeOptions,
    policy: RolePolicy,
    keys: AgentKeys,
    registry: Arc<dyn Registry>,
    directory: Arc<Directory>,
    status_table: Arc<StatusTable>,
    metrics: Arc<NodeMetrics>,
    seen: Mutex<SeenSet>,
    events: broadcast::Sender<NodeEvent>,
    state: RwLock<NodeState>,
    engine: RwLock<Option<OverlayEngine>>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentNode {
    /// Build a node from resolved options and a registry client.
    /// Derives the identity; fails on a malformed secret.
    pub fn new(options: NodeOptions, registry: Arc<dyn Registry>) -> Result<Self, NodeError> {
        if options.private_key.trim().is_empty() {
            return Err(NodeError::Config("PRIVATE_KEY is required".into()));
        }
        let keys = AgentKeys::from_hex(&options.private_key)
            .map_err(|e| NodeError::Identity(e.to_string()))?;

        let role = options.effective_role();
        let policy = RolePolicy::for_role(role);
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (stop_tx, _) = watch::channel(false);

        tracing::info!(
            address = %keys.address_hex(),
            role = %role,
            name = %options.agent_name,
            "Agent node created"
        );

        Ok(Self {
            directory: Arc::new(Directory::new(keys.address())),
            status_table: Arc::new(StatusTable::new()),
            metrics: Arc::new(NodeMetrics::new()),
            seen: Mutex::new(SeenSet::new(SEEN_SET_CAPACITY)),
            events,
            state: RwLock::new(NodeState::Created),
            engine: RwLock::new(None),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
            options,
            policy,
            keys,
            registry,
        })
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Register (if needed), bring the overlay up, subscribe the
    /// topics, and spawn the periodic tasks. Fatal errors leave the
    /// node in `Stopped`; the host process exits non-zero on them.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        {
            let mut state = self.state.write();
            match *state {
                NodeState::Created | NodeState::Stopped => *state = NodeState::Starting,
                _ => return Err(NodeError::AlreadyRunning),
            }
        }
        self.stop_tx.send_replace(false);

        match self.start_inner().await {
            Ok(()) => {
                *self.state.write() = NodeState::Running;
                tracing::info!("Agent node running");
                Ok(())
            }
            Err(e) => {
                *self.state.write() = NodeState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_inner(self: &Arc<Self>) -> Result<(), NodeError> {
        self.ensure_registered().await?;

        let external_hostname = self
            .options
            .bootstrap_set()
            .iter()
            .find(|peer| peer.name.eq_ignore_ascii_case(&self.options.agent_name))
            .map(|peer| peer.hostname.clone());

        let (event_tx, event_rx) = mpsc::channel(256);
        let engine = OverlayEngine::start(
            OverlayConfig {
                policy: self.policy.clone(),
                keypair: self.overlay_keypair()?,
                port: self.options.port,
                external_hostname,
                bootstrap: self.options.bootstrap_set(),
            },
            event_tx,
        )
        .await
        .map_err(|e| NodeError::Transport(e.to_string()))?;

        if self.policy.enable_gossip {
            for topic in [TOPIC_MESSAGES, TOPIC_ANNOUNCEMENTS, TOPIC_STATUS] {
                engine
                    .subscribe(topic)
                    .await
                    .map_err(|e| NodeError::Transport(e.to_string()))?;
            }
        }

        *self.engine.write() = Some(engine);

        self.spawn_overlay_loop(event_rx);
        self.spawn_maintenance_task();
        self.spawn_announce_task();
        self.spawn_status_task();
        self.spawn_purge_task();

        Ok(())
    }

    /// Cooperative shutdown: flip the stop signal, tear the swarm
    /// down, and wait for every periodic task to observe the signal.
    pub async fn stop(&self) -> Result<(), NodeError> {
        {
            let mut state = self.state.write();
            match *state {
                NodeState::Running | NodeState::Starting => *state = NodeState::Stopping,
                _ => return Err(NodeError::NotRunning),
            }
        }
        tracing::info!("Agent node stopping");

        self.stop_tx.send_replace(true);

        let engine = self.engine.write().take();
        if let Some(engine) = engine {
            let _ = engine.shutdown().await;
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        *self.state.write() = NodeState::Stopped;
        tracing::info!("Agent node stopped");
        Ok(())
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    /// Resolves once `stop()` has been initiated. The control plane
    /// uses this as its serve-with-shutdown signal.
    pub async fn wait_for_shutdown(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow() {
                return;
            }
            if stop_rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ------------------------------------------------------------------------
    // ACCESSORS
    // ------------------------------------------------------------------------

    pub fn address(&self) -> Address {
        self.keys.address()
    }

    pub fn address_hex(&self) -> String {
        self.keys.address_hex()
    }

    pub fn role(&self) -> NodeRole {
        self.policy.role
    }

    pub fn policy(&self) -> &RolePolicy {
        &self.policy
    }

    /// Overlay peer id; `None` before start.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.engine.read().as_ref().map(|engine| engine.peer_id())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Directory snapshot backing `ListAgents`.
    pub fn list_agents(&self) -> Vec<DirectoryEntry> {
        self.directory.snapshot()
    }

    /// Live (non-expired) status reports from peers.
    pub fn status_reports(&self) -> Vec<(Address, StatusReport)> {
        self.status_table.snapshot()
    }

    fn engine(&self) -> Option<OverlayEngine> {
        self.engine.read().clone()
    }

    fn running_engine(&self) -> Result<OverlayEngine, NodeError> {
        if self.state() != NodeState::Running {
            return Err(NodeError::NotRunning);
        }
        self.engine().ok_or(NodeError::NotRunning)
    }

    // ------------------------------------------------------------------------
    // MESSAGING
    // ------------------------------------------------------------------------

    /// Send `content` to another agent. Resolves the recipient, makes
    /// a best-effort direct connection, optionally seals the payload,
    /// then signs and publishes the envelope. Returns the message id.
    pub async fn send_message(
        &self,
        to: Address,
        content: Vec<u8>,
        conversation_id: Option<String>,
        reply_to: Option<String>,
    ) -> Result<String, NodeError> {
        let engine = self.running_engine()?;

        let Some(peer_id) = directory::resolve(&self.directory, &engine, to).await else {
            let error = NodeError::NoRoute(to);
            self.emit_error("NO_ROUTE", &error);
            return Err(error);
        };

        // Direct connectivity is a latency optimization; the mesh
        // routes either way.
        if let Err(e) = engine.ensure_connected(peer_id).await {
            tracing::debug!("Direct dial to {} failed, relying on mesh: {}", peer_id, e);
        }

        let (payload, encrypted) = if self.options.use_encryption {
            let recipient_key = self.registry.public_key(to).await.map_err(|e| {
                let error =
                    NodeError::Encryption(format!("no encryption key for {:#x}: {}", to, e));
                self.emit_error("ENCRYPTION_FAILED", &error);
                error
            })?;
            let sealed = crypto::seal_payload(&recipient_key, &content).map_err(|e| {
                let error = NodeError::Encryption(e.to_string());
                self.emit_error("ENCRYPTION_FAILED", &error);
                error
            })?;
            (sealed, true)
        } else {
            (content, false)
        };

        let envelope = message::build_signed(
            &self.keys,
            Some(to),
            payload,
            encrypted,
            conversation_id,
            reply_to,
        )
        .map_err(|e| NodeError::Identity(e.to_string()))?;

        let frame = message::encode_frame(&envelope)
            .map_err(|e| NodeError::PublishFailed(e.to_string()))?;

        engine.publish(TOPIC_MESSAGES, frame).await.map_err(|e| {
            let error = NodeError::PublishFailed(e.to_string());
            self.emit_error("PUBLISH_FAILED", &error);
            error
        })?;

        self.metrics.record_sent();
        tracing::debug!(message_id = %envelope.message_id, to = %format!("{:#x}", to), "Message published");
        Ok(envelope.message_id)
    }

    // ------------------------------------------------------------------------
    // STARTUP HELPERS
    // ------------------------------------------------------------------------

    async fn ensure_registered(&self) -> Result<(), NodeError> {
        let address = self.keys.address();
        if self.registry.is_registered(address).await? {
            tracing::info!("Agent {:#x} already registered", address);
            return Ok(());
        }

        let metadata = serde_json::json!({
            "publicKey": self.keys.encryption_public_key_hex(),
        })
        .to_string();

        self.registry
            .register(&self.options.agent_name, &metadata)
            .await?;
        tracing::info!("Agent {:#x} registered as {}", address, self.options.agent_name);
        Ok(())
    }

    fn overlay_keypair(&self) -> Result<libp2p::identity::Keypair, NodeError> {
        if self.policy.role == NodeRole::Bootstrap {
            if let Some(pinned_hex) = &self.options.bootstrap_private_key {
                let bytes = hex::decode(pinned_hex.trim().trim_start_matches("0x"))
                    .map_err(|_| NodeError::Config("BOOTSTRAP_PRIVATE_KEY is not hex".into()))?;
                return libp2p::identity::Keypair::ed25519_from_bytes(bytes).map_err(|e| {
                    NodeError::Config(format!("BOOTSTRAP_PRIVATE_KEY is not a keypair: {}", e))
                });
            }
            tracing::warn!("Bootstrap role without BOOTSTRAP_PRIVATE_KEY; peer id will rotate");
        }
        // Overlay identity is ephemeral for non-bootstrap roles.
        Ok(libp2p::identity::Keypair::generate_ed25519())
    }

    // ------------------------------------------------------------------------
    // EVENT PROCESSING
    // ------------------------------------------------------------------------

    fn spawn_overlay_loop(self: &Arc<Self>, mut event_rx: mpsc::Receiver<OverlayEvent>) {
        let node = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    event = event_rx.recv() => {
                        match event {
                            Some(event) => node.process_overlay_event(event),
                            None => break,
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn process_overlay_event(&self, event: OverlayEvent) {
        match event {
            OverlayEvent::PeerConnected(peer_id) => {
                // First directory signal. The entry stays provisional
                // until a provider hit or a verified announcement
                // completes the address binding.
                if self.directory.record_connection(peer_id) {
                    tracing::debug!("Peer {} connected; awaiting address binding", peer_id);
                }
                self.emit(NodeEvent::PeerConnected {
                    peer_id: peer_id.to_string(),
                });
            }
            OverlayEvent::PeerDisconnected(peer_id) => {
                // Drops the provisional entry if the binding never
                // completed; completed bindings are never eagerly
                // purged.
                self.directory.record_disconnection(&peer_id);
                tracing::debug!("Peer {} disconnected", peer_id);
            }
            OverlayEvent::GossipMessage { topic, data } => match topic.as_str() {
                TOPIC_MESSAGES => self.handle_message_frame(&data),
                TOPIC_ANNOUNCEMENTS => self.handle_announcement_frame(&data),
                TOPIC_STATUS => self.handle_status_frame(&data),
                other => tracing::trace!("Ignoring payload on unknown topic {}", other),
            },
            OverlayEvent::Listening(addr) => {
                tracing::debug!("Overlay listening on {}", addr);
            }
            OverlayEvent::Identified { peer_id, .. } => {
                tracing::trace!("Peer {} identified", peer_id);
            }
        }
    }

    fn handle_message_frame(&self, data: &[u8]) {
        let envelope = match message::decode_frame(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!("Dropping undecodable message frame: {}", e);
                return;
            }
        };

        let sender = match envelope.verify() {
            Ok(sender) => sender,
            Err(e) => {
                tracing::warn!(
                    "Dropping message {} with bad signature: {}",
                    envelope.message_id,
                    e
                );
                self.emit(NodeEvent::Error {
                    code: "SIGNATURE_INVALID".into(),
                    message: format!("dropped message claiming sender {}", envelope.from_agent_id),
                });
                return;
            }
        };

        // Our own publishes come back around the mesh.
        if sender == self.keys.address() {
            return;
        }

        // Delivery is strictly addressed: wrong recipients and
        // broadcast intents alike are dropped silently.
        match envelope.to() {
            Ok(Some(to)) if to == self.keys.address() => {}
            _ => {
                tracing::trace!("Message {} not addressed to us", envelope.message_id);
                return;
            }
        }

        if !self.seen.lock().insert(&envelope.message_id, sender) {
            tracing::trace!("Duplicate message {} suppressed", envelope.message_id);
            return;
        }

        let content = if envelope.encrypted {
            match crypto::open_payload(&self.keys, &envelope.content) {
                Ok(plaintext) => plaintext,
                Err(_) => {
                    // Mixed deployments: an unencrypted sender may still
                    // set the flag. Informational, not an error.
                    tracing::debug!(
                        "Decryption fallback for {}: treating content as plaintext",
                        envelope.message_id
                    );
                    envelope.content.clone()
                }
            }
        } else {
            envelope.content.clone()
        };

        self.metrics.record_received();
        self.emit(NodeEvent::Message(InboundMessage {
            message_id: envelope.message_id,
            from: sender,
            to: self.keys.address(),
            content,
            timestamp: envelope.timestamp,
        }));
    }

    fn handle_announcement_frame(&self, data: &[u8]) {
        let envelope = match message::decode_frame(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!("Dropping undecodable announcement: {}", e);
                return;
            }
        };

        let sender = match envelope.verify() {
            Ok(sender) => sender,
            Err(e) => {
                tracing::warn!("Dropping announcement with bad signature: {}", e);
                return;
            }
        };
        if sender == self.keys.address() {
            return;
        }

        let announcement: Announcement = match serde_json::from_slice(&envelope.content) {
            Ok(announcement) => announcement,
            Err(e) => {
                tracing::debug!("Dropping malformed announcement from {:#x}: {}", sender, e);
                return;
            }
        };

        // The announced address must be the signer; anything else is a
        // forged binding.
        match announcement.address.parse::<Address>() {
            Ok(announced) if announced == sender => {
                self.directory.apply_announcement(sender, &announcement);
                tracing::debug!(
                    "Directory learned {:#x} -> {} via announcement",
                    sender,
                    announcement.peer_id
                );
            }
            _ => {
                tracing::warn!(
                    "Announcement signer {:#x} does not match announced address {}",
                    sender,
                    announcement.address
                );
            }
        }
    }

    fn handle_status_frame(&self, data: &[u8]) {
        let envelope = match message::decode_frame(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!("Dropping undecodable status report: {}", e);
                return;
            }
        };

        let sender = match envelope.verify() {
            Ok(sender) => sender,
            Err(e) => {
                tracing::warn!("Dropping status report with bad signature: {}", e);
                return;
            }
        };
        if sender == self.keys.address() {
            return;
        }

        match serde_json::from_slice::<StatusReport>(&envelope.content) {
            Ok(report) => self.status_table.insert(sender, report),
            Err(e) => tracing::debug!("Dropping malformed status report: {}", e),
        }
    }

    // ------------------------------------------------------------------------
    // PERIODIC TASKS
    // ------------------------------------------------------------------------

    /// Keep the connected set above the role's minimum by re-dialing
    /// rendezvous peers and known directory entries.
    fn spawn_maintenance_task(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let interval = self.policy.auto_dial_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The startup dial just ran; skip the immediate tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        node.maintain_connections_once().await;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn maintain_connections_once(&self) {
        let Some(engine) = self.engine() else {
            return;
        };
        let known = self.directory.dial_candidates();
        match engine.maintain_connections(&known).await {
            Ok(restored) if restored > 0 => {
                tracing::debug!("Auto-dial restored {} connection(s)", restored);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Connection maintenance skipped: {}", e),
        }
    }

    /// Publish our own binding: DHT provide plus a signed announcement.
    fn spawn_announce_task(self: &Arc<Self>) {
        // A LIGHT node neither provides nor announces.
        if !self.policy.enable_gossip && !self.policy.enable_dht {
            return;
        }

        let node = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let interval = self.policy.announce_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        node.announce_once().await;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn announce_once(&self) {
        let Some(engine) = self.engine() else {
            return;
        };

        if self.policy.enable_dht {
            let key = directory::dht_key(self.keys.address());
            if let Err(e) = engine.dht_provide(&key).await {
                tracing::debug!("DHT provide failed: {}", e);
            }
        }

        if !self.policy.enable_gossip {
            return;
        }

        let listeners = engine.listeners().await.unwrap_or_default();
        let announcement = Announcement {
            peer_id: engine.peer_id().to_string(),
            address: self.keys.address_hex(),
            display_name: self.options.agent_name.clone(),
            multiaddrs: listeners.iter().map(|addr| addr.to_string()).collect(),
            timestamp: now_ms(),
        };

        let content = match serde_json::to_vec(&announcement) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Announcement encoding failed: {}", e);
                return;
            }
        };

        match message::build_signed(&self.keys, None, content, false, None, None)
            .and_then(|envelope| message::encode_frame(&envelope))
        {
            Ok(frame) => {
                if let Err(e) = engine.publish(TOPIC_ANNOUNCEMENTS, frame).await {
                    tracing::debug!("Announcement publish failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("Announcement signing failed: {}", e),
        }
    }

    /// Periodic signed telemetry on `node-status`.
    fn spawn_status_task(self: &Arc<Self>) {
        if !self.policy.enable_gossip {
            return;
        }

        let node = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        node.broadcast_status_once().await;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn broadcast_status_once(&self) {
        let Some(engine) = self.engine() else {
            return;
        };

        let connected = engine.connected_peers().await.unwrap_or_default();
        let listeners = engine.listeners().await.unwrap_or_default();
        let report = StatusReport {
            peer_id: engine.peer_id().to_string(),
            metrics: StatusMetrics {
                connected_peers: connected.len(),
                messages_sent: self.metrics.messages_sent(),
                messages_received: self.metrics.messages_received(),
                uptime_sec: self.metrics.uptime_secs(),
                routing_table_size: engine.routing_table_size().await,
                multiaddrs: listeners.iter().map(|addr| addr.to_string()).collect(),
                is_bootstrap: self.policy.role == NodeRole::Bootstrap,
                last_message_ms: self.metrics.last_message_ms(),
            },
        };

        let content = match serde_json::to_vec(&report) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Status encoding failed: {}", e);
                return;
            }
        };

        match message::build_signed(&self.keys, None, content, false, None, None)
            .and_then(|envelope| message::encode_frame(&envelope))
        {
            Ok(frame) => {
                if let Err(e) = engine.publish(TOPIC_STATUS, frame).await {
                    tracing::debug!("Status publish failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("Status signing failed: {}", e),
        }
    }

    fn spawn_purge_task(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        node.status_table.purge_expired();
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn emit(&self, event: NodeEvent) {
        // No receivers is fine; fan-out is best-effort by contract.
        let _ = self.events.send(event);
    }

    fn emit_error(&self, code: &str, error: &NodeError) {
        self.emit(NodeEvent::Error {
            code: code.to_string(),
            message: error.to_string(),
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn options_with_key(private_key: &str) -> NodeOptions {
        NodeOptions {
            private_key: private_key.to_string(),
            network: "base".into(),
            node_type: NodeRole::Full,
            port: 0,
            agent_name: "test-agent".into(),
            use_encryption: false,
            bootstrap_private_key: None,
            bootstrap_peers: Some(Vec::new()),
        }
    }

    fn test_node() -> Arc<AgentNode> {
        use rand::RngCore;
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let secret_hex = hex::encode(secret);

        let options = options_with_key(&secret_hex);
        let keys = AgentKeys::from_hex(&secret_hex).unwrap();
        let registry = Arc::new(InMemoryRegistry::new(keys.address()));
        Arc::new(AgentNode::new(options, registry).unwrap())
    }

    #[test]
    fn test_node_starts_in_created_state() {
        let node = test_node();
        assert_eq!(node.state(), NodeState::Created);
        assert!(!node.is_running());
        assert!(node.peer_id().is_none());
        assert!(node.list_agents().is_empty());
    }

    #[test]
    fn test_rejects_missing_or_bad_secret() {
        let registry = Arc::new(InMemoryRegistry::new(Address::ZERO));

        let empty = AgentNode::new(options_with_key("  "), registry.clone());
        assert!(matches!(empty, Err(NodeError::Config(_))));

        let garbage = AgentNode::new(options_with_key("zz"), registry);
        assert!(matches!(garbage, Err(NodeError::Identity(_))));
    }

    #[tokio::test]
    async fn test_send_requires_running_node() {
        let node = test_node();
        let result = node
            .send_message(Address::repeat_byte(0x01), b"hi".to_vec(), None, None)
            .await;
        assert!(matches!(result, Err(NodeError::NotRunning)));
    }

    #[tokio::test]
    async fn test_stop_requires_running_node() {
        let node = test_node();
        assert!(matches!(node.stop().await, Err(NodeError::NotRunning)));
    }

    #[test]
    fn test_event_bus_fanout() {
        let node = test_node();
        let mut first = node.subscribe_events();
        let mut second = node.subscribe_events();

        node.emit(NodeEvent::PeerConnected {
            peer_id: "12D3KooWTest".into(),
        });

        for receiver in [&mut first, &mut second] {
            match receiver.try_recv().unwrap() {
                NodeEvent::PeerConnected { peer_id } => assert_eq!(peer_id, "12D3KooWTest"),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_tampered_signature_never_reaches_bus() {
        let node = test_node();
        let sender = AgentKeys::generate();
        let mut receiver = node.subscribe_events();

        let mut envelope = message::build_signed(
            &sender,
            Some(node.address()),
            b"hello".to_vec(),
            false,
            None,
            None,
        )
        .unwrap();
        // Flip one signature byte.
        let mut raw = hex::decode(&envelope.signature).unwrap();
        raw[0] ^= 0xFF;
        envelope.signature = hex::encode(raw);

        let frame = serde_json::to_vec(&message::GossipFrame { message: envelope }).unwrap();
        node.handle_message_frame(&frame);

        // The only bus traffic is the SignatureInvalid error event.
        match receiver.try_recv().unwrap() {
            NodeEvent::Error { code, .. } => assert_eq!(code, "SIGNATURE_INVALID"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_message_for_other_recipient_is_silent() {
        let node = test_node();
        let sender = AgentKeys::generate();
        let third_party = AgentKeys::generate();
        let mut receiver = node.subscribe_events();

        let envelope = message::build_signed(
            &sender,
            Some(third_party.address()),
            b"hi".to_vec(),
            false,
            None,
            None,
        )
        .unwrap();
        let frame = message::encode_frame(&envelope).unwrap();
        node.handle_message_frame(&frame);

        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_addressed_message_is_delivered_once() {
        let node = test_node();
        let sender = AgentKeys::generate();
        let mut receiver = node.subscribe_events();

        let envelope = message::build_signed(
            &sender,
            Some(node.address()),
            b"hello".to_vec(),
            false,
            None,
            None,
        )
        .unwrap();
        let frame = message::encode_frame(&envelope).unwrap();

        node.handle_message_frame(&frame);
        node.handle_message_frame(&frame); // duplicate: suppressed

        match receiver.try_recv().unwrap() {
            NodeEvent::Message(message) => {
                assert_eq!(message.from, sender.address());
                assert_eq!(message.to, node.address());
                assert_eq!(message.content, b"hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_sealed_message_is_opened() {
        let node = test_node();
        let sender = AgentKeys::generate();
        let mut receiver = node.subscribe_events();

        // Seal for the node using the key it would publish in metadata.
        let node_public = {
            let probe = AgentKeys::from_hex(&node.options.private_key).unwrap();
            probe.encryption_public_key()
        };
        let sealed = crypto::seal_payload(&node_public, b"secret").unwrap();

        let envelope =
            message::build_signed(&sender, Some(node.address()), sealed, true, None, None).unwrap();
        let frame = message::encode_frame(&envelope).unwrap();
        node.handle_message_frame(&frame);

        match receiver.try_recv().unwrap() {
            NodeEvent::Message(message) => assert_eq!(message.content, b"secret"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_encrypted_flag_with_plaintext_falls_back() {
        let node = test_node();
        let sender = AgentKeys::generate();
        let mut receiver = node.subscribe_events();

        // Sender claims encryption but the bytes are plain UTF-8.
        let envelope = message::build_signed(
            &sender,
            Some(node.address()),
            b"plain despite flag".to_vec(),
            true,
            None,
            None,
        )
        .unwrap();
        let frame = message::encode_frame(&envelope).unwrap();
        node.handle_message_frame(&frame);

        match receiver.try_recv().unwrap() {
            NodeEvent::Message(message) => assert_eq!(message.content, b"plain despite flag"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_connection_event_creates_provisional_entry() {
        let node = test_node();
        let peer_keys = AgentKeys::generate();
        let peer_id = PeerId::random();

        node.process_overlay_event(OverlayEvent::PeerConnected(peer_id));

        // Provisional: tracked as pending, absent from ListAgents.
        assert_eq!(node.directory.pending_peers(), vec![peer_id]);
        assert!(node.list_agents().is_empty());

        // A verified announcement completes the binding.
        let announcement = Announcement {
            peer_id: peer_id.to_string(),
            address: peer_keys.address_hex(),
            display_name: "bob".into(),
            multiaddrs: vec![],
            timestamp: now_ms(),
        };
        let content = serde_json::to_vec(&announcement).unwrap();
        let envelope = message::build_signed(&peer_keys, None, content, false, None, None).unwrap();
        let frame = message::encode_frame(&envelope).unwrap();
        node.handle_announcement_frame(&frame);

        assert!(node.directory.pending_peers().is_empty());
        let agents = node.list_agents();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].peer_id, peer_id);
    }

    #[test]
    fn test_disconnect_before_binding_forgets_peer() {
        let node = test_node();
        let peer_id = PeerId::random();

        node.process_overlay_event(OverlayEvent::PeerConnected(peer_id));
        node.process_overlay_event(OverlayEvent::PeerDisconnected(peer_id));

        assert!(node.directory.pending_peers().is_empty());
        assert!(node.list_agents().is_empty());
    }

    #[test]
    fn test_forged_announcement_is_rejected() {
        let node = test_node();
        let honest = AgentKeys::generate();
        let victim = AgentKeys::generate();

        // Signed by `honest` but announcing `victim`'s address.
        let announcement = Announcement {
            peer_id: PeerId::random().to_string(),
            address: victim.address_hex(),
            display_name: "imposter".into(),
            multiaddrs: vec![],
            timestamp: now_ms(),
        };
        let content = serde_json::to_vec(&announcement).unwrap();
        let envelope = message::build_signed(&honest, None, content, false, None, None).unwrap();
        let frame = message::encode_frame(&envelope).unwrap();

        node.handle_announcement_frame(&frame);
        assert!(node.list_agents().is_empty());
    }

    #[test]
    fn test_valid_announcement_populates_directory() {
        let node = test_node();
        let peer_keys = AgentKeys::generate();
        let peer_id = PeerId::random();

        let announcement = Announcement {
            peer_id: peer_id.to_string(),
            address: peer_keys.address_hex(),
            display_name: "bob".into(),
            multiaddrs: vec!["/ip4/127.0.0.1/tcp/9001".into()],
            timestamp: now_ms(),
        };
        let content = serde_json::to_vec(&announcement).unwrap();
        let envelope = message::build_signed(&peer_keys, None, content, false, None, None).unwrap();
        let frame = message::encode_frame(&envelope).unwrap();

        node.handle_announcement_frame(&frame);

        let agents = node.list_agents();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].address, peer_keys.address());
        assert_eq!(agents[0].peer_id, peer_id);
        assert_eq!(agents[0].display_name.as_deref(), Some("bob"));
    }

    #[test]
    fn test_status_report_is_stored_under_sender() {
        let node = test_node();
        let peer_keys = AgentKeys::generate();

        let report = StatusReport {
            peer_id: PeerId::random().to_string(),
            metrics: StatusMetrics {
                connected_peers: 5,
                messages_sent: 1,
                messages_received: 2,
                uptime_sec: 60,
                routing_table_size: 9,
                multiaddrs: vec![],
                is_bootstrap: false,
                last_message_ms: 0,
            },
        };
        let content = serde_json::to_vec(&report).unwrap();
        let envelope = message::build_signed(&peer_keys, None, content, false, None, None).unwrap();
        let frame = message::encode_frame(&envelope).unwrap();

        node.handle_status_frame(&frame);

        let reports = node.status_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, peer_keys.address());
        assert_eq!(reports[0].1.metrics.connected_peers, 5);
    }
}
