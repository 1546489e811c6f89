// Directory — the eventually consistent account → overlay identity map
//
// Three write sources feed it, in increasing trust: bare connection
// events (peer id only; the binding completes on a later DHT hit),
// provider hits on "/eth/<address>", and verified announcements on the
// agent-announcements topic. Bindings are corrected on conflict, never
// eagerly purged; only status telemetry ages out (see status.rs).
//
// All reads and writes go through one RwLock held strictly within a
// call, never across an await point.

use std::collections::HashMap;
use std::time::Duration;

use alloy::primitives::Address;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::transport::OverlayEngine;

/// Cap on waiting for the first provider of a lookup.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// The DHT namespace the directory owns.
pub fn dht_key(address: Address) -> String {
    format!("/eth/{:#x}", address)
}

/// A signed directory announcement, carried as the content of an
/// envelope on `agent-announcements`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub peer_id: String,
    pub address: String,
    pub display_name: String,
    pub multiaddrs: Vec<String>,
    pub timestamp: u64,
}

/// One row of the `ListAgents` snapshot.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub address: Address,
    pub peer_id: PeerId,
    pub display_name: Option<String>,
    /// Milliseconds since epoch of the first evidence for this entry.
    pub observed_at: u64,
}

#[derive(Default)]
struct Tables {
    addr_to_peer: HashMap<Address, PeerId>,
    peer_to_addr: HashMap<PeerId, Address>,
    names: HashMap<Address, String>,
    multiaddrs: HashMap<Address, Vec<Multiaddr>>,
    observed_at: HashMap<Address, u64>,
    /// Connected peers whose account address is not yet known, with
    /// the connection timestamp. Provisional: absent from snapshots.
    pending_peers: HashMap<PeerId, u64>,
}

/// The in-memory peer directory.
pub struct Directory {
    self_address: Address,
    tables: RwLock<Tables>,
}

impl Directory {
    pub fn new(self_address: Address) -> Self {
        Self {
            self_address,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// First write source: a bare connection event. Supplies only the
    /// peer id; the entry stays provisional until a provider hit or a
    /// verified announcement supplies the account address. Returns
    /// `true` when a new provisional entry was created.
    pub fn record_connection(&self, peer_id: PeerId) -> bool {
        let mut tables = self.tables.write();
        if tables.peer_to_addr.contains_key(&peer_id) {
            return false;
        }
        tables
            .pending_peers
            .insert(peer_id, crate::now_ms())
            .is_none()
    }

    /// A provisional peer that disconnects before its binding completes
    /// is forgotten. Completed bindings are never eagerly purged.
    pub fn record_disconnection(&self, peer_id: &PeerId) {
        self.tables.write().pending_peers.remove(peer_id);
    }

    /// Peers connected but not yet bound to an address.
    pub fn pending_peers(&self) -> Vec<PeerId> {
        self.tables.read().pending_peers.keys().copied().collect()
    }

    /// Record a `(address, peer id)` binding from a provider hit or a
    /// completed connection lookup. Self never enters the directory;
    /// a conflicting older binding is corrected in both tables. A
    /// provisional connection entry for the peer is consumed, keeping
    /// its timestamp as the entry's first evidence.
    pub fn record_binding(&self, address: Address, peer_id: PeerId) {
        if address == self.self_address {
            return;
        }

        let mut tables = self.tables.write();
        let pending_since = tables.pending_peers.remove(&peer_id);

        if let Some(previous) = tables.addr_to_peer.insert(address, peer_id) {
            if previous != peer_id {
                tracing::debug!(
                    "Directory binding for {:#x} corrected: {} -> {}",
                    address,
                    previous,
                    peer_id
                );
                tables.peer_to_addr.remove(&previous);
            }
        }
        tables.peer_to_addr.insert(peer_id, address);
        let observed = pending_since.unwrap_or_else(crate::now_ms);
        tables.observed_at.entry(address).or_insert(observed);
    }

    /// Apply a verified announcement. The caller has already checked
    /// the envelope signature and that the signer equals `address`.
    pub fn apply_announcement(&self, address: Address, announcement: &Announcement) {
        let Ok(peer_id) = announcement.peer_id.parse::<PeerId>() else {
            tracing::warn!(
                "Announcement from {:#x} carries an unparsable peer id",
                address
            );
            return;
        };
        if address == self.self_address {
            return;
        }

        self.record_binding(address, peer_id);

        let mut tables = self.tables.write();
        if !announcement.display_name.is_empty() {
            tables
                .names
                .insert(address, announcement.display_name.clone());
        }
        let addrs: Vec<Multiaddr> = announcement
            .multiaddrs
            .iter()
            .filter_map(|raw| raw.parse().ok())
            .collect();
        if !addrs.is_empty() {
            tables.multiaddrs.insert(address, addrs);
        }
        tables.observed_at.insert(address, crate::now_ms());
    }

    pub fn lookup_local(&self, address: Address) -> Option<PeerId> {
        self.tables.read().addr_to_peer.get(&address).copied()
    }

    pub fn address_of(&self, peer_id: &PeerId) -> Option<Address> {
        self.tables.read().peer_to_addr.get(peer_id).copied()
    }

    pub fn display_name(&self, address: Address) -> Option<String> {
        self.tables.read().names.get(&address).cloned()
    }

    pub fn multiaddrs(&self, address: Address) -> Vec<Multiaddr> {
        self.tables
            .read()
            .multiaddrs
            .get(&address)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().addr_to_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().addr_to_peer.is_empty()
    }

    /// Entries that can back an active dial attempt: a bound peer id
    /// plus its last announced multiaddrs.
    pub fn dial_candidates(&self) -> Vec<(PeerId, Multiaddr)> {
        let tables = self.tables.read();
        tables
            .addr_to_peer
            .iter()
            .filter_map(|(address, peer_id)| {
                tables
                    .multiaddrs
                    .get(address)
                    .and_then(|addrs| addrs.first())
                    .map(|addr| (*peer_id, addr.clone()))
            })
            .collect()
    }

    /// Point-in-time copy for `ListAgents` and tests.
    pub fn snapshot(&self) -> Vec<DirectoryEntry> {
        let tables = self.tables.read();
        tables
            .addr_to_peer
            .iter()
            .map(|(address, peer_id)| DirectoryEntry {
                address: *address,
                peer_id: *peer_id,
                display_name: tables.names.get(address).cloned(),
                observed_at: tables.observed_at.get(address).copied().unwrap_or(0),
            })
            .collect()
    }
}

/// Resolve an address to an overlay peer id: local table first, then a
/// capped provider query against "/eth/<address>". `None` means no
/// route is currently known.
pub async fn resolve(
    directory: &Directory,
    engine: &OverlayEngine,
    address: Address,
) -> Option<PeerId> {
    if let Some(peer_id) = directory.lookup_local(address) {
        return Some(peer_id);
    }

    let key = dht_key(address);
    let mut providers = match engine.dht_find_providers(&key).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("Provider query for {} failed to start: {}", key, e);
            return None;
        }
    };

    // First provider wins; the deadline turns a silent DHT into a
    // clean NotFound.
    match tokio::time::timeout(LOOKUP_TIMEOUT, providers.recv()).await {
        Ok(Some(peer_id)) => {
            directory.record_binding(address, peer_id);
            Some(peer_id)
        }
        Ok(None) | Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn peer() -> PeerId {
        PeerId::random()
    }

    fn announcement(peer_id: &PeerId, address: Address, name: &str) -> Announcement {
        Announcement {
            peer_id: peer_id.to_string(),
            address: format!("{:#x}", address),
            display_name: name.to_string(),
            multiaddrs: vec!["/ip4/127.0.0.1/tcp/9000".to_string()],
            timestamp: crate::now_ms(),
        }
    }

    #[test]
    fn test_binding_roundtrip() {
        let directory = Directory::new(addr(0xff));
        let (a, p) = (addr(0x01), peer());

        directory.record_binding(a, p);
        assert_eq!(directory.lookup_local(a), Some(p));
        assert_eq!(directory.address_of(&p), Some(a));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_self_never_enters() {
        let own = addr(0xff);
        let directory = Directory::new(own);

        directory.record_binding(own, peer());
        assert!(directory.is_empty());

        let p = peer();
        directory.apply_announcement(own, &announcement(&p, own, "self"));
        assert!(directory.is_empty());
    }

    #[test]
    fn test_conflicting_binding_is_corrected() {
        let directory = Directory::new(addr(0xff));
        let a = addr(0x01);
        let (old, new) = (peer(), peer());

        directory.record_binding(a, old);
        directory.record_binding(a, new);

        assert_eq!(directory.lookup_local(a), Some(new));
        assert_eq!(directory.address_of(&old), None);
        assert_eq!(directory.address_of(&new), Some(a));
    }

    #[test]
    fn test_announcement_populates_entry() {
        let directory = Directory::new(addr(0xff));
        let a = addr(0x02);
        let p = peer();

        directory.apply_announcement(a, &announcement(&p, a, "bob"));

        assert_eq!(directory.lookup_local(a), Some(p));
        assert_eq!(directory.display_name(a), Some("bob".to_string()));
        assert_eq!(directory.multiaddrs(a).len(), 1);

        let snapshot = directory.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address, a);
        assert!(snapshot[0].observed_at > 0);
    }

    #[test]
    fn test_connection_is_provisional() {
        let directory = Directory::new(addr(0xff));
        let p = peer();

        assert!(directory.record_connection(p));
        // Repeated connection events do not create fresh entries.
        assert!(!directory.record_connection(p));

        assert_eq!(directory.pending_peers(), vec![p]);
        // Provisional peers never appear in snapshots.
        assert!(directory.snapshot().is_empty());
        assert!(directory.is_empty());
    }

    #[test]
    fn test_binding_completes_provisional_entry() {
        let directory = Directory::new(addr(0xff));
        let (a, p) = (addr(0x04), peer());

        assert!(directory.record_connection(p));
        directory.record_binding(a, p);

        assert!(directory.pending_peers().is_empty());
        let snapshot = directory.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].peer_id, p);
        // The connection time survives as the entry's first evidence.
        assert!(snapshot[0].observed_at > 0);
    }

    #[test]
    fn test_disconnection_clears_provisional_only() {
        let directory = Directory::new(addr(0xff));
        let (a, bound) = (addr(0x05), peer());
        let transient = peer();

        directory.record_binding(a, bound);
        directory.record_connection(transient);
        directory.record_disconnection(&transient);
        directory.record_disconnection(&bound);

        assert!(directory.pending_peers().is_empty());
        // The completed binding is untouched.
        assert_eq!(directory.lookup_local(a), Some(bound));
    }

    #[test]
    fn test_connection_after_binding_is_not_pending() {
        let directory = Directory::new(addr(0xff));
        let (a, p) = (addr(0x06), peer());

        directory.record_binding(a, p);
        assert!(!directory.record_connection(p));
        assert!(directory.pending_peers().is_empty());
    }

    #[test]
    fn test_dial_candidates_from_announced_entries() {
        let directory = Directory::new(addr(0xff));
        let a = addr(0x07);
        let p = peer();

        // A bare binding carries no addresses to dial.
        directory.record_binding(a, p);
        assert!(directory.dial_candidates().is_empty());

        directory.apply_announcement(a, &announcement(&p, a, "bob"));
        let candidates = directory.dial_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0, p);
    }

    #[test]
    fn test_announcement_with_bad_peer_id_is_ignored() {
        let directory = Directory::new(addr(0xff));
        let a = addr(0x03);
        let mut ann = announcement(&peer(), a, "carol");
        ann.peer_id = "not-a-peer-id".into();

        directory.apply_announcement(a, &ann);
        assert!(directory.is_empty());
    }
}
