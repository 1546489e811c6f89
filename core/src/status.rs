// Status broadcasting — periodic signed node telemetry
//
// Every node publishes a signed envelope on `node-status` whose content
// is a JSON report of its counters. Received reports are kept per
// sender address and age out after the TTL; the binding tables in the
// directory are unaffected by expiry here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Publish cadence.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(60);
/// Reports older than this are dropped on query.
pub const STATUS_TTL: Duration = Duration::from_secs(120);

/// Counters behind the status report. Increments are lock-free and
/// never suspend.
#[derive(Debug)]
pub struct NodeMetrics {
    started_at_ms: u64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    last_message_ms: AtomicU64,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            started_at_ms: crate::now_ms(),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            last_message_ms: AtomicU64::new(0),
        }
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.last_message_ms.store(crate::now_ms(), Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_ms.store(crate::now_ms(), Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn last_message_ms(&self) -> u64 {
        self.last_message_ms.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        crate::now_ms().saturating_sub(self.started_at_ms) / 1000
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// The telemetry payload inside a status envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMetrics {
    pub connected_peers: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub uptime_sec: u64,
    pub routing_table_size: usize,
    pub multiaddrs: Vec<String>,
    pub is_bootstrap: bool,
    pub last_message_ms: u64,
}

/// The full report: which overlay identity produced which metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub peer_id: String,
    pub metrics: StatusMetrics,
}

struct StoredReport {
    report: StatusReport,
    received_at_ms: u64,
}

/// Retained peer status reports with TTL expiry on query.
pub struct StatusTable {
    reports: RwLock<HashMap<Address, StoredReport>>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self {
            reports: RwLock::new(HashMap::new()),
        }
    }

    /// Store a verified report under its sender.
    pub fn insert(&self, from: Address, report: StatusReport) {
        self.reports.write().insert(
            from,
            StoredReport {
                report,
                received_at_ms: crate::now_ms(),
            },
        );
    }

    /// Drop everything past the TTL. Called by the purge task and
    /// implicitly by every query.
    pub fn purge_expired(&self) {
        let cutoff = crate::now_ms().saturating_sub(STATUS_TTL.as_millis() as u64);
        self.reports
            .write()
            .retain(|_, stored| stored.received_at_ms >= cutoff);
    }

    /// Live reports only.
    pub fn snapshot(&self) -> Vec<(Address, StatusReport)> {
        self.purge_expired();
        self.reports
            .read()
            .iter()
            .map(|(address, stored)| (*address, stored.report.clone()))
            .collect()
    }

    pub fn get(&self, address: Address) -> Option<StatusReport> {
        self.purge_expired();
        self.reports
            .read()
            .get(&address)
            .map(|stored| stored.report.clone())
    }

    #[cfg(test)]
    fn backdate(&self, address: Address, age: Duration) {
        if let Some(stored) = self.reports.write().get_mut(&address) {
            stored.received_at_ms = crate::now_ms().saturating_sub(age.as_millis() as u64);
        }
    }
}

impl Default for StatusTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(peers: usize) -> StatusReport {
        StatusReport {
            peer_id: "12D3KooWTestPeer".into(),
            metrics: StatusMetrics {
                connected_peers: peers,
                messages_sent: 1,
                messages_received: 2,
                uptime_sec: 3,
                routing_table_size: 4,
                multiaddrs: vec!["/ip4/127.0.0.1/tcp/1".into()],
                is_bootstrap: false,
                last_message_ms: 5,
            },
        }
    }

    #[test]
    fn test_metrics_counters() {
        let metrics = NodeMetrics::new();
        assert_eq!(metrics.messages_sent(), 0);

        metrics.record_sent();
        metrics.record_sent();
        metrics.record_received();

        assert_eq!(metrics.messages_sent(), 2);
        assert_eq!(metrics.messages_received(), 1);
        assert!(metrics.last_message_ms() > 0);
    }

    #[test]
    fn test_reports_survive_within_ttl() {
        let table = StatusTable::new();
        let from = Address::repeat_byte(0x01);

        table.insert(from, report(3));
        assert_eq!(table.get(from).unwrap().metrics.connected_peers, 3);
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn test_reports_expire_after_ttl() {
        let table = StatusTable::new();
        let from = Address::repeat_byte(0x02);

        table.insert(from, report(1));
        table.backdate(from, STATUS_TTL + Duration::from_secs(1));

        assert!(table.get(from).is_none());
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn test_newer_report_replaces_older() {
        let table = StatusTable::new();
        let from = Address::repeat_byte(0x03);

        table.insert(from, report(1));
        table.insert(from, report(9));

        assert_eq!(table.get(from).unwrap().metrics.connected_peers, 9);
    }

    #[test]
    fn test_status_report_wire_shape() {
        let json = serde_json::to_value(report(2)).unwrap();
        assert!(json.get("peerId").is_some());
        let metrics = json.get("metrics").unwrap();
        for field in [
            "connectedPeers",
            "messagesSent",
            "messagesReceived",
            "uptimeSec",
            "routingTableSize",
            "multiaddrs",
            "isBootstrap",
            "lastMessageMs",
        ] {
            assert!(metrics.get(field).is_some(), "missing field {}", field);
        }
    }
}
