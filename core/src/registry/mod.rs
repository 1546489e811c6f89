// Registry client — the on-chain gate for overlay membership
//
// The registry answers three questions: is this address a registered
// agent, what is its metadata (which by convention carries the
// encryption public key), and, once at startup, "register me".
// Nothing here is cached as authoritative; callers own retry policy.

pub mod contract;

use std::collections::HashMap;

use alloy::primitives::Address;
use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

pub use contract::ContractRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Agent {0} is not registered")]
    NotFound(Address),
    #[error("Agent metadata is malformed: {0}")]
    MalformedMetadata(String),
    #[error("Registry RPC failed: {0}")]
    Rpc(String),
}

/// One agent's on-chain record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub name: String,
    /// Free-form JSON; by convention carries `publicKey` as hex.
    pub metadata: String,
    /// Opaque to the overlay.
    pub reputation: u64,
    pub is_active: bool,
    pub is_blocked: bool,
    /// Seconds since epoch.
    pub registration_time: u64,
}

impl AgentRecord {
    /// An agent may participate iff active and not blocked.
    pub fn eligible(&self) -> bool {
        self.is_active && !self.is_blocked
    }

    /// Parse `metadata.publicKey` into raw key bytes.
    pub fn public_key(&self) -> Result<Vec<u8>, RegistryError> {
        let value: serde_json::Value = serde_json::from_str(&self.metadata)
            .map_err(|e| RegistryError::MalformedMetadata(format!("not JSON: {}", e)))?;
        let key_hex = value
            .get("publicKey")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RegistryError::MalformedMetadata("missing publicKey".into()))?;
        hex::decode(key_hex.trim_start_matches("0x"))
            .map_err(|e| RegistryError::MalformedMetadata(format!("publicKey not hex: {}", e)))
    }
}

/// The registry operations the node depends on. `ContractRegistry` is
/// the production implementation; `InMemoryRegistry` backs tests and
/// local development.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn is_registered(&self, address: Address) -> Result<bool, RegistryError>;

    /// Full record for `address`; `NotFound` when unregistered.
    async fn agent_info(&self, address: Address) -> Result<AgentRecord, RegistryError>;

    /// Register the caller. Write-once: implementations treat "already
    /// registered" as success.
    async fn register(&self, name: &str, metadata_json: &str) -> Result<(), RegistryError>;

    /// Convenience: the encryption public key from `metadata.publicKey`.
    async fn public_key(&self, address: Address) -> Result<Vec<u8>, RegistryError> {
        self.agent_info(address).await?.public_key()
    }
}

/// Stub registry holding records in memory. Stands in for the contract
/// in integration scenarios and single-machine deployments.
pub struct InMemoryRegistry {
    own_address: Address,
    records: RwLock<HashMap<Address, AgentRecord>>,
}

impl InMemoryRegistry {
    pub fn new(own_address: Address) -> Self {
        Self {
            own_address,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Seed a record, e.g. a peer's encryption key in tests.
    pub fn insert(&self, address: Address, record: AgentRecord) {
        self.records.write().insert(address, record);
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn is_registered(&self, address: Address) -> Result<bool, RegistryError> {
        Ok(self.records.read().contains_key(&address))
    }

    async fn agent_info(&self, address: Address) -> Result<AgentRecord, RegistryError> {
        self.records
            .read()
            .get(&address)
            .cloned()
            .ok_or(RegistryError::NotFound(address))
    }

    async fn register(&self, name: &str, metadata_json: &str) -> Result<(), RegistryError> {
        let mut records = self.records.write();
        if records.contains_key(&self.own_address) {
            return Ok(());
        }
        records.insert(
            self.own_address,
            AgentRecord {
                name: name.to_string(),
                metadata: metadata_json.to_string(),
                reputation: 0,
                is_active: true,
                is_blocked: false,
                registration_time: crate::now_secs(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_metadata(metadata: &str) -> AgentRecord {
        AgentRecord {
            name: "agent".into(),
            metadata: metadata.into(),
            reputation: 7,
            is_active: true,
            is_blocked: false,
            registration_time: 1_700_000_000,
        }
    }

    #[test]
    fn test_eligibility() {
        let mut record = record_with_metadata("{}");
        assert!(record.eligible());
        record.is_blocked = true;
        assert!(!record.eligible());
        record.is_blocked = false;
        record.is_active = false;
        assert!(!record.eligible());
    }

    #[test]
    fn test_public_key_parsing() {
        let record = record_with_metadata(r#"{"publicKey": "04deadbeef"}"#);
        assert_eq!(record.public_key().unwrap(), hex::decode("04deadbeef").unwrap());

        let prefixed = record_with_metadata(r#"{"publicKey": "0x04deadbeef"}"#);
        assert_eq!(prefixed.public_key().unwrap(), hex::decode("04deadbeef").unwrap());
    }

    #[test]
    fn test_public_key_malformed() {
        for metadata in ["not json", "{}", r#"{"publicKey": "zz"}"#, r#"{"publicKey": 5}"#] {
            let record = record_with_metadata(metadata);
            assert!(matches!(
                record.public_key(),
                Err(RegistryError::MalformedMetadata(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_in_memory_registry_roundtrip() {
        let own = Address::repeat_byte(0x11);
        let registry = InMemoryRegistry::new(own);

        assert!(!registry.is_registered(own).await.unwrap());
        assert!(matches!(
            registry.agent_info(own).await,
            Err(RegistryError::NotFound(_))
        ));

        registry
            .register("alice", r#"{"publicKey": "04aa"}"#)
            .await
            .unwrap();
        assert!(registry.is_registered(own).await.unwrap());

        let record = registry.agent_info(own).await.unwrap();
        assert_eq!(record.name, "alice");
        assert!(record.eligible());
    }

    #[tokio::test]
    async fn test_register_twice_is_idempotent() {
        let own = Address::repeat_byte(0x22);
        let registry = InMemoryRegistry::new(own);

        registry.register("alice", "{}").await.unwrap();
        registry.register("alice-again", "{}").await.unwrap();

        // First write wins; the second is a silent success.
        assert_eq!(registry.agent_info(own).await.unwrap().name, "alice");
    }
}
