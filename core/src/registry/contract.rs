// On-chain registry contract client
//
// Thin alloy-based binding over the AgentRegistry contract. Reads are
// plain `eth_call`s; the single write (registerAgent) goes through the
// wallet-filled provider and blocks until the transaction is mined.

use alloy::{
    network::EthereumWallet,
    primitives::Address,
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol,
};
use async_trait::async_trait;

use super::{AgentRecord, Registry, RegistryError};

sol! {
    #[sol(rpc)]
    contract AgentRegistry {
        function isRegistered(address agent) external view returns (bool);
        function getAgentInfo(address agent) external view returns (
            string memory name,
            string memory metadata,
            uint256 reputation,
            bool isActive,
            bool isBlocked,
            uint256 registrationTime
        );
        function registerAgent(string calldata name, string calldata metadata) external;
    }
}

/// Registry client bound to one deployed contract.
pub struct ContractRegistry {
    contract_address: Address,
    provider: DynProvider,
}

impl ContractRegistry {
    /// Connect to `rpc_url` with a signing wallet derived from the
    /// node's account secret. The same secret that derives the overlay
    /// identity signs the registration transaction.
    pub async fn connect(
        rpc_url: &str,
        contract_address: Address,
        private_key_hex: &str,
    ) -> Result<Self, RegistryError> {
        let signer: PrivateKeySigner = private_key_hex
            .trim()
            .parse()
            .map_err(|_| RegistryError::Rpc("invalid signing key for registry wallet".into()))?;
        let wallet = EthereumWallet::from(signer);

        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect(rpc_url)
            .await
            .map_err(|e| RegistryError::Rpc(format!("cannot reach {}: {}", rpc_url, e)))?
            .erased();

        Ok(Self {
            contract_address,
            provider,
        })
    }

    fn instance(&self) -> AgentRegistry::AgentRegistryInstance<DynProvider> {
        AgentRegistry::new(self.contract_address, self.provider.clone())
    }
}

#[async_trait]
impl Registry for ContractRegistry {
    async fn is_registered(&self, address: Address) -> Result<bool, RegistryError> {
        self.instance()
            .isRegistered(address)
            .call()
            .await
            .map_err(|e| RegistryError::Rpc(e.to_string()))
    }

    async fn agent_info(&self, address: Address) -> Result<AgentRecord, RegistryError> {
        // The contract returns zeroed fields for unknown agents on some
        // deployments and reverts on others; the explicit membership
        // check gives one uniform NotFound.
        if !self.is_registered(address).await? {
            return Err(RegistryError::NotFound(address));
        }

        let info = self
            .instance()
            .getAgentInfo(address)
            .call()
            .await
            .map_err(|e| RegistryError::Rpc(e.to_string()))?;

        Ok(AgentRecord {
            name: info.name,
            metadata: info.metadata,
            reputation: info.reputation.saturating_to(),
            is_active: info.isActive,
            is_blocked: info.isBlocked,
            registration_time: info.registrationTime.saturating_to(),
        })
    }

    async fn register(&self, name: &str, metadata_json: &str) -> Result<(), RegistryError> {
        let pending = self
            .instance()
            .registerAgent(name.to_string(), metadata_json.to_string())
            .send()
            .await
            .map_err(|e| RegistryError::Rpc(format!("registerAgent submit failed: {}", e)))?;

        // Synchronous inclusion: surface any failure to the caller, who
        // treats startup registration errors as fatal.
        let tx_hash = pending
            .watch()
            .await
            .map_err(|e| RegistryError::Rpc(format!("registerAgent not mined: {}", e)))?;

        tracing::info!(%tx_hash, name, "Agent registration mined");
        Ok(())
    }
}
