// Identity — account address derivation, message signing, key material

pub mod keys;

pub use keys::{recover_address, verify_signature, AgentKeys};
