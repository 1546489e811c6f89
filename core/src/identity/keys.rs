// Agent key management
//
// Every agent is born from a 32-byte secp256k1 secret. From it we derive:
// - the account address (Keccak-256 of the uncompressed public point,
//   last 20 bytes, the standard Ethereum convention),
// - the signing key for message envelopes,
// - the encryption public key (65-byte uncompressed SEC1 point) that
//   peers use to seal payloads for us.
//
// Signatures use the personal-message framing: the signed digest is
// Keccak256("\x19Ethereum Signed Message:\n" + len + message), and the
// output is the 65-byte r||s||v form with v in {27, 28}. Verification
// recovers the signer address and compares it to the claimed one, so
// no public key ever travels next to a signature.

use alloy::primitives::Address;
use anyhow::{anyhow, bail, Result};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};
use zeroize::Zeroize;

/// Length of a recoverable signature on the wire: r (32) || s (32) || v (1).
pub const SIGNATURE_LEN: usize = 65;

/// Identity keys for one agent.
#[derive(Clone)]
pub struct AgentKeys {
    signing_key: SigningKey,
}

impl AgentKeys {
    /// Build keys from a raw 32-byte secret.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(secret.into())
            .map_err(|_| anyhow!("Secret is not a valid secp256k1 scalar"))?;
        Ok(Self { signing_key })
    }

    /// Build keys from a hex-encoded secret, with or without a `0x` prefix.
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let trimmed = secret_hex.trim().trim_start_matches("0x");
        let mut bytes = hex::decode(trimmed).map_err(|_| anyhow!("Secret is not valid hex"))?;
        if bytes.len() != 32 {
            bytes.zeroize();
            bail!("Secret must be 32 bytes, got {}", bytes.len());
        }
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&bytes);
        bytes.zeroize();
        let keys = Self::from_secret_bytes(&secret);
        secret.zeroize();
        keys
    }

    /// Generate a random identity. Used by tests and throwaway nodes.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret = [0u8; 32];
        loop {
            rand::rngs::OsRng.fill_bytes(&mut secret);
            if let Ok(keys) = Self::from_secret_bytes(&secret) {
                secret.zeroize();
                return keys;
            }
        }
    }

    /// The account address derived from the public key.
    pub fn address(&self) -> Address {
        address_of(self.signing_key.verifying_key())
    }

    /// Lowercase hex address with `0x` prefix: the canonical form used
    /// for registry keys, DHT keys, and envelope fields.
    pub fn address_hex(&self) -> String {
        format!("{:#x}", self.address())
    }

    /// The encryption public key: 65-byte uncompressed SEC1 point.
    pub fn encryption_public_key(&self) -> [u8; 65] {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let mut out = [0u8; 65];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Hex-encoded encryption public key, as published in registry metadata.
    pub fn encryption_public_key_hex(&self) -> String {
        hex::encode(self.encryption_public_key())
    }

    /// Sign a message with personal-message framing.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        let digest = personal_digest(message);
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| anyhow!("Signing failed: {}", e))?;

        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = 27 + recovery_id.to_byte();
        Ok(out)
    }

    /// Borrow the raw signing key for ECDH (payload decryption).
    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl std::fmt::Debug for AgentKeys {
    // Never print key material.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentKeys")
            .field("address", &self.address())
            .finish()
    }
}

/// Recover the signer address of a personal-message signature.
pub fn recover_address(message: &[u8], signature: &[u8]) -> Result<Address> {
    if signature.len() != SIGNATURE_LEN {
        bail!(
            "Signature must be {} bytes, got {}",
            SIGNATURE_LEN,
            signature.len()
        );
    }

    // Accept both the raw {0,1} and the offset {27,28} recovery byte.
    let v = signature[64];
    let rec_byte = if v >= 27 { v - 27 } else { v };
    let recovery_id =
        RecoveryId::from_byte(rec_byte).ok_or_else(|| anyhow!("Invalid recovery byte {}", v))?;

    let sig = EcdsaSignature::from_slice(&signature[..64])
        .map_err(|_| anyhow!("Malformed signature"))?;

    let digest = personal_digest(message);
    let verifying_key = VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id)
        .map_err(|_| anyhow!("Signature recovery failed"))?;

    Ok(address_of(&verifying_key))
}

/// Verify that `signature` over `message` was produced by `address`.
///
/// Address comparison is byte-wise on the parsed 20-byte form, so any
/// casing of the hex input compares equal.
pub fn verify_signature(address: Address, message: &[u8], signature: &[u8]) -> bool {
    match recover_address(message, signature) {
        Ok(recovered) => recovered == address,
        Err(_) => false,
    }
}

fn personal_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

fn address_of(key: &VerifyingKey) -> Address {
    // Keccak-256 over the 64-byte public point (strip the 0x04 SEC1 tag),
    // keep the last 20 bytes.
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_address_vector() {
        // secret = 1 is the canonical test vector for address derivation.
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let keys = AgentKeys::from_secret_bytes(&secret).unwrap();
        assert_eq!(
            keys.address_hex(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_from_hex_accepts_prefix() {
        let keys = AgentKeys::generate();
        let raw = hex::encode(keys.signing_key.to_bytes());
        let with_prefix = AgentKeys::from_hex(&format!("0x{}", raw)).unwrap();
        let without_prefix = AgentKeys::from_hex(&raw).unwrap();
        assert_eq!(keys.address(), with_prefix.address());
        assert_eq!(keys.address(), without_prefix.address());
    }

    #[test]
    fn test_rejects_bad_secret() {
        assert!(AgentKeys::from_hex("not hex").is_err());
        assert!(AgentKeys::from_hex("0xdead").is_err());
        // Zero is not a valid scalar.
        assert!(AgentKeys::from_secret_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let keys = AgentKeys::generate();
        let message = b"canonical envelope bytes";

        let signature = keys.sign(message).unwrap();
        assert_eq!(signature.len(), SIGNATURE_LEN);
        assert!(signature[64] == 27 || signature[64] == 28);

        assert!(verify_signature(keys.address(), message, &signature));
    }

    #[test]
    fn test_verify_rejects_wrong_message() {
        let keys = AgentKeys::generate();
        let signature = keys.sign(b"original").unwrap();
        assert!(!verify_signature(keys.address(), b"tampered", &signature));
    }

    #[test]
    fn test_verify_rejects_wrong_signer() {
        let alice = AgentKeys::generate();
        let bob = AgentKeys::generate();
        let signature = alice.sign(b"hello").unwrap();
        assert!(!verify_signature(bob.address(), b"hello", &signature));
    }

    #[test]
    fn test_verify_rejects_flipped_byte() {
        let keys = AgentKeys::generate();
        let mut signature = keys.sign(b"hello").unwrap();
        signature[0] ^= 0xFF;
        assert!(!verify_signature(keys.address(), b"hello", &signature));
    }

    #[test]
    fn test_encryption_public_key_shape() {
        let keys = AgentKeys::generate();
        let public = keys.encryption_public_key();
        assert_eq!(public[0], 0x04); // uncompressed SEC1 tag
        assert_eq!(keys.encryption_public_key_hex().len(), 130);
    }

    #[test]
    fn test_recovery_byte_without_offset() {
        // Some stacks emit v in {0,1}; recovery must accept both forms.
        let keys = AgentKeys::generate();
        let mut signature = keys.sign(b"either form").unwrap();
        signature[64] -= 27;
        assert!(verify_signature(keys.address(), b"either form", &signature));
    }
}
