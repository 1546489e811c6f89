// Per-payload encryption: secp256k1 ECDH + HKDF-SHA256 + XChaCha20-Poly1305
//
// Flow:
// 1. Parse the recipient's 65-byte uncompressed public point
// 2. Generate an ephemeral secp256k1 keypair
// 3. ECDH: ephemeral_secret × recipient_point → shared_secret
// 4. KDF: HKDF-SHA256(shared_secret, context) → symmetric_key
// 5. Encrypt: XChaCha20-Poly1305(symmetric_key, random_nonce, plaintext)
// 6. Output: bincode(SealedPayload { ephemeral_pub, nonce, ciphertext })
//
// Recipient reverses:
// 1. ECDH: own_secret_scalar × ephemeral_point → shared_secret
// 2. KDF: same derivation → symmetric_key
// 3. Decrypt: XChaCha20-Poly1305(symmetric_key, nonce, ciphertext)
//
// The output is self-contained: anything a recipient needs besides their
// own secret travels inside the sealed bytes. Any parse or decrypt
// failure collapses into NotForMe: the caller cannot distinguish
// "sealed for someone else" from "not sealed at all", which is exactly
// the contract the messaging layer's plaintext fallback relies on.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

use crate::identity::AgentKeys;

/// KDF context string for deriving encryption keys from ECDH shared secrets.
/// Changing this breaks compatibility with all messages already in flight.
const KDF_CONTEXT: &[u8] = b"agentmesh payload encryption v1";

/// Hard cap on sealed input. Matches the messaging layer's payload limit.
const MAX_PLAINTEXT: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Recipient public key is not a valid secp256k1 point")]
    InvalidRecipientKey,
    #[error("Plaintext too large: {0} bytes")]
    PlaintextTooLarge(usize),
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Payload was not sealed for this identity")]
    NotForMe,
}

/// The sealed wire form. Framed with bincode inside the envelope's
/// opaque `content` bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedPayload {
    /// Ephemeral secp256k1 public key, 65-byte uncompressed SEC1.
    ephemeral_public_key: Vec<u8>,
    /// XChaCha20-Poly1305 nonce (24 bytes).
    nonce: Vec<u8>,
    /// Encrypted + authenticated ciphertext.
    ciphertext: Vec<u8>,
}

/// Seal `plaintext` for the holder of `recipient_public_key`
/// (65-byte uncompressed SEC1 encoding, as published in the registry).
pub fn seal_payload(recipient_public_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if plaintext.len() > MAX_PLAINTEXT {
        return Err(CryptoError::PlaintextTooLarge(plaintext.len()));
    }

    let recipient = k256::PublicKey::from_sec1_bytes(recipient_public_key)
        .map_err(|_| CryptoError::InvalidRecipientKey)?;

    // Fresh ephemeral keypair per payload: no key reuse across messages.
    let ephemeral = k256::ecdh::EphemeralSecret::random(&mut rand::rngs::OsRng);
    let ephemeral_public = ephemeral.public_key();

    let shared_secret = ephemeral.diffie_hellman(&recipient);
    let mut symmetric_key = derive_key(shared_secret.raw_secret_bytes().as_slice());

    let mut nonce_bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    symmetric_key.zeroize();

    let sealed = SealedPayload {
        ephemeral_public_key: ephemeral_public.to_encoded_point(false).as_bytes().to_vec(),
        nonce: nonce_bytes.to_vec(),
        ciphertext,
    };

    bincode::serialize(&sealed).map_err(|_| CryptoError::EncryptionFailed)
}

/// Open a sealed payload with our identity keys.
///
/// Every failure mode maps to `NotForMe`: malformed framing, an invalid
/// ephemeral point, or an AEAD tag that does not check out under our
/// derived key.
pub fn open_payload(keys: &AgentKeys, sealed_bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sealed: SealedPayload =
        bincode::deserialize(sealed_bytes).map_err(|_| CryptoError::NotForMe)?;

    if sealed.nonce.len() != 24 {
        return Err(CryptoError::NotForMe);
    }

    let ephemeral = k256::PublicKey::from_sec1_bytes(&sealed.ephemeral_public_key)
        .map_err(|_| CryptoError::NotForMe)?;

    let shared_secret =
        k256::ecdh::diffie_hellman(keys.signing_key().as_nonzero_scalar(), ephemeral.as_affine());
    let mut symmetric_key = derive_key(shared_secret.raw_secret_bytes().as_slice());

    let cipher =
        XChaCha20Poly1305::new_from_slice(&symmetric_key).map_err(|_| CryptoError::NotForMe)?;
    let plaintext = cipher
        .decrypt(XNonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
        .map_err(|_| CryptoError::NotForMe);

    symmetric_key.zeroize();
    plaintext
}

fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    // Expand cannot fail for a 32-byte output.
    hk.expand(KDF_CONTEXT, &mut key)
        .expect("32 bytes is a valid HKDF output length");
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let recipient = AgentKeys::generate();
        let plaintext = b"Hello, this is a secret message!";

        let sealed = seal_payload(&recipient.encryption_public_key(), plaintext).unwrap();
        let opened = open_payload(&recipient, &sealed).unwrap();

        assert_eq!(plaintext.to_vec(), opened);
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let recipient = AgentKeys::generate();
        let eavesdropper = AgentKeys::generate();

        let sealed = seal_payload(&recipient.encryption_public_key(), b"secret").unwrap();
        assert_eq!(
            open_payload(&eavesdropper, &sealed),
            Err(CryptoError::NotForMe)
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let recipient = AgentKeys::generate();
        let mut sealed = seal_payload(&recipient.encryption_public_key(), b"secret").unwrap();

        if let Some(byte) = sealed.last_mut() {
            *byte ^= 0xFF;
        }

        assert!(open_payload(&recipient, &sealed).is_err());
    }

    #[test]
    fn test_plaintext_bytes_are_not_for_me() {
        // The fallback contract: arbitrary UTF-8 must decode as NotForMe,
        // never panic or produce garbage plaintext.
        let keys = AgentKeys::generate();
        assert_eq!(
            open_payload(&keys, "just a plain string".as_bytes()),
            Err(CryptoError::NotForMe)
        );
        assert_eq!(open_payload(&keys, &[]), Err(CryptoError::NotForMe));
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let recipient = AgentKeys::generate();
        let public = recipient.encryption_public_key();

        let first = seal_payload(&public, b"message").unwrap();
        let second = seal_payload(&public, b"message").unwrap();

        // Fresh ephemeral key and nonce per payload.
        assert_ne!(first, second);
    }

    #[test]
    fn test_invalid_recipient_key() {
        assert_eq!(
            seal_payload(&[0u8; 65], b"data"),
            Err(CryptoError::InvalidRecipientKey)
        );
        assert_eq!(
            seal_payload(b"short", b"data"),
            Err(CryptoError::InvalidRecipientKey)
        );
    }

    #[test]
    fn test_empty_plaintext() {
        let recipient = AgentKeys::generate();
        let sealed = seal_payload(&recipient.encryption_public_key(), b"").unwrap();
        assert!(open_payload(&recipient, &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_plaintext_rejected() {
        let recipient = AgentKeys::generate();
        let big = vec![0x42u8; MAX_PLAINTEXT + 1];
        assert!(matches!(
            seal_payload(&recipient.encryption_public_key(), &big),
            Err(CryptoError::PlaintextTooLarge(_))
        ));
    }
}
