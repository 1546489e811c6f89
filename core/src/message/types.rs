// Wire envelope types — what actually travels on the gossip mesh
//
// An AgentMessage is signed as a whole minus the signature field: the
// signed bytes are the canonical JSON of every other field, in struct
// declaration order. Signing and verification both go through
// `canonical_bytes`, so there is exactly one serialization that counts.

use alloy::primitives::Address;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::identity::{self, AgentKeys};

/// Serde helper: binary content as base64 inside the JSON envelope.
mod content_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A signed application message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    /// Globally unique per sender: `<address>-<ms>-<random>`.
    pub message_id: String,
    /// Sender account address, lowercase hex.
    pub from_agent_id: String,
    /// Recipient account address; absent = broadcast intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_agent_id: Option<String>,
    /// Opaque payload bytes: sealed ciphertext or plaintext UTF-8.
    #[serde(with = "content_b64")]
    pub content: Vec<u8>,
    /// Whether `content` is sealed for the recipient.
    #[serde(default)]
    pub encrypted: bool,
    /// Milliseconds since epoch.
    pub timestamp: u64,
    /// Sender-chosen uniqueness inside the signed blob.
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Hex-encoded 65-byte recoverable signature over `canonical_bytes`.
    #[serde(default)]
    pub signature: String,
}

/// The signed view: every envelope field except `signature`, in the
/// same declaration order. Field order is load-bearing: it defines
/// the canonical byte string.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalView<'a> {
    message_id: &'a str,
    from_agent_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    to_agent_id: Option<&'a str>,
    #[serde(with = "content_b64")]
    content: &'a [u8],
    encrypted: bool,
    timestamp: u64,
    nonce: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
}

impl AgentMessage {
    /// The canonical byte string that is signed and verified.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let view = CanonicalView {
            message_id: &self.message_id,
            from_agent_id: &self.from_agent_id,
            to_agent_id: self.to_agent_id.as_deref(),
            content: &self.content,
            encrypted: self.encrypted,
            timestamp: self.timestamp,
            nonce: self.nonce,
            conversation_id: self.conversation_id.as_deref(),
            reply_to: self.reply_to.as_deref(),
        };
        serde_json::to_vec(&view).context("Canonical encoding failed")
    }

    /// Sign in place with the sender's keys.
    pub fn sign(&mut self, keys: &AgentKeys) -> Result<()> {
        let canonical = self.canonical_bytes()?;
        self.signature = hex::encode(keys.sign(&canonical)?);
        Ok(())
    }

    /// Verify the signature against `from_agent_id` and return the
    /// sender address on success.
    pub fn verify(&self) -> Result<Address> {
        let claimed = self.from()?;
        let canonical = self.canonical_bytes()?;
        let signature =
            hex::decode(&self.signature).map_err(|_| anyhow!("Signature is not valid hex"))?;
        if !identity::verify_signature(claimed, &canonical, &signature) {
            return Err(anyhow!(
                "Signature does not verify against {}",
                self.from_agent_id
            ));
        }
        Ok(claimed)
    }

    /// Parsed sender address. Parsing is case-insensitive, so every
    /// downstream comparison happens on the 20-byte form.
    pub fn from(&self) -> Result<Address> {
        self.from_agent_id
            .parse()
            .map_err(|_| anyhow!("fromAgentId is not an address: {}", self.from_agent_id))
    }

    /// Parsed recipient, if addressed. An empty string counts as
    /// broadcast intent, same as an absent field.
    pub fn to(&self) -> Result<Option<Address>> {
        match self.to_agent_id.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| anyhow!("toAgentId is not an address: {}", raw)),
        }
    }

    /// Is this message addressed to `address`?
    pub fn is_for(&self, address: Address) -> bool {
        matches!(self.to(), Ok(Some(to)) if to == address)
    }
}

/// The outer gossip frame: `{ "message": <envelope> }`. Exactly one
/// field; anything else is rejected at decode time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GossipFrame {
    pub message: AgentMessage,
}

/// What the delivery queue hands to local API streams after
/// verification, recipient filtering, and decryption.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: String,
    pub from: Address,
    pub to: Address,
    pub content: Vec<u8>,
    pub timestamp: u64,
}
