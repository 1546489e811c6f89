// Messaging — envelope construction, topics, duplicate suppression
//
// Three well-known gossip topics carry all overlay traffic. Every
// envelope on any of them is signed; `agent-messages` additionally
// goes through recipient filtering and optional decryption before it
// reaches a local API stream.

pub mod codec;
pub mod types;

use std::collections::{HashSet, VecDeque};

use alloy::primitives::Address;
use anyhow::Result;
use rand::RngCore;

use crate::identity::AgentKeys;

pub use codec::{decode_frame, encode_frame, MAX_CONTENT_SIZE, MAX_FRAME_SIZE};
pub use types::{AgentMessage, GossipFrame, InboundMessage};

/// Application messages.
pub const TOPIC_MESSAGES: &str = "agent-messages";
/// Directory announcements.
pub const TOPIC_ANNOUNCEMENTS: &str = "agent-announcements";
/// Periodic node telemetry.
pub const TOPIC_STATUS: &str = "node-status";

/// Build and sign an envelope from this node.
///
/// `content` is already in its final opaque form: sealed bytes when the
/// caller encrypted, UTF-8 plaintext otherwise.
pub fn build_signed(
    keys: &AgentKeys,
    to: Option<Address>,
    content: Vec<u8>,
    encrypted: bool,
    conversation_id: Option<String>,
    reply_to: Option<String>,
) -> Result<AgentMessage> {
    let now_ms = crate::now_ms();
    let mut suffix = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut suffix);

    let mut message = AgentMessage {
        message_id: format!("{}-{}-{}", keys.address_hex(), now_ms, hex::encode(suffix)),
        from_agent_id: keys.address_hex(),
        to_agent_id: to.map(|addr| format!("{:#x}", addr)),
        content,
        encrypted,
        timestamp: now_ms,
        nonce: now_ms,
        conversation_id,
        reply_to,
        signature: String::new(),
    };
    message.sign(keys)?;
    Ok(message)
}

/// Bounded (messageId, sender) set for duplicate suppression.
///
/// Gossip is at-least-once; the same envelope can arrive along several
/// mesh paths. Capacity-bounded FIFO eviction keeps memory flat.
pub struct SeenSet {
    capacity: usize,
    order: VecDeque<(String, Address)>,
    seen: HashSet<(String, Address)>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record an observation. Returns `true` for first sightings.
    pub fn insert(&mut self, message_id: &str, from: Address) -> bool {
        let key = (message_id.to_string(), from);
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_signed_verifies() {
        let keys = AgentKeys::generate();
        let recipient = AgentKeys::generate();

        let msg = build_signed(
            &keys,
            Some(recipient.address()),
            b"hi".to_vec(),
            false,
            None,
            None,
        )
        .unwrap();

        assert_eq!(msg.verify().unwrap(), keys.address());
        assert!(msg.is_for(recipient.address()));
        assert!(msg.message_id.starts_with(&keys.address_hex()));
        assert_eq!(msg.timestamp, msg.nonce);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let keys = AgentKeys::generate();
        let first = build_signed(&keys, None, vec![], false, None, None).unwrap();
        let second = build_signed(&keys, None, vec![], false, None, None).unwrap();
        assert_ne!(first.message_id, second.message_id);
    }

    #[test]
    fn test_seen_set_dedups() {
        let from = Address::repeat_byte(0xab);
        let mut seen = SeenSet::new(8);

        assert!(seen.insert("m1", from));
        assert!(!seen.insert("m1", from));
        // Same id from a different sender is a different message.
        assert!(seen.insert("m1", Address::repeat_byte(0xcd)));
    }

    #[test]
    fn test_seen_set_evicts_oldest() {
        let from = Address::repeat_byte(0x01);
        let mut seen = SeenSet::new(2);

        assert!(seen.insert("m1", from));
        assert!(seen.insert("m2", from));
        assert!(seen.insert("m3", from)); // evicts m1
        assert_eq!(seen.len(), 2);
        assert!(seen.insert("m1", from)); // m1 forgotten, accepted again
    }
}
