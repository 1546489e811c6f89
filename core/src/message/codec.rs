// Frame codec — serialization with size limits to prevent abuse

use anyhow::{bail, Result};

use super::types::{AgentMessage, GossipFrame};

/// Maximum encoded frame size: 256 KB.
/// Prevents memory exhaustion from malicious oversized publishes.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Maximum content payload: 64 KB.
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

/// Serialize an envelope into its gossip frame.
pub fn encode_frame(message: &AgentMessage) -> Result<Vec<u8>> {
    if message.content.len() > MAX_CONTENT_SIZE {
        bail!(
            "Content too large: {} bytes (max {})",
            message.content.len(),
            MAX_CONTENT_SIZE
        );
    }

    let bytes = serde_json::to_vec(&GossipFrame {
        message: message.clone(),
    })?;

    if bytes.len() > MAX_FRAME_SIZE {
        bail!(
            "Encoded frame too large: {} bytes (max {})",
            bytes.len(),
            MAX_FRAME_SIZE
        );
    }

    Ok(bytes)
}

/// Deserialize raw topic bytes into an envelope.
pub fn decode_frame(bytes: &[u8]) -> Result<AgentMessage> {
    if bytes.len() > MAX_FRAME_SIZE {
        bail!(
            "Frame too large: {} bytes (max {})",
            bytes.len(),
            MAX_FRAME_SIZE
        );
    }

    let frame: GossipFrame = serde_json::from_slice(bytes)?;

    if frame.message.content.len() > MAX_CONTENT_SIZE {
        bail!(
            "Content too large: {} bytes (max {})",
            frame.message.content.len(),
            MAX_CONTENT_SIZE
        );
    }

    Ok(frame.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AgentKeys;

    fn sample_message() -> AgentMessage {
        let keys = AgentKeys::generate();
        let mut msg = AgentMessage {
            message_id: "id".into(),
            from_agent_id: keys.address_hex(),
            to_agent_id: None,
            content: b"payload".to_vec(),
            encrypted: false,
            timestamp: 1,
            nonce: 1,
            conversation_id: None,
            reply_to: None,
            signature: String::new(),
        };
        msg.sign(&keys).unwrap();
        msg
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = sample_message();
        let bytes = encode_frame(&msg).unwrap();
        let restored = decode_frame(&bytes).unwrap();

        assert_eq!(msg.message_id, restored.message_id);
        assert_eq!(msg.content, restored.content);
        assert_eq!(msg.signature, restored.signature);
    }

    #[test]
    fn test_reject_oversized_content() {
        let mut msg = sample_message();
        msg.content = vec![0u8; MAX_CONTENT_SIZE + 1];
        assert!(encode_frame(&msg).is_err());
    }

    #[test]
    fn test_reject_oversized_decode() {
        let big = vec![b'x'; MAX_FRAME_SIZE + 1];
        assert!(decode_frame(&big).is_err());
    }

    #[test]
    fn test_reject_garbage() {
        assert!(decode_frame(b"not json").is_err());
        assert!(decode_frame(b"{}").is_err());
    }
}
