// Cross-module invariants exercised through the public API only:
// identity, payload sealing, envelope signing, and registry semantics.

use agentmesh_core::crypto::{open_payload, seal_payload, CryptoError};
use agentmesh_core::identity::AgentKeys;
use agentmesh_core::message::{self, decode_frame, encode_frame};
use agentmesh_core::{InMemoryRegistry, NodeRole, Registry, RolePolicy};

#[test]
fn sign_and_verify_is_identity_preserving() {
    let keys = AgentKeys::generate();
    for payload in [&b""[..], b"x", b"a longer payload with unicode \xc3\xa9"] {
        let signature = keys.sign(payload).unwrap();
        assert!(agentmesh_core::identity::verify_signature(
            keys.address(),
            payload,
            &signature
        ));
    }
}

#[test]
fn sealed_payload_roundtrips_for_matching_keypair() {
    let recipient = AgentKeys::generate();
    for plaintext in [&b""[..], b"hello", &[0u8; 4096]] {
        let sealed = seal_payload(&recipient.encryption_public_key(), plaintext).unwrap();
        assert_eq!(open_payload(&recipient, &sealed).unwrap(), plaintext);
    }
}

#[test]
fn sealed_payload_is_opaque_on_the_wire() {
    let recipient = AgentKeys::generate();
    let sealed = seal_payload(&recipient.encryption_public_key(), b"hello").unwrap();

    // The wire bytes never contain the plaintext.
    assert!(!sealed
        .windows(b"hello".len())
        .any(|window| window == b"hello"));
}

#[test]
fn wrong_keypair_sees_not_for_me() {
    let recipient = AgentKeys::generate();
    let other = AgentKeys::generate();
    let sealed = seal_payload(&recipient.encryption_public_key(), b"secret").unwrap();
    assert_eq!(open_payload(&other, &sealed), Err(CryptoError::NotForMe));
}

#[test]
fn envelope_survives_the_wire_and_still_verifies() {
    let sender = AgentKeys::generate();
    let recipient = AgentKeys::generate();

    let envelope = message::build_signed(
        &sender,
        Some(recipient.address()),
        b"over the wire".to_vec(),
        false,
        Some("conv-1".into()),
        None,
    )
    .unwrap();

    let frame = encode_frame(&envelope).unwrap();
    let restored = decode_frame(&frame).unwrap();

    assert_eq!(restored.verify().unwrap(), sender.address());
    assert!(restored.is_for(recipient.address()));
    assert_eq!(restored.conversation_id.as_deref(), Some("conv-1"));
}

#[test]
fn envelope_tamper_is_detected_after_decode() {
    let sender = AgentKeys::generate();
    let envelope =
        message::build_signed(&sender, None, b"original".to_vec(), false, None, None).unwrap();

    let frame = encode_frame(&envelope).unwrap();
    let mut tampered = decode_frame(&frame).unwrap();
    tampered.content = b"changed".to_vec();

    assert!(tampered.verify().is_err());
}

#[tokio::test]
async fn registering_twice_is_idempotent() {
    let keys = AgentKeys::generate();
    let registry = InMemoryRegistry::new(keys.address());

    registry
        .register("alice", r#"{"publicKey": "04aa"}"#)
        .await
        .unwrap();
    // Second registration must not fail.
    registry
        .register("alice", r#"{"publicKey": "04aa"}"#)
        .await
        .unwrap();

    assert!(registry.is_registered(keys.address()).await.unwrap());
}

#[test]
fn role_policy_is_a_pure_function_of_the_tag() {
    for role in [
        NodeRole::Bootstrap,
        NodeRole::Full,
        NodeRole::Server,
        NodeRole::Light,
    ] {
        assert_eq!(RolePolicy::for_role(role), RolePolicy::for_role(role));
    }
}

#[test]
fn light_role_runs_without_dht_or_gossip() {
    let policy = RolePolicy::for_role(NodeRole::Light);
    assert!(!policy.enable_dht);
    assert!(!policy.enable_gossip);
    // No DHT means no announcement publication either; both periodic
    // publication paths are gated on these flags.
}
