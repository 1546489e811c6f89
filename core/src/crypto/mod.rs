// Payload cryptography — sealing message content for a single recipient

pub mod encrypt;

pub use encrypt::{open_payload, seal_payload, CryptoError};
