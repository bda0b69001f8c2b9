//! Signing protocol: canonical payload bytes and Ed25519 over them.

pub mod codec;
pub mod signature;

pub use codec::{SigningPayload, signing_bytes};
pub use signature::{
    KeyMaterial, fingerprint, sign, sign_with_nonce, verify, verify_with_nonce,
};
