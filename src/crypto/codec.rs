//! Canonical byte layout for signing requests.
//!
//! ```text
//! "moltnet:v1" | u32be(32) | sha256(message) | u32be(len(nonce)) | nonce
//! ```
//!
//! Every variable-length field is length-prefixed, so two different
//! `(message, nonce)` pairs can never serialize to the same bytes. The
//! message is hashed first, which keeps the signed payload at a fixed
//! size no matter how long the message is.

use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Domain-separation prefix. Signatures over these bytes cannot be replayed
/// into any other protocol.
pub const DOMAIN_PREFIX: &[u8; 10] = b"moltnet:v1";

/// Length of the SHA-256 message digest.
pub const MESSAGE_HASH_LEN: usize = 32;

const LEN_FIELD: usize = 4;

/// Fixed part of the layout: prefix, two length fields, and the digest.
pub const FIXED_LEN: usize = DOMAIN_PREFIX.len() + LEN_FIELD + MESSAGE_HASH_LEN + LEN_FIELD;

/// Build the bytes that get signed for `(message, nonce)`.
pub fn signing_bytes(message: &str, nonce: &str) -> Vec<u8> {
    let digest = Sha256::digest(message.as_bytes());
    let nonce = nonce.as_bytes();

    let mut out = Vec::with_capacity(FIXED_LEN + nonce.len());
    out.extend_from_slice(DOMAIN_PREFIX);
    out.extend_from_slice(&(MESSAGE_HASH_LEN as u32).to_be_bytes());
    out.extend_from_slice(&digest);
    out.extend_from_slice(&(nonce.len() as u32).to_be_bytes());
    out.extend_from_slice(nonce);
    out
}

/// Decoded view of a signing payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningPayload {
    pub message_hash: [u8; MESSAGE_HASH_LEN],
    pub nonce: String,
}

impl SigningPayload {
    /// Whether this payload was built from `message`.
    pub fn matches_message(&self, message: &str) -> bool {
        Sha256::digest(message.as_bytes()).as_slice() == self.message_hash
    }
}

/// Parse bytes produced by [`signing_bytes`].
pub fn parse(bytes: &[u8]) -> Result<SigningPayload, CryptoError> {
    let rest = bytes
        .strip_prefix(DOMAIN_PREFIX.as_slice())
        .ok_or_else(|| malformed("missing moltnet:v1 prefix"))?;

    let (hash_len, rest) = read_len(rest, "message hash length")?;
    if hash_len != MESSAGE_HASH_LEN {
        return Err(malformed(format!(
            "message hash length is {hash_len}, expected {MESSAGE_HASH_LEN}"
        )));
    }
    if rest.len() < MESSAGE_HASH_LEN {
        return Err(malformed("truncated message hash"));
    }
    let (hash, rest) = rest.split_at(MESSAGE_HASH_LEN);
    let mut message_hash = [0u8; MESSAGE_HASH_LEN];
    message_hash.copy_from_slice(hash);

    let (nonce_len, rest) = read_len(rest, "nonce length")?;
    if rest.len() != nonce_len {
        return Err(malformed(format!(
            "nonce length field says {nonce_len} bytes, found {}",
            rest.len()
        )));
    }
    let nonce = std::str::from_utf8(rest)
        .map_err(|e| malformed(format!("nonce is not UTF-8: {e}")))?
        .to_string();

    Ok(SigningPayload {
        message_hash,
        nonce,
    })
}

fn read_len<'a>(bytes: &'a [u8], field: &str) -> Result<(usize, &'a [u8]), CryptoError> {
    if bytes.len() < LEN_FIELD {
        return Err(malformed(format!("truncated {field}")));
    }
    let (len, rest) = bytes.split_at(LEN_FIELD);
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    Ok((len, rest))
}

fn malformed(reason: impl Into<String>) -> CryptoError {
    CryptoError::MalformedPayload {
        reason: reason.into(),
    }
}
