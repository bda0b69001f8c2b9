//! Ed25519 signing over [`codec`](super::codec) payloads.
//!
//! Keys travel as `ed25519:<base64>` strings. A string that does not follow
//! that encoding is a caller bug and yields [`CryptoError`]; everything
//! after decoding (wrong key length, garbage signature, failed check) is an
//! ordinary `false`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use super::codec;
use crate::error::CryptoError;

/// Key encoding prefix.
pub const KEY_PREFIX: &str = "ed25519:";

const KEY_LEN: usize = 32;

/// A public/private key pair plus the fingerprint of the public half.
#[derive(Clone)]
pub struct KeyMaterial {
    pub public_key: String,
    pub private_key: SecretString,
    pub fingerprint: String,
}

impl KeyMaterial {
    /// Derive key material from a 32-byte seed.
    pub fn from_seed(seed: &[u8; KEY_LEN]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let public_key = encode_key(signing_key.verifying_key().as_bytes());
        let fingerprint = fingerprint_bytes(signing_key.verifying_key().as_bytes());
        Self {
            public_key,
            private_key: SecretString::from(encode_key(seed)),
            fingerprint,
        }
    }

    /// Fresh key material from the OS RNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public_key", &self.public_key)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Sign `bytes` with an encoded private key; returns a base64 signature.
pub fn sign(bytes: &[u8], private_key: &SecretString) -> Result<String, CryptoError> {
    let seed = decode_key(private_key.expose_secret())?;
    // Accept both a bare 32-byte seed and the 64-byte seed||public form.
    let seed: [u8; KEY_LEN] = match seed.len() {
        KEY_LEN | 64 => {
            let mut out = [0u8; KEY_LEN];
            out.copy_from_slice(&seed[..KEY_LEN]);
            out
        }
        len => {
            return Err(CryptoError::InvalidKeyEncoding {
                reason: format!("private key is {len} bytes, expected 32 or 64"),
            });
        }
    };
    let signature = SigningKey::from_bytes(&seed).sign(bytes);
    Ok(BASE64.encode(signature.to_bytes()))
}

/// Verify a base64 signature over `bytes`.
pub fn verify(bytes: &[u8], signature: &str, public_key: &str) -> Result<bool, CryptoError> {
    let key_bytes = decode_key(public_key)?;
    let Ok(key_bytes) = <[u8; KEY_LEN]>::try_from(key_bytes.as_slice()) else {
        return Ok(false);
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return Ok(false);
    };
    let Ok(sig_bytes) = BASE64.decode(signature.trim()) else {
        return Ok(false);
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return Ok(false);
    };
    Ok(verifying_key.verify(bytes, &signature).is_ok())
}

/// Sign the canonical payload for `(message, nonce)`.
pub fn sign_with_nonce(
    message: &str,
    nonce: &str,
    private_key: &SecretString,
) -> Result<String, CryptoError> {
    sign(&codec::signing_bytes(message, nonce), private_key)
}

/// Verify a signature over the canonical payload for `(message, nonce)`.
pub fn verify_with_nonce(
    message: &str,
    nonce: &str,
    signature: &str,
    public_key: &str,
) -> Result<bool, CryptoError> {
    verify(&codec::signing_bytes(message, nonce), signature, public_key)
}

/// Human-comparable fingerprint of an encoded public key:
/// the first 16 hex digits of its SHA-256, as `XXXX-XXXX-XXXX-XXXX`.
pub fn fingerprint(public_key: &str) -> Result<String, CryptoError> {
    Ok(fingerprint_bytes(&decode_key(public_key)?))
}

fn fingerprint_bytes(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    let hex: String = digest[..8].iter().map(|b| format!("{b:02X}")).collect();
    hex.as_bytes()
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

fn encode_key(bytes: &[u8]) -> String {
    format!("{KEY_PREFIX}{}", BASE64.encode(bytes))
}

fn decode_key(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    let body = encoded
        .trim()
        .strip_prefix(KEY_PREFIX)
        .ok_or_else(|| CryptoError::InvalidKeyEncoding {
            reason: format!("key must start with '{KEY_PREFIX}'"),
        })?;
    BASE64
        .decode(body)
        .map_err(|e| CryptoError::InvalidKeyEncoding {
            reason: format!("key is not valid base64: {e}"),
        })
}
