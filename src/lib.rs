//! moltnet-signing: durable, replay-resistant signing requests.
//!
//! An agent proves it holds its Ed25519 key by signing a server-issued
//! `(message, nonce)` pair. The server keeps one row per request, waits for
//! the signature or the deadline, and records exactly one outcome.
//!
//! - [`crypto`]: canonical payload bytes, Ed25519, key fingerprints
//! - [`signing`]: the request workflow, rendezvous, nonce ledger
//! - [`db`]: PostgreSQL and libSQL stores plus the conflict retry policy
//! - [`recovery`]: stateless key-recovery challenges

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod recovery;
pub mod signing;

pub use config::Config;
pub use error::{Error, Result};
