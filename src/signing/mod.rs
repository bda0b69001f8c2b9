//! Signing-request workflow.
//!
//! A signing request asks an agent to prove it holds its private key:
//!
//! ```text
//! request_signature ──► pending row ──► envelope published
//!                                            │
//!                 submit_signature ──► rendezvous ──► verify ──► completed
//!                                            │
//!                           deadline ────────┴──────────────────► expired
//! ```
//!
//! The row's `status` column is the source of truth. Terminal writes are
//! conditional on `status = 'pending'`, so exactly one of "submission" and
//! "deadline" wins for a given request.

mod durable;
mod keys;
pub mod nonce;
pub mod rendezvous;
mod store;
mod types;
mod workflow;

pub use durable::DurableRendezvous;
pub use keys::{Ed25519Verifier, KeyLookup, SignatureVerifier, StaticKeyLookup};
pub use nonce::NonceLedger;
pub use rendezvous::{InMemoryRendezvous, Rendezvous};
pub use store::RetryingStore;
pub use types::{
    Envelope, Page, SignatureSubmission, SigningOutcome, SigningRequest, SigningStatus,
    StatusFilter, StatusUpdate,
};
pub use workflow::{PendingSignature, SigningWorkflow, SigningWorkflowBuilder, SweepReport};
