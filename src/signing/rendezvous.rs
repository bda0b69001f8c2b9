//! Rendezvous between a waiting workflow and the agent's answer.
//!
//! The workflow publishes an [`Envelope`] for the agent and then waits on
//! `receive(request_id)`. Whatever transport talks to the agent calls
//! [`SigningWorkflow::submit_signature`](super::SigningWorkflow::submit_signature),
//! which ends up in `deliver`.
//!
//! [`InMemoryRendezvous`] only reaches waiters in the same process;
//! [`DurableRendezvous`](super::DurableRendezvous) keeps submissions in the
//! database so a restart or another process can pick them up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};
use uuid::Uuid;

use crate::error::SigningError;
use crate::signing::{Envelope, SignatureSubmission};

/// Mailbox keyed by request id.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Hand the challenge to whoever delivers it to the agent.
    async fn publish(&self, envelope: &Envelope) -> Result<(), SigningError>;

    /// Register a waiter for `request_id`. Called before the waiter task
    /// starts, so a submission can never arrive ahead of its mailbox.
    fn open(&self, request_id: Uuid);

    /// Store a submission for `request_id`. The first one wins; later
    /// submissions for the same id are dropped.
    async fn deliver(
        &self,
        request_id: Uuid,
        submission: SignatureSubmission,
    ) -> Result<(), SigningError>;

    /// Wait for the submission for `request_id`. Cancel-safe: dropping the
    /// future leaves an undelivered submission in place.
    async fn receive(&self, request_id: Uuid) -> Result<SignatureSubmission, SigningError>;

    /// Drop this process's waiter state for `request_id`.
    fn close(&self, request_id: Uuid);

    /// Discard stored submissions for requests that are no longer pending.
    async fn prune(&self) -> Result<u64, SigningError> {
        Ok(0)
    }
}

pub(crate) fn broadcast_envelope(sender: &broadcast::Sender<Envelope>, envelope: &Envelope) {
    match sender.send(envelope.clone()) {
        Ok(receivers) => {
            tracing::debug!(request_id = %envelope.request_id, receivers, "envelope published")
        }
        Err(_) => {
            tracing::debug!(request_id = %envelope.request_id, "envelope published with no subscribers")
        }
    }
}

#[derive(Default)]
struct Slot {
    pending: Option<SignatureSubmission>,
    notify: Arc<Notify>,
}

/// Single-process rendezvous.
///
/// Published envelopes fan out to every [`subscribe`](Self::subscribe)
/// receiver. With no receiver they are dropped; the pending row still
/// carries the message and nonce.
///
/// Submissions are only accepted for requests with an open waiter in this
/// process; anything else is refused rather than parked.
pub struct InMemoryRendezvous {
    slots: Mutex<HashMap<Uuid, Slot>>,
    envelopes: broadcast::Sender<Envelope>,
}

impl InMemoryRendezvous {
    const ENVELOPE_BUFFER: usize = 256;

    pub fn new() -> Self {
        let (envelopes, _) = broadcast::channel(Self::ENVELOPE_BUFFER);
        Self {
            slots: Mutex::new(HashMap::new()),
            envelopes,
        }
    }

    /// Stream of published envelopes.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.envelopes.subscribe()
    }

    /// Number of open slots.
    pub fn open_slots(&self) -> usize {
        self.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, Slot>>, SigningError> {
        self.slots
            .lock()
            .map_err(|_| SigningError::Rendezvous("rendezvous lock poisoned".to_string()))
    }
}

impl Default for InMemoryRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Rendezvous for InMemoryRendezvous {
    async fn publish(&self, envelope: &Envelope) -> Result<(), SigningError> {
        broadcast_envelope(&self.envelopes, envelope);
        Ok(())
    }

    fn open(&self, request_id: Uuid) {
        if let Ok(mut slots) = self.lock() {
            slots.entry(request_id).or_default();
        }
    }

    async fn deliver(
        &self,
        request_id: Uuid,
        submission: SignatureSubmission,
    ) -> Result<(), SigningError> {
        let mut slots = self.lock()?;
        let Some(slot) = slots.get_mut(&request_id) else {
            return Err(SigningError::Rendezvous(format!(
                "no waiter for request {request_id} in this process"
            )));
        };
        if slot.pending.is_some() {
            tracing::debug!(%request_id, "submission already queued, dropping duplicate");
            return Ok(());
        }
        slot.pending = Some(submission);
        // Stores a permit if nobody is waiting yet.
        slot.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, request_id: Uuid) -> Result<SignatureSubmission, SigningError> {
        loop {
            let notify = {
                let mut slots = self.lock()?;
                let slot = slots.entry(request_id).or_default();
                if let Some(submission) = slot.pending.take() {
                    return Ok(submission);
                }
                slot.notify.clone()
            };
            notify.notified().await;
        }
    }

    fn close(&self, request_id: Uuid) {
        if let Ok(mut slots) = self.lock() {
            slots.remove(&request_id);
        }
    }
}
