use crate::error::CallError;
use crate::media::LocalStream;
use crate::peer::descriptor::DescriptorExchange;
use crate::peer::ice::CandidateRelay;
use crate::peer::state::Role;
use crate::peer::types::Descriptor;
use crate::store::{SignalingStore, Subscription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Shared "session still live" flag, checked by every continuation that
/// outlives the engine's own bookkeeping.
#[derive(Clone, Debug)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn kill(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory state of one call, owned by the engine loop.
pub struct SessionContext {
    /// Stamped on every message a continuation posts back, so messages
    /// from an earlier session are recognised and dropped.
    pub generation: u64,
    pub key: String,
    pub peer_id: String,
    pub role: Role,
    pub live: Liveness,
    pub stream: Option<LocalStream>,
    pub exchange: Option<Arc<DescriptorExchange>>,
    /// The caller's offer, once this endpoint is answering.
    pub remote_offer: Option<Descriptor>,
    pub relay: CandidateRelay,
    pub record_sub: Option<Subscription>,
    pub candidate_sub: Option<Subscription>,
    /// Whether ending this call as originator must purge the shared record.
    pub owns_record: bool,
    pub answer_seen: bool,
    pub ring_timer: Option<JoinHandle<()>>,
    pub grace_timer: Option<JoinHandle<()>>,
    /// Completes the pending `start_call` once the collision check is done.
    pub reply: Option<oneshot::Sender<Result<(), CallError>>>,
}

impl SessionContext {
    pub fn new(
        generation: u64,
        key: String,
        peer_id: String,
        role: Role,
        store: Arc<dyn SignalingStore>,
    ) -> Self {
        let live = Liveness::new();
        let relay = CandidateRelay::new(store, key.clone(), role, live.clone());
        Self {
            generation,
            key,
            peer_id,
            role,
            live,
            stream: None,
            exchange: None,
            remote_offer: None,
            relay,
            record_sub: None,
            candidate_sub: None,
            owns_record: false,
            answer_seen: false,
            ring_timer: None,
            grace_timer: None,
            reply: None,
        }
    }

    /// Switch a losing caller over to the callee side of the same key.
    /// The new generation orphans callbacks of the discarded peer.
    pub fn become_callee(&mut self, generation: u64, store: Arc<dyn SignalingStore>) {
        self.generation = generation;
        self.role = Role::Callee;
        self.relay = CandidateRelay::new(store, self.key.clone(), Role::Callee, self.live.clone());
        self.exchange = None;
        self.owns_record = true;
        self.answer_seen = false;
        self.cancel_timers();
    }

    pub fn resolve(&mut self, result: Result<(), CallError>) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(result);
        }
    }

    pub fn cancel_timers(&mut self) {
        if let Some(t) = self.ring_timer.take() {
            t.abort();
        }
        if let Some(t) = self.grace_timer.take() {
            t.abort();
        }
    }
}
