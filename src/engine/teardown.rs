use super::Engine;
use crate::config::EngineConfig;
use crate::error::{CallError, StoreError};
use crate::peer::{CallEndReason, CallState, PeerConnection};
use crate::signaling::CallEvent;
use crate::store::record::{
    ended_update, local_candidates, ANSWER_CANDIDATES, CALLS_COLLECTION, END_REASON_DECLINED,
    OFFER_CANDIDATES,
};
use crate::store::SignalingStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Retry-then-abandon bounds for purging a session from the store.
#[derive(Debug, Clone, Copy)]
pub struct PurgePolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub op_timeout: Duration,
}

impl PurgePolicy {
    /// Upper bound on how long one purge may run.
    pub fn budget(&self) -> Duration {
        (self.op_timeout * 2 + self.backoff) * self.attempts.max(1)
    }
}

impl From<&EngineConfig> for PurgePolicy {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            attempts: cfg.cleanup_attempts,
            backoff: cfg.cleanup_backoff(),
            op_timeout: cfg.store_op_timeout(),
        }
    }
}

async fn timed<T>(
    limit: Duration,
    op: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    timeout(limit, op).await.map_err(|_| StoreError::Timeout)?
}

async fn purge_once(
    store: &dyn SignalingStore,
    key: &str,
    end_reason: Option<&str>,
    op_timeout: Duration,
) -> Result<(), StoreError> {
    // status first: the other side tears down on it before anything is deleted
    match timed(
        op_timeout,
        store.update_record(CALLS_COLLECTION, key, ended_update(end_reason)),
    )
    .await
    {
        Ok(()) | Err(StoreError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    for sub in [OFFER_CANDIDATES, ANSWER_CANDIDATES] {
        let items = timed(op_timeout, store.list_subcollection(key, sub)).await?;
        for item in items {
            timed(op_timeout, store.delete_item(key, sub, &item.id)).await?;
        }
    }
    timed(op_timeout, store.delete_record(CALLS_COLLECTION, key)).await
}

/// Mark a session ended, delete both candidate sub-collections, then the
/// record. Returns false when every attempt failed and the purge was
/// abandoned.
pub async fn purge_session(
    store: &dyn SignalingStore,
    key: &str,
    end_reason: Option<&str>,
    policy: &PurgePolicy,
) -> bool {
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        match purge_once(store, key, end_reason, policy.op_timeout).await {
            Ok(()) => {
                info!(%key, attempt, "session purged");
                return true;
            }
            Err(e) => {
                warn!(%key, attempt, error = %e, "session purge failed");
                if attempt < attempts {
                    sleep(policy.backoff * attempt).await;
                }
            }
        }
    }
    warn!(%key, "giving up on session purge, record may be left behind");
    false
}

/// Delete the listed items of one sub-collection, retrying the ones that
/// failed. Returns false when some were left behind.
pub(super) async fn sweep_items(
    store: &dyn SignalingStore,
    key: &str,
    sub: &str,
    mut ids: Vec<String>,
    policy: &PurgePolicy,
) -> bool {
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        let mut failed = Vec::new();
        for id in ids {
            match timed(policy.op_timeout, store.delete_item(key, sub, &id)).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    debug!(%key, sub, error = %e, "candidate delete failed");
                    failed.push(id);
                }
            }
        }
        if failed.is_empty() {
            return true;
        }
        ids = failed;
        if attempt < attempts {
            sleep(policy.backoff * attempt).await;
        }
    }
    warn!(%key, sub, left = ids.len(), "giving up on candidate sweep");
    false
}

pub(super) fn close_peer(pc: Arc<dyn PeerConnection>) {
    tokio::spawn(async move {
        if let Err(e) = pc.close().await {
            debug!(error = %e, "peer close failed");
        }
    });
}

impl Engine {
    pub(super) fn purge_policy(&self) -> PurgePolicy {
        PurgePolicy::from(&self.config)
    }

    /// The single exit of every call. Local resources are released right
    /// away; the store purge runs in the background when this endpoint
    /// originates the teardown of a record it may purge.
    pub(super) fn end_session(&mut self, is_originator: bool, reason: CallEndReason) {
        self.finish_session(is_originator, reason, None);
    }

    /// End a call whose request is still pending. The caller learns why
    /// from the returned error; no `CallEnded` is announced.
    pub(super) fn refuse_session(&mut self, err: CallError, reason: CallEndReason) {
        self.finish_session(false, reason, Some(err));
    }

    fn finish_session(
        &mut self,
        is_originator: bool,
        reason: CallEndReason,
        refusal: Option<CallError>,
    ) {
        let Some(mut ctx) = self.session.take() else {
            debug!(?reason, "no live session to end");
            return;
        };
        ctx.live.kill();
        ctx.cancel_timers();
        ctx.record_sub.take();
        ctx.candidate_sub.take();
        let publisher = ctx.relay.stop();
        if let Some(stream) = ctx.stream.take() {
            self.media.release(&stream);
        }
        if let Some(exchange) = ctx.exchange.take() {
            close_peer(exchange.peer().clone());
        }
        // only a call the host was told had started gets an end event
        let announced = ctx.reply.is_none();
        ctx.resolve(Err(refusal.unwrap_or(CallError::Cancelled)));
        info!(
            key = %ctx.key,
            role = %ctx.role,
            originator = is_originator,
            ?reason,
            "call ended"
        );

        if is_originator && ctx.owns_record {
            let tag = match reason {
                CallEndReason::Declined => Some(END_REASON_DECLINED),
                _ => None,
            };
            self.spawn_purge(ctx.key.clone(), tag, publisher);
        } else if let Some(publisher) = publisher {
            self.spawn_sweep(ctx.key.clone(), local_candidates(ctx.role), publisher);
        }

        if announced {
            self.set_state(CallState::Ended);
            self.emit(CallEvent::CallEnded { reason });
        }
        self.set_state(CallState::Idle);
    }

    /// Purge in the background. In-flight candidate writes finish first so
    /// none lands after the sub-collections are emptied.
    pub(super) fn spawn_purge(
        &mut self,
        key: String,
        end_reason: Option<&'static str>,
        publisher: Option<JoinHandle<Vec<String>>>,
    ) {
        let store = self.store.clone();
        let policy = self.purge_policy();
        let handle = tokio::spawn(async move {
            if let Some(publisher) = publisher {
                if timeout(policy.op_timeout, publisher).await.is_err() {
                    debug!(%key, "candidate publisher still busy, purging anyway");
                }
            }
            purge_session(store.as_ref(), &key, end_reason, &policy).await;
        });
        self.track(handle);
    }

    /// The other side purges the session, but a write of ours can land
    /// after it has emptied the sub-collections. Remove what we wrote.
    fn spawn_sweep(&mut self, key: String, sub: &'static str, publisher: JoinHandle<Vec<String>>) {
        let store = self.store.clone();
        let policy = self.purge_policy();
        let handle = tokio::spawn(async move {
            let written = match timeout(policy.op_timeout, publisher).await {
                Ok(Ok(ids)) => ids,
                Ok(Err(e)) => {
                    debug!(%key, error = %e, "candidate publisher did not finish");
                    return;
                }
                Err(_) => {
                    debug!(%key, "candidate publisher still busy, skipping sweep");
                    return;
                }
            };
            sweep_items(store.as_ref(), &key, sub, written, &policy).await;
        });
        self.track(handle);
    }

    fn track(&mut self, handle: JoinHandle<()>) {
        self.purges.retain(|h| !h.is_finished());
        self.purges.push(handle);
    }

    pub(super) async fn shutdown(&mut self) {
        info!(local = %self.local_id, "shutting down call engine");
        self.end_session(true, CallEndReason::Shutdown);
        self.take_incoming();
        self.watcher.take();

        let deadline = Instant::now() + self.purge_policy().budget();
        for handle in self.purges.drain(..) {
            if timeout_at(deadline, handle).await.is_err() {
                warn!("session purge still running at shutdown, detaching");
                break;
            }
        }
    }
}
