//! Incoming-call watcher.
//!
//! One live query per engine over records ringing the local identity. It
//! runs whatever conversation the UI shows; the session key on each
//! record tells the host which conversation the call belongs to.

use super::{Engine, Msg};
use crate::error::{CallError, StoreError};
use crate::peer::{CallEndReason, CallState, Role};
use crate::signaling::CallEvent;
use crate::store::record::{incoming_filter, CALLS_COLLECTION, END_REASON_DECLINED};
use crate::store::{Fields, OnQueryChange, QueryChange, SessionRecord};
use crate::utils::{now_millis, session_key};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// A ringing call nobody has answered yet. No media or peer exists for it.
pub(crate) struct Incoming {
    pub key: String,
    pub from: String,
    timer: JoinHandle<()>,
}

impl Engine {
    pub(crate) async fn install_watcher(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.clone();
        let listener: OnQueryChange = Box::new(move |change: QueryChange| {
            let _ = tx.send(Msg::Incoming(change));
        });
        let sub = self
            .store
            .subscribe_query(CALLS_COLLECTION, incoming_filter(&self.local_id), listener)
            .await?;
        debug!(local = %self.local_id, "incoming-call watcher installed");
        self.watcher = Some(sub);
        Ok(())
    }

    pub(super) fn on_query_change(&mut self, change: QueryChange) {
        match change {
            QueryChange::Added { key, fields } | QueryChange::Modified { key, fields } => {
                self.surface_incoming(key, fields)
            }
            QueryChange::Removed { key } => self.on_incoming_removed(&key),
        }
    }

    fn surface_incoming(&mut self, key: String, fields: Fields) {
        if self.incoming.as_ref().map(|i| i.key == key).unwrap_or(false) {
            return;
        }
        let record = match SessionRecord::from_fields(fields) {
            Ok(r) => r,
            Err(e) => {
                warn!(%key, error = %e, "ignoring unreadable incoming record");
                return;
            }
        };
        if record.callee_id != self.local_id
            || key != session_key(&self.local_id, &record.caller_id)
        {
            warn!(%key, caller = %record.caller_id, "incoming record does not match its key, ignored");
            return;
        }
        if !record.is_ringing() || record.offer.is_none() {
            return;
        }
        if let Some(ctx) = &self.session {
            // our own session with this peer (a fallback in progress) is not a new call
            if ctx.key != key {
                debug!(%key, "busy, not surfacing incoming call");
            }
            return;
        }
        if self.incoming.is_some() {
            debug!(%key, "another call is already ringing, not surfacing");
            return;
        }
        let age = now_millis().saturating_sub(record.created_at);
        if age > self.config.stale_session().as_millis() as i64 {
            debug!(%key, age, "ignoring stale incoming record");
            return;
        }

        let ring = self.config.ring_timeout();
        let tx = self.tx.clone();
        let expire_key = key.clone();
        let timer = tokio::spawn(async move {
            sleep(ring).await;
            let _ = tx.send(Msg::IncomingExpired { key: expire_key });
        });
        let from = record.caller_id;
        info!(%key, %from, "incoming call");
        self.incoming = Some(Incoming {
            key: key.clone(),
            from: from.clone(),
            timer,
        });
        self.set_state(CallState::Ringing(Role::Callee));
        self.emit(CallEvent::IncomingCall {
            from,
            session_key: key,
        });
    }

    fn on_incoming_removed(&mut self, key: &str) {
        if self.incoming.as_ref().map(|i| i.key != key).unwrap_or(true) {
            return;
        }
        if let Some(incoming) = self.take_incoming() {
            info!(%key, from = %incoming.from, "incoming call cancelled");
            self.emit(CallEvent::IncomingCallCancelled {
                from: incoming.from,
            });
            self.set_state(CallState::Idle);
        }
    }

    pub(super) fn on_incoming_expired(&mut self, key: &str) {
        if self.incoming.as_ref().map(|i| i.key != key).unwrap_or(true) {
            return;
        }
        if let Some(incoming) = self.take_incoming() {
            info!(%key, from = %incoming.from, "missed call");
            self.set_state(CallState::Ended);
            self.emit(CallEvent::CallEnded {
                reason: CallEndReason::Missed,
            });
            self.set_state(CallState::Idle);
        }
    }

    /// Refuse the ringing call. The callee originates the teardown, so the
    /// caller sees `endReason = declined` before the record goes away.
    pub(super) fn decline(&mut self) -> Result<(), CallError> {
        let incoming = self.take_incoming().ok_or(CallError::NoIncomingCall)?;
        info!(key = %incoming.key, from = %incoming.from, "declining incoming call");
        self.spawn_purge(incoming.key, Some(END_REASON_DECLINED), None);
        self.set_state(CallState::Ended);
        self.emit(CallEvent::CallEnded {
            reason: CallEndReason::Declined,
        });
        self.set_state(CallState::Idle);
        Ok(())
    }

    pub(super) fn take_incoming(&mut self) -> Option<Incoming> {
        let incoming = self.incoming.take()?;
        incoming.timer.abort();
        Some(incoming)
    }
}
