use super::teardown::close_peer;
use super::{Engine, Feed, Msg};
use crate::error::{CallError, DescriptorError, MediaError, StoreError};
use crate::media::{LocalStream, RemoteTrack};
use crate::peer::{
    CallEndReason, CallState, Descriptor, DescriptorExchange, IceCandidate, PeerFactory, PeerState,
    Role, ServerConfig,
};
use crate::session::SessionContext;
use crate::signaling::CallEvent;
use crate::store::record::{answer_update, CALLS_COLLECTION};
use crate::store::{
    CallStatus, CreateOutcome, Fields, OnRecordChange, SessionRecord, Subscription,
};
use crate::utils::{is_valid_identity, now_millis, session_key};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// What a record found under our key means for a new outgoing call.
enum Existing {
    /// The target is already ringing us; answer it instead.
    RingingUs(Descriptor),
    /// Left behind by a crashed or abandoned session.
    Orphan,
    Live,
}

impl Engine {
    pub(super) fn start_call(
        &mut self,
        target: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    ) {
        let target = target.trim().to_string();
        if !is_valid_identity(&target) || target == self.local_id {
            let _ = reply.send(Err(CallError::InvalidTarget(target)));
            return;
        }
        if let Some(from) = self.incoming.as_ref().map(|i| i.from.clone()) {
            if from == target {
                info!(%target, "calling a peer that is ringing us, answering");
                self.answer(reply);
            } else {
                let _ = reply.send(Err(CallError::Busy));
            }
            return;
        }
        if self.session.is_some() {
            let _ = reply.send(Err(CallError::Busy));
            return;
        }

        let gen = self.next_generation();
        let key = session_key(&self.local_id, &target);
        info!(%key, %target, "starting call");
        let mut ctx = SessionContext::new(gen, key.clone(), target, Role::Caller, self.store.clone());
        ctx.reply = Some(reply);
        self.session = Some(ctx);
        self.set_state(CallState::Initiating);
        self.spawn_probe(gen, key, false);
    }

    fn spawn_probe(&self, gen: u64, key: String, after_purge: bool) {
        let store = self.store.clone();
        self.spawn(async move {
            let result = store.get_record(CALLS_COLLECTION, &key).await;
            Msg::Probed {
                gen,
                result,
                after_purge,
            }
        });
    }

    fn classify(&self, fields: Fields, target: &str) -> Existing {
        let record = match SessionRecord::from_fields(fields) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "unreadable session record");
                return Existing::Orphan;
            }
        };
        let age = now_millis().saturating_sub(record.created_at);
        let stale = age > self.config.stale_session().as_millis() as i64;
        if record.status == CallStatus::Ended || (record.status == CallStatus::Pending && stale) {
            return Existing::Orphan;
        }
        if record.caller_id == target && record.callee_id == self.local_id && record.is_ringing() {
            if let Some(offer) = record.offer {
                return Existing::RingingUs(offer);
            }
        }
        Existing::Live
    }

    pub(super) fn on_probed(
        &mut self,
        gen: u64,
        result: Result<Option<Fields>, StoreError>,
        after_purge: bool,
    ) {
        let Some(ctx) = self.current(gen) else { return };
        let fields = match result {
            Ok(None) => {
                ctx.resolve(Ok(()));
                self.acquire_media(gen);
                return;
            }
            Ok(Some(fields)) => fields,
            Err(e) => {
                let reason = CallEndReason::SignalingFailed(e.to_string());
                self.refuse_session(e.into(), reason);
                return;
            }
        };
        let key = ctx.key.clone();
        let target = ctx.peer_id.clone();

        match self.classify(fields, &target) {
            Existing::RingingUs(offer) => {
                info!(%key, "peer is already calling us, answering instead");
                self.fall_back_to_callee(gen, offer);
            }
            Existing::Orphan if !after_purge => {
                info!(%key, "purging orphaned session record");
                let store = self.store.clone();
                let policy = self.purge_policy();
                self.spawn(async move {
                    super::purge_session(store.as_ref(), &key, None, &policy).await;
                    let result = store.get_record(CALLS_COLLECTION, &key).await;
                    Msg::Probed {
                        gen,
                        result,
                        after_purge: true,
                    }
                });
            }
            _ => {
                info!(%key, "session already in progress, refusing");
                self.refuse_session(CallError::AlreadyInProgress, CallEndReason::AlreadyInProgress);
            }
        }
    }

    /// Turn the local caller attempt into the callee of the peer's session.
    /// Media already granted is kept; the caller-side peer is discarded.
    fn fall_back_to_callee(&mut self, gen: u64, offer: Descriptor) {
        let next = self.next_generation();
        let store = self.store.clone();
        let Some(ctx) = self.current(gen) else { return };
        if let Some(exchange) = ctx.exchange.take() {
            close_peer(exchange.peer().clone());
        }
        ctx.become_callee(next, store);
        ctx.remote_offer = Some(offer);
        ctx.resolve(Ok(()));
        self.set_state(CallState::Ringing(Role::Callee));
        self.begin_answer(next);
    }

    pub(super) fn answer(&mut self, reply: oneshot::Sender<Result<(), CallError>>) {
        if self.session.is_some() {
            let _ = reply.send(Err(CallError::Busy));
            return;
        }
        let Some(incoming) = self.take_incoming() else {
            let _ = reply.send(Err(CallError::NoIncomingCall));
            return;
        };
        let gen = self.next_generation();
        info!(key = %incoming.key, from = %incoming.from, "answering incoming call");
        let mut ctx = SessionContext::new(
            gen,
            incoming.key.clone(),
            incoming.from,
            Role::Callee,
            self.store.clone(),
        );
        // the record already exists, so hanging up first means purging it
        ctx.owns_record = true;
        ctx.reply = Some(reply);
        self.session = Some(ctx);

        let store = self.store.clone();
        let key = incoming.key;
        self.spawn(async move {
            let result = store.get_record(CALLS_COLLECTION, &key).await;
            Msg::AnswerChecked { gen, result }
        });
    }

    pub(super) fn on_answer_checked(
        &mut self,
        gen: u64,
        result: Result<Option<Fields>, StoreError>,
    ) {
        let Some(ctx) = self.current(gen) else { return };
        let offer = match result {
            Ok(fields) => fields
                .and_then(|f| SessionRecord::from_fields(f).ok())
                .filter(|r| r.is_ringing())
                .and_then(|r| r.offer),
            Err(e) => {
                let reason = CallEndReason::SignalingFailed(e.to_string());
                self.refuse_session(e.into(), reason);
                return;
            }
        };
        match offer {
            Some(offer) => {
                ctx.remote_offer = Some(offer);
                ctx.resolve(Ok(()));
                self.begin_answer(gen);
            }
            None => {
                // gone before anything was allocated: back to idle quietly
                ctx.resolve(Err(CallError::NoIncomingCall));
                let from = ctx.peer_id.clone();
                info!(key = %ctx.key, "incoming call no longer available");
                if let Some(ctx) = self.session.take() {
                    ctx.live.kill();
                }
                self.emit(CallEvent::IncomingCallCancelled { from });
                self.set_state(CallState::Idle);
            }
        }
    }

    /// Watch the record and the caller's candidates, then get media (a
    /// fallen-back caller already has it) and answer.
    fn begin_answer(&mut self, gen: u64) {
        self.subscribe_record(gen);
        self.subscribe_candidates(gen);
        let stream = self.current(gen).and_then(|c| c.stream.clone());
        match stream {
            Some(stream) => self.spawn_peer(gen, Role::Callee, stream),
            None => self.acquire_media(gen),
        }
    }

    fn acquire_media(&self, gen: u64) {
        let media = self.media.clone();
        let constraints = self.config.media;
        self.spawn(async move {
            let result = media.acquire(constraints).await;
            Msg::MediaReady { gen, result }
        });
    }

    pub(super) fn on_media_ready(&mut self, gen: u64, result: Result<LocalStream, MediaError>) {
        if !self.is_current(gen) {
            if let Ok(stream) = result {
                debug!("media granted after the call ended, releasing");
                self.media.release(&stream);
            }
            return;
        }
        let Some(ctx) = self.current(gen) else { return };
        let owns_record = ctx.owns_record;
        match result {
            Ok(stream) => {
                ctx.stream = Some(stream.clone());
                let role = ctx.role;
                self.spawn_peer(gen, role, stream);
            }
            Err(MediaError::PermissionDenied) => {
                warn!("media permission denied");
                self.end_session(owns_record, CallEndReason::PermissionDenied);
            }
            Err(e) => {
                warn!(error = %e, "could not open local media");
                self.end_session(owns_record, CallEndReason::SignalingFailed(e.to_string()));
            }
        }
    }

    fn spawn_peer(&self, gen: u64, role: Role, stream: LocalStream) {
        let peers = self.peers.clone();
        let servers = self.config.effective_ice_servers();
        let tx = self.tx.clone();
        self.spawn(async move {
            let result = open_peer(peers, servers, gen, role, stream, tx).await;
            Msg::PeerCreated { gen, result }
        });
    }

    pub(super) fn on_peer_created(
        &mut self,
        gen: u64,
        result: Result<Arc<DescriptorExchange>, CallError>,
    ) {
        if !self.is_current(gen) {
            if let Ok(exchange) = result {
                close_peer(exchange.peer().clone());
            }
            return;
        }
        let Some(ctx) = self.current(gen) else { return };
        match result {
            Ok(exchange) => {
                ctx.exchange = Some(exchange.clone());
                let remote_offer = ctx.remote_offer.clone();
                self.spawn(async move {
                    let result = match remote_offer {
                        None => exchange.create_local_offer().await,
                        Some(offer) => exchange.create_local_answer(offer).await,
                    };
                    Msg::Negotiated { gen, result }
                });
            }
            Err(e) => {
                warn!(error = %e, "could not set up the peer connection");
                let owns_record = ctx.owns_record;
                self.end_session(owns_record, CallEndReason::SignalingFailed(e.to_string()));
            }
        }
    }

    pub(super) fn on_negotiated(&mut self, gen: u64, result: Result<Descriptor, DescriptorError>) {
        let local = self.local_id.clone();
        let store = self.store.clone();
        let Some(ctx) = self.current(gen) else { return };
        let owns_record = ctx.owns_record;
        let local_desc = match result {
            Ok(d) => d,
            Err(DescriptorError::Malformed(msg)) => {
                warn!(key = %ctx.key, %msg, "remote offer is malformed");
                self.end_session(owns_record, CallEndReason::MalformedDescriptor);
                return;
            }
            Err(e) => {
                warn!(key = %ctx.key, error = %e, "negotiation failed");
                self.end_session(owns_record, CallEndReason::SignalingFailed(e.to_string()));
                return;
            }
        };
        let key = ctx.key.clone();

        match ctx.role {
            Role::Caller => {
                let record =
                    SessionRecord::pending(&local, &ctx.peer_id, local_desc, now_millis());
                let fields = match record.to_fields() {
                    Ok(f) => f,
                    Err(e) => {
                        self.end_session(false, CallEndReason::SignalingFailed(e.to_string()));
                        return;
                    }
                };
                self.spawn(async move {
                    let result = store.create_record(CALLS_COLLECTION, &key, fields).await;
                    Msg::Created { gen, key, result }
                });
            }
            Role::Callee => {
                // the offer went in with the answer; queued candidates can flow
                if let Some(exchange) = ctx.exchange.clone() {
                    ctx.relay.start_applying(exchange.peer().clone());
                }
                let partial = match answer_update(&local_desc, &local) {
                    Ok(p) => p,
                    Err(e) => {
                        self.end_session(owns_record, CallEndReason::SignalingFailed(e.to_string()));
                        return;
                    }
                };
                self.spawn(async move {
                    let result = store.update_record(CALLS_COLLECTION, &key, partial).await;
                    Msg::AnswerPublished { gen, result }
                });
            }
        }
    }

    pub(super) fn on_created(
        &mut self,
        gen: u64,
        key: String,
        result: Result<CreateOutcome, StoreError>,
    ) {
        if !self.is_current(gen) {
            // hung up while the write was in flight: nobody owns this record
            if let Ok(CreateOutcome::Created) = result {
                info!(%key, "session record created after teardown, purging");
                self.spawn_purge(key, None, None);
            }
            return;
        }
        let Some(ctx) = self.current(gen) else { return };
        match result {
            Ok(CreateOutcome::Created) => {
                ctx.owns_record = true;
                ctx.relay.start_streaming();
                self.subscribe_record(gen);
                self.subscribe_candidates(gen);
                self.start_ring_timer(gen);
                self.set_state(CallState::Ringing(Role::Caller));
                info!(%key, "ringing");
            }
            Ok(CreateOutcome::AlreadyExists(fields)) => {
                let target = ctx.peer_id.clone();
                match self.classify(fields, &target) {
                    Existing::RingingUs(offer) => {
                        info!(%key, "lost the race for the session, answering the peer's call");
                        self.fall_back_to_callee(gen, offer);
                    }
                    _ => {
                        info!(%key, "session already in progress");
                        self.end_session(false, CallEndReason::AlreadyInProgress);
                    }
                }
            }
            Err(e) => {
                warn!(%key, error = %e, "could not write the session record");
                self.end_session(false, CallEndReason::SignalingFailed(e.to_string()));
            }
        }
    }

    pub(super) fn on_answer_published(&mut self, gen: u64, result: Result<(), StoreError>) {
        let Some(ctx) = self.current(gen) else { return };
        match result {
            Ok(()) => {
                ctx.relay.start_streaming();
                info!(key = %ctx.key, "answer published");
                self.set_state(CallState::Connected(Role::Callee));
            }
            Err(StoreError::NotFound(_)) => {
                debug!(key = %ctx.key, "record vanished before the answer landed");
                self.end_session(false, CallEndReason::RemoteHangUp);
            }
            Err(e) => {
                warn!(key = %ctx.key, error = %e, "could not publish the answer");
                let owns_record = ctx.owns_record;
                self.end_session(owns_record, CallEndReason::SignalingFailed(e.to_string()));
            }
        }
    }

    fn subscribe_record(&self, gen: u64) {
        let Some(key) = self.session.as_ref().map(|c| c.key.clone()) else {
            return;
        };
        let store = self.store.clone();
        let tx = self.tx.clone();
        self.spawn(async move {
            let listener: OnRecordChange = Box::new(move |fields: Option<Fields>| {
                let _ = tx.send(Msg::RecordChanged { gen, fields });
            });
            let result = store.subscribe_record(CALLS_COLLECTION, &key, listener).await;
            Msg::Subscribed {
                gen,
                feed: Feed::Record,
                result,
            }
        });
    }

    fn subscribe_candidates(&mut self, gen: u64) {
        let tx = self.tx.clone();
        let Some(ctx) = self.current(gen) else { return };
        let subscribe = ctx
            .relay
            .subscribe_remote_candidates(Box::new(move |candidate: IceCandidate| {
                let _ = tx.send(Msg::RemoteCandidate { gen, candidate });
            }));
        self.spawn(async move {
            Msg::Subscribed {
                gen,
                feed: Feed::Candidates,
                result: subscribe.await,
            }
        });
    }

    pub(super) fn on_subscribed(
        &mut self,
        gen: u64,
        feed: Feed,
        result: Result<Subscription, StoreError>,
    ) {
        // a subscription for a dead session is dropped here, which cancels it
        let Some(ctx) = self.current(gen) else { return };
        match result {
            Ok(sub) => match feed {
                Feed::Record => ctx.record_sub = Some(sub),
                Feed::Candidates => ctx.candidate_sub = Some(sub),
            },
            Err(e) => {
                warn!(key = %ctx.key, ?feed, error = %e, "subscription failed");
                let owns_record = ctx.owns_record;
                self.end_session(owns_record, CallEndReason::SignalingFailed(e.to_string()));
            }
        }
    }

    pub(super) fn on_record_changed(&mut self, gen: u64, fields: Option<Fields>) {
        let Some(ctx) = self.current(gen) else { return };
        let Some(fields) = fields else {
            debug!(key = %ctx.key, "session record deleted");
            self.end_session(false, CallEndReason::RemoteHangUp);
            return;
        };
        let record = match SessionRecord::from_fields(fields) {
            Ok(r) => r,
            Err(e) => {
                warn!(key = %ctx.key, error = %e, "ignoring unreadable session record");
                return;
            }
        };
        if record.status == CallStatus::Ended {
            let reason = if record.declined() {
                CallEndReason::Declined
            } else {
                CallEndReason::RemoteHangUp
            };
            info!(key = %ctx.key, ?reason, "remote side ended the call");
            self.end_session(false, reason);
            return;
        }
        if ctx.role != Role::Caller || ctx.answer_seen {
            return;
        }
        let (Some(answer), Some(exchange)) = (record.answer, ctx.exchange.clone()) else {
            return;
        };
        ctx.answer_seen = true;
        self.spawn(async move {
            let result = exchange.apply_remote_descriptor(answer).await;
            Msg::RemoteApplied { gen, result }
        });
    }

    pub(super) fn on_remote_applied(&mut self, gen: u64, result: Result<(), DescriptorError>) {
        let Some(ctx) = self.current(gen) else { return };
        let owns_record = ctx.owns_record;
        match result {
            Ok(()) => {
                if let Some(exchange) = ctx.exchange.clone() {
                    ctx.relay.start_applying(exchange.peer().clone());
                }
                if let Some(timer) = ctx.ring_timer.take() {
                    timer.abort();
                }
                let role = ctx.role;
                info!(key = %ctx.key, "answer applied");
                self.set_state(CallState::Connected(role));
            }
            Err(DescriptorError::Malformed(msg)) => {
                warn!(key = %ctx.key, %msg, "remote answer is malformed");
                self.end_session(owns_record, CallEndReason::MalformedDescriptor);
            }
            Err(e) => {
                warn!(key = %ctx.key, error = %e, "remote answer could not be applied");
                self.end_session(owns_record, CallEndReason::SignalingFailed(e.to_string()));
            }
        }
    }

    fn start_ring_timer(&mut self, gen: u64) {
        let ring = self.config.ring_timeout();
        let tx = self.tx.clone();
        if let Some(ctx) = self.current(gen) {
            ctx.ring_timer = Some(tokio::spawn(async move {
                sleep(ring).await;
                let _ = tx.send(Msg::RingTimeout { gen });
            }));
        }
    }

    pub(super) fn on_ring_timeout(&mut self, gen: u64) {
        if self.is_current(gen) && self.state == CallState::Ringing(Role::Caller) {
            info!("no answer, giving up");
            self.end_session(true, CallEndReason::NoAnswer);
        }
    }

    pub(super) fn on_peer_state(&mut self, gen: u64, state: PeerState) {
        let grace = self.config.disconnect_grace();
        let tx = self.tx.clone();
        let Some(ctx) = self.current(gen) else { return };
        match state {
            PeerState::Connected => {
                if let Some(timer) = ctx.grace_timer.take() {
                    timer.abort();
                    info!(key = %ctx.key, "connection recovered during grace period");
                    self.emit(CallEvent::ConnectionRecovered);
                }
            }
            PeerState::Disconnected => {
                if ctx.grace_timer.is_none() {
                    warn!(
                        key = %ctx.key,
                        "Grace period started, waiting {} s",
                        grace.as_secs()
                    );
                    ctx.grace_timer = Some(tokio::spawn(async move {
                        sleep(grace).await;
                        let _ = tx.send(Msg::GraceExpired { gen });
                    }));
                    self.emit(CallEvent::ConnectionProblem);
                }
            }
            PeerState::Failed => {
                warn!(key = %ctx.key, "transport failed");
                let owns_record = ctx.owns_record;
                self.end_session(owns_record, CallEndReason::TransportFailed);
            }
            other => debug!(key = %ctx.key, state = ?other, "peer state"),
        }
    }

    pub(super) fn on_grace_expired(&mut self, gen: u64) {
        let Some(ctx) = self.current(gen) else { return };
        warn!(key = %ctx.key, "connection did not recover");
        let owns_record = ctx.owns_record;
        self.end_session(owns_record, CallEndReason::TransportFailed);
    }

    pub(super) fn hang_up(&mut self) {
        if self.session.is_some() {
            self.end_session(true, CallEndReason::LocalHangUp);
        } else if self.incoming.is_some() {
            let _ = self.decline();
        } else {
            debug!("hang up with no call, nothing to do");
        }
    }
}

/// Create the peer connection, route its callbacks into the inbox and
/// attach local tracks.
async fn open_peer(
    peers: Arc<dyn PeerFactory>,
    servers: Vec<ServerConfig>,
    gen: u64,
    role: Role,
    stream: LocalStream,
    tx: mpsc::UnboundedSender<Msg>,
) -> Result<Arc<DescriptorExchange>, CallError> {
    let pc = peers.create_peer_connection(&servers).await?;

    let candidates = tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: IceCandidate| {
        let _ = candidates.send(Msg::LocalCandidate { gen, candidate });
    }));
    let tracks = tx.clone();
    pc.on_remote_track(Box::new(move |track: RemoteTrack| {
        let _ = tracks.send(Msg::RemoteTrack { gen, track });
    }));
    pc.on_state_change(Box::new(move |state: PeerState| {
        let _ = tx.send(Msg::PeerState { gen, state });
    }));

    let exchange = Arc::new(DescriptorExchange::new(pc, role));
    if let Err(e) = exchange.attach_stream(&stream).await {
        close_peer(exchange.peer().clone());
        return Err(e.into());
    }
    Ok(exchange)
}
