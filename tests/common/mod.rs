//! Shared fakes and helpers for the call engine integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use duet_call::error::{MediaError, PeerError};
use duet_call::media::{LocalStream, LocalTrack, MediaConstraints, RemoteTrack};
use duet_call::peer::{
    Descriptor, IceCandidate, OnLocalCandidate, OnPeerState, OnRemoteTrack, PeerConnection,
    PeerState, ServerConfig,
};
use duet_call::error::StoreError;
use duet_call::store::{
    CreateOutcome, Fields, OnItemAdded, OnQueryChange, OnRecordChange, SubItem, Subscription,
};
use duet_call::{
    CallEndReason, CallEngine, CallEvent, CallState, EngineConfig, EventReceiver, MediaKind,
    MediaSource, MemoryStore, PeerFactory, SignalingStore,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

pub const WAIT: Duration = Duration::from_secs(3);

/// Peer connection that negotiates instantly and gathers two host
/// candidates as soon as its local description is set.
pub struct FakePeer {
    pub index: usize,
    offer_sdp: String,
    on_candidate: Mutex<Option<OnLocalCandidate>>,
    on_track: Mutex<Option<OnRemoteTrack>>,
    on_state: Mutex<Option<OnPeerState>>,
    pub tracks: Mutex<Vec<String>>,
    pub remote_descriptions: Mutex<Vec<Descriptor>>,
    pub applied: Mutex<Vec<IceCandidate>>,
    /// Candidate string `add_ice_candidate` fails on.
    pub rejected: Mutex<Option<String>>,
    pub closed: AtomicBool,
}

impl FakePeer {
    pub fn candidate(peer: usize, n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.{peer}.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    pub fn emit_state(&self, state: PeerState) {
        if let Some(h) = self.on_state.lock().unwrap().as_ref() {
            h(state);
        }
    }

    /// Trickle one more local candidate, as a late srflx or relay would.
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        if let Some(h) = self.on_candidate.lock().unwrap().as_ref() {
            h(candidate);
        }
    }

    pub fn remote_description_count(&self) -> usize {
        self.remote_descriptions.lock().unwrap().len()
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn reject(&self, candidate: &str) {
        *self.rejected.lock().unwrap() = Some(candidate.to_string());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_track(&self, track: &LocalTrack, _stream_id: &str) -> Result<(), PeerError> {
        self.tracks.lock().unwrap().push(track.id.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<Descriptor, PeerError> {
        Ok(Descriptor::offer(self.offer_sdp.clone()))
    }

    async fn create_answer(&self) -> Result<Descriptor, PeerError> {
        Ok(Descriptor::answer(format!(
            "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=answer\r\n",
            self.index
        )))
    }

    async fn set_local_description(&self, _desc: Descriptor) -> Result<(), PeerError> {
        if let Some(h) = self.on_candidate.lock().unwrap().as_ref() {
            h(Self::candidate(self.index, 1));
            h(Self::candidate(self.index, 2));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: Descriptor) -> Result<(), PeerError> {
        self.remote_descriptions.lock().unwrap().push(desc);
        if let Some(h) = self.on_track.lock().unwrap().as_ref() {
            h(RemoteTrack {
                id: format!("remote-audio-{}", self.index),
                stream_id: format!("remote-{}", self.index),
                kind: MediaKind::Audio,
            });
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.rejected.lock().unwrap().as_deref() == Some(candidate.candidate.as_str()) {
            return Err(PeerError::Backend("candidate rejected".into()));
        }
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    fn on_ice_candidate(&self, handler: OnLocalCandidate) {
        *self.on_candidate.lock().unwrap() = Some(handler);
    }

    fn on_remote_track(&self, handler: OnRemoteTrack) {
        *self.on_track.lock().unwrap() = Some(handler);
    }

    fn on_state_change(&self, handler: OnPeerState) {
        *self.on_state.lock().unwrap() = Some(handler);
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
    pub malformed_offer: AtomicBool,
}

impl FakePeerFactory {
    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.peers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no peer connection created")
    }

    pub fn all_closed(&self) -> bool {
        self.peers.lock().unwrap().iter().all(|p| p.is_closed())
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create_peer_connection(
        &self,
        _ice_servers: &[ServerConfig],
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let mut peers = self.peers.lock().unwrap();
        let index = peers.len() + 1;
        let offer_sdp = if self.malformed_offer.load(Ordering::SeqCst) {
            "this is not a session description".to_string()
        } else {
            format!("v=0\r\no=- {index} 0 IN IP4 127.0.0.1\r\ns=offer\r\n")
        };
        let peer = Arc::new(FakePeer {
            index,
            offer_sdp,
            on_candidate: Mutex::new(None),
            on_track: Mutex::new(None),
            on_state: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            rejected: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        peers.push(peer.clone());
        Ok(peer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Allow,
    Deny,
    /// The permission prompt never resolves.
    Pending,
}

pub struct FakeMedia {
    mode: Mutex<Grant>,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub toggles: Mutex<Vec<(MediaKind, bool)>>,
}

impl FakeMedia {
    pub fn new(mode: Grant) -> Self {
        Self {
            mode: Mutex::new(mode),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            toggles: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: Grant) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self, _constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        let mode = *self.mode.lock().unwrap();
        match mode {
            Grant::Allow => {
                let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(LocalStream {
                    id: format!("local-{n}"),
                    tracks: vec![
                        LocalTrack {
                            id: format!("mic-{n}"),
                            kind: MediaKind::Audio,
                        },
                        LocalTrack {
                            id: format!("cam-{n}"),
                            kind: MediaKind::Video,
                        },
                    ],
                })
            }
            Grant::Deny => Err(MediaError::PermissionDenied),
            Grant::Pending => std::future::pending().await,
        }
    }

    fn release(&self, _stream: &LocalStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn set_enabled(&self, _stream: &LocalStream, kind: MediaKind, enabled: bool) {
        self.toggles.lock().unwrap().push((kind, enabled));
    }
}

/// Short timers so timeout paths run quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        ring_timeout_ms: 2_000,
        disconnect_grace_ms: 200,
        cleanup_attempts: 3,
        cleanup_backoff_ms: 20,
        store_op_timeout_ms: 500,
        ..EngineConfig::default()
    }
}

pub struct Endpoint {
    pub engine: CallEngine,
    pub events: EventReceiver,
    pub peers: Arc<FakePeerFactory>,
    pub media: Arc<FakeMedia>,
}

pub async fn endpoint(id: &str, store: &MemoryStore) -> Endpoint {
    endpoint_with(id, store, fast_config(), Grant::Allow).await
}

pub async fn endpoint_with(
    id: &str,
    store: &MemoryStore,
    config: EngineConfig,
    grant: Grant,
) -> Endpoint {
    endpoint_over(id, Arc::new(store.clone()), config, grant).await
}

/// Endpoint talking to an arbitrary store, such as a [`SlowStore`].
pub async fn endpoint_over(
    id: &str,
    store: Arc<dyn SignalingStore>,
    config: EngineConfig,
    grant: Grant,
) -> Endpoint {
    duet_call::logger::init();
    let peers = Arc::new(FakePeerFactory::default());
    let media = Arc::new(FakeMedia::new(grant));
    let (engine, events) = CallEngine::spawn(
        id,
        config,
        store,
        peers.clone(),
        media.clone(),
    )
    .await
    .expect("engine starts");
    Endpoint {
        engine,
        events,
        peers,
        media,
    }
}

impl Endpoint {
    /// Wait for the first event matching `pred`, skipping the rest.
    pub async fn expect(&mut self, what: &str, pred: impl Fn(&CallEvent) -> bool) -> CallEvent {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match timeout(left, self.events.recv()).await {
                Ok(Some(ev)) if pred(&ev) => return ev,
                Ok(Some(_)) => continue,
                Ok(None) => panic!("event stream closed while waiting for {what}"),
                Err(_) => panic!("timed out waiting for {what}"),
            }
        }
    }

    pub async fn expect_state(&mut self, state: CallState) {
        self.expect(&format!("state {state}"), |ev| {
            *ev == CallEvent::StateChanged(state)
        })
        .await;
    }

    pub async fn expect_ended(&mut self) -> CallEndReason {
        match self
            .expect("call ended", |ev| matches!(ev, CallEvent::CallEnded { .. }))
            .await
        {
            CallEvent::CallEnded { reason } => reason,
            _ => unreachable!(),
        }
    }

    pub async fn expect_incoming(&mut self) -> (String, String) {
        match self
            .expect("incoming call", |ev| matches!(ev, CallEvent::IncomingCall { .. }))
            .await
        {
            CallEvent::IncomingCall { from, session_key } => (from, session_key),
            _ => unreachable!(),
        }
    }

    /// Collect whatever arrives within `window`.
    pub async fn drain(&mut self, window: Duration) -> Vec<CallEvent> {
        let mut seen = Vec::new();
        let deadline = Instant::now() + window;
        while let Ok(Some(ev)) =
            timeout(deadline.saturating_duration_since(Instant::now()), self.events.recv()).await
        {
            seen.push(ev);
        }
        seen
    }

    pub async fn state(&self) -> CallState {
        self.engine.state().await.expect("engine running")
    }
}

/// Poll `cond` until it holds or the wait runs out.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Let in-flight engine work finish.
pub async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

/// Bring two endpoints to a connected call, `caller` calling `callee`.
pub async fn connect(caller: &mut Endpoint, callee: &mut Endpoint, callee_id: &str) {
    caller.engine.start_call(callee_id).await.expect("call starts");
    callee.expect_incoming().await;
    callee.engine.answer_incoming_call().await.expect("answer accepted");
    caller
        .expect_state(CallState::Connected(duet_call::Role::Caller))
        .await;
    callee
        .expect_state(CallState::Connected(duet_call::Role::Callee))
        .await;
}

/// A [`MemoryStore`] seen over a slow link: conditional creates and
/// candidate appends sleep before they reach the store.
#[derive(Clone)]
pub struct SlowStore {
    pub inner: MemoryStore,
    pub create_delay: Duration,
    pub append_delay: Duration,
}

impl SlowStore {
    pub fn new(inner: &MemoryStore) -> Self {
        Self {
            inner: inner.clone(),
            create_delay: Duration::ZERO,
            append_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl SignalingStore for SlowStore {
    async fn put_record(&self, collection: &str, key: &str, fields: Fields) -> Result<(), StoreError> {
        self.inner.put_record(collection, key, fields).await
    }

    async fn create_record(
        &self,
        collection: &str,
        key: &str,
        fields: Fields,
    ) -> Result<CreateOutcome, StoreError> {
        sleep(self.create_delay).await;
        self.inner.create_record(collection, key, fields).await
    }

    async fn get_record(&self, collection: &str, key: &str) -> Result<Option<Fields>, StoreError> {
        self.inner.get_record(collection, key).await
    }

    async fn update_record(
        &self,
        collection: &str,
        key: &str,
        partial: Fields,
    ) -> Result<(), StoreError> {
        self.inner.update_record(collection, key, partial).await
    }

    async fn delete_record(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        self.inner.delete_record(collection, key).await
    }

    async fn append_to_subcollection(
        &self,
        parent_key: &str,
        sub: &str,
        item: Value,
    ) -> Result<String, StoreError> {
        sleep(self.append_delay).await;
        self.inner.append_to_subcollection(parent_key, sub, item).await
    }

    async fn list_subcollection(&self, parent_key: &str, sub: &str) -> Result<Vec<SubItem>, StoreError> {
        self.inner.list_subcollection(parent_key, sub).await
    }

    async fn delete_item(&self, parent_key: &str, sub: &str, item_id: &str) -> Result<(), StoreError> {
        self.inner.delete_item(parent_key, sub, item_id).await
    }

    async fn subscribe_record(
        &self,
        collection: &str,
        key: &str,
        on_change: OnRecordChange,
    ) -> Result<Subscription, StoreError> {
        self.inner.subscribe_record(collection, key, on_change).await
    }

    async fn subscribe_subcollection(
        &self,
        parent_key: &str,
        sub: &str,
        on_item_added: OnItemAdded,
    ) -> Result<Subscription, StoreError> {
        self.inner
            .subscribe_subcollection(parent_key, sub, on_item_added)
            .await
    }

    async fn subscribe_query(
        &self,
        collection: &str,
        filters: Vec<(String, Value)>,
        on_change: OnQueryChange,
    ) -> Result<Subscription, StoreError> {
        self.inner.subscribe_query(collection, filters, on_change).await
    }
}
