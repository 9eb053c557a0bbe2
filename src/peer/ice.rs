use super::state::Role;
use super::types::IceCandidate;
use super::PeerConnection;
use crate::error::StoreError;
use crate::logger::dump_candidate;
use crate::session::Liveness;
use crate::store::record::{local_candidates, remote_candidates};
use crate::store::{OnItemAdded, SignalingStore, SubItem, Subscription};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Moves candidates between the local peer connection and the store.
///
/// Outbound: local candidates are held until the session record exists,
/// then appended to this endpoint's sub-collection by a single publisher
/// task. Inbound: remote candidates are queued until the remote
/// descriptor is applied, then fed to one applier task so they reach the
/// peer connection in receipt order.
pub struct CandidateRelay {
    store: Arc<dyn SignalingStore>,
    key: String,
    role: Role,
    live: Liveness,
    outbound: Vec<IceCandidate>,
    published: Vec<IceCandidate>,
    publisher: Option<(mpsc::UnboundedSender<IceCandidate>, JoinHandle<Vec<String>>)>,
    pending_remote: Vec<IceCandidate>,
    applier: Option<(mpsc::UnboundedSender<IceCandidate>, JoinHandle<()>)>,
}

impl CandidateRelay {
    pub fn new(store: Arc<dyn SignalingStore>, key: String, role: Role, live: Liveness) -> Self {
        Self {
            store,
            key,
            role,
            live,
            outbound: Vec::new(),
            published: Vec::new(),
            publisher: None,
            pending_remote: Vec::new(),
            applier: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.publisher.is_some()
    }

    pub fn pending_remote(&self) -> usize {
        self.pending_remote.len()
    }

    pub fn on_local_candidate(&mut self, candidate: IceCandidate) {
        dump_candidate("LOCAL", &candidate);
        self.published.push(candidate.clone());
        match &self.publisher {
            Some((tx, _)) => {
                let _ = tx.send(candidate);
            }
            None => self.outbound.push(candidate),
        }
    }

    /// Begin writing local candidates, flushing the ones held back so far.
    pub fn start_streaming(&mut self) {
        if self.publisher.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<IceCandidate>();
        let store = self.store.clone();
        let key = self.key.clone();
        let sub = local_candidates(self.role);
        let live = self.live.clone();
        let handle = tokio::spawn(async move {
            let mut written = Vec::new();
            while let Some(candidate) = rx.recv().await {
                if !live.is_live() {
                    break;
                }
                let item = match serde_json::to_value(&candidate) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable local candidate");
                        continue;
                    }
                };
                // A lost candidate write is tolerated; other paths may still connect.
                match store.append_to_subcollection(&key, sub, item).await {
                    Ok(id) => written.push(id),
                    Err(e) => warn!(%key, error = %e, "local candidate write failed, dropped"),
                }
            }
            written
        });
        for candidate in self.outbound.drain(..) {
            let _ = tx.send(candidate);
        }
        self.publisher = Some((tx, handle));
    }

    /// Register a listener on the other endpoint's sub-collection. The
    /// returned future owns everything it needs and can be spawned.
    pub fn subscribe_remote_candidates(
        &self,
        on_candidate: Box<dyn Fn(IceCandidate) + Send + Sync>,
    ) -> impl Future<Output = Result<Subscription, StoreError>> + Send + 'static {
        let store = self.store.clone();
        let sub = remote_candidates(self.role);
        let key = self.key.clone();
        let log_key = key.clone();
        let listener: OnItemAdded = Box::new(move |item: SubItem| {
            match serde_json::from_value::<IceCandidate>(item.data) {
                Ok(c) => on_candidate(c),
                Err(e) => warn!(key = %log_key, error = %e, "ignoring malformed remote candidate"),
            }
        });
        async move { store.subscribe_subcollection(&key, sub, listener).await }
    }

    pub fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        dump_candidate("REMOTE", &candidate);
        match &self.applier {
            Some((tx, _)) => {
                let _ = tx.send(candidate);
            }
            None => {
                debug!(key = %self.key, "remote description not set yet, queuing candidate");
                self.pending_remote.push(candidate);
            }
        }
    }

    /// Called right after the remote descriptor is applied.
    pub fn start_applying(&mut self, pc: Arc<dyn PeerConnection>) {
        if self.applier.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<IceCandidate>();
        let live = self.live.clone();
        let handle = tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                if !live.is_live() {
                    break;
                }
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    warn!(error = %e, "failed to apply remote candidate, dropped");
                }
            }
        });
        let queued = self.pending_remote.len();
        for candidate in self.pending_remote.drain(..) {
            let _ = tx.send(candidate);
        }
        if queued > 0 {
            debug!(key = %self.key, queued, "flushed pending remote candidates");
        }
        self.applier = Some((tx, handle));
    }

    /// Stop both directions. Returns the publisher task so teardown can
    /// wait for in-flight writes before purging. The task yields the ids of
    /// every item it wrote.
    pub fn stop(&mut self) -> Option<JoinHandle<Vec<String>>> {
        analyze_candidates(&self.published);
        self.outbound.clear();
        self.pending_remote.clear();
        if let Some((tx, handle)) = self.applier.take() {
            drop(tx);
            handle.abort();
        }
        self.publisher.take().map(|(tx, handle)| {
            drop(tx);
            handle
        })
    }
}

pub fn analyze_candidates(candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    debug!(
        host = host_count,
        srflx = srflx_count,
        relay = relay_count,
        "local candidate summary"
    );

    if !candidates.is_empty() && relay_count == 0 {
        debug!("no TURN relay candidates gathered; NAT traversal may fail");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PeerError;
    use crate::media::LocalTrack;
    use crate::peer::types::Descriptor;
    use crate::peer::{OnLocalCandidate, OnPeerState, OnRemoteTrack};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Sink {
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerConnection for Sink {
        async fn add_local_track(&self, _t: &LocalTrack, _s: &str) -> Result<(), PeerError> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<Descriptor, PeerError> {
            Ok(Descriptor::offer("v=0"))
        }
        async fn create_answer(&self) -> Result<Descriptor, PeerError> {
            Ok(Descriptor::answer("v=0"))
        }
        async fn set_local_description(&self, _d: Descriptor) -> Result<(), PeerError> {
            Ok(())
        }
        async fn set_remote_description(&self, _d: Descriptor) -> Result<(), PeerError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, c: IceCandidate) -> Result<(), PeerError> {
            self.applied.lock().unwrap().push(c.candidate);
            Ok(())
        }
        fn on_ice_candidate(&self, _h: OnLocalCandidate) {}
        fn on_remote_track(&self, _h: OnRemoteTrack) {}
        fn on_state_change(&self, _h: OnPeerState) {}
        async fn close(&self) -> Result<(), PeerError> {
            Ok(())
        }
    }

    fn cand(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn early_remote_candidates_are_flushed_in_order() {
        let store = Arc::new(MemoryStore::new());
        let mut relay = CandidateRelay::new(store, "a_b".into(), Role::Caller, Liveness::new());
        relay.on_remote_candidate(cand(1));
        relay.on_remote_candidate(cand(2));
        assert_eq!(relay.pending_remote(), 2);

        let pc = Arc::new(Sink::default());
        relay.start_applying(pc.clone());
        relay.on_remote_candidate(cand(3));
        settle().await;

        let applied = pc.applied.lock().unwrap().clone();
        assert_eq!(applied, vec![cand(1).candidate, cand(2).candidate, cand(3).candidate]);
        assert_eq!(relay.pending_remote(), 0);
    }

    #[tokio::test]
    async fn local_candidates_wait_for_streaming() {
        let store = Arc::new(MemoryStore::new());
        let mut relay =
            CandidateRelay::new(store.clone(), "a_b".into(), Role::Callee, Liveness::new());
        relay.on_local_candidate(cand(1));
        settle().await;
        assert_eq!(store.item_count("a_b", "answerCandidates"), 0);

        relay.start_streaming();
        relay.on_local_candidate(cand(2));
        settle().await;
        assert_eq!(store.item_count("a_b", "answerCandidates"), 2);
        assert_eq!(store.item_count("a_b", "offerCandidates"), 0);
    }

    #[tokio::test]
    async fn dead_session_publishes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let live = Liveness::new();
        let mut relay = CandidateRelay::new(store.clone(), "a_b".into(), Role::Caller, live.clone());
        relay.on_local_candidate(cand(1));
        live.kill();
        relay.start_streaming();
        settle().await;
        assert_eq!(store.item_count("a_b", "offerCandidates"), 0);
        if let Some(h) = relay.stop() {
            let _ = h.await;
        }
    }

    #[tokio::test]
    async fn stopped_publisher_reports_what_it_wrote() {
        let store = Arc::new(MemoryStore::new());
        let mut relay =
            CandidateRelay::new(store.clone(), "a_b".into(), Role::Callee, Liveness::new());
        relay.start_streaming();
        relay.on_local_candidate(cand(1));
        relay.on_local_candidate(cand(2));
        let written = relay.stop().unwrap().await.unwrap();
        assert_eq!(written.len(), 2);
        let listed: Vec<String> = store
            .list_subcollection("a_b", "answerCandidates")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(listed, written);
    }

    #[tokio::test]
    async fn remote_subscription_reads_the_other_side() {
        let store = Arc::new(MemoryStore::new());
        store
            .append_to_subcollection("a_b", "answerCandidates", serde_json::to_value(cand(7)).unwrap())
            .await
            .unwrap();
        let relay = CandidateRelay::new(store.clone(), "a_b".into(), Role::Caller, Liveness::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = relay
            .subscribe_remote_candidates(Box::new(move |c: IceCandidate| {
                sink.lock().unwrap().push(c)
            }))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![cand(7)]);
    }
}
