//! The per-endpoint call state machine.
//!
//! A single task owns every piece of call state. Store listeners, peer
//! callbacks and finished async steps never touch that state directly:
//! they post a [`Msg`] into the task's inbox, stamped with the session
//! generation they were started for. A message whose generation is no
//! longer current is dropped, after releasing whatever it carries.

mod machine;
mod teardown;
mod watcher;

pub use teardown::{purge_session, PurgePolicy};

use crate::config::EngineConfig;
use crate::error::{CallError, DescriptorError, MediaError, StoreError};
use crate::media::{LocalStream, MediaKind, MediaSource, RemoteTrack};
use crate::peer::{CallState, Descriptor, DescriptorExchange, IceCandidate, PeerFactory, PeerState};
use crate::session::SessionContext;
use crate::signaling::CallEvent;
use crate::store::{CreateOutcome, Fields, QueryChange, SignalingStore, Subscription};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use watcher::Incoming;

/// Requests from the public handle.
pub(crate) enum Command {
    StartCall {
        target: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Answer {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Decline {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    HangUp {
        reply: oneshot::Sender<()>,
    },
    SetTrackEnabled {
        kind: MediaKind,
        enabled: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    State {
        reply: oneshot::Sender<CallState>,
    },
    OpenConversation {
        token: u64,
        peer: String,
    },
    CloseConversation {
        token: u64,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Feed {
    Record,
    Candidates,
}

pub(crate) enum Msg {
    Call(Command),
    Incoming(QueryChange),
    IncomingExpired {
        key: String,
    },
    Probed {
        gen: u64,
        result: Result<Option<Fields>, StoreError>,
        after_purge: bool,
    },
    AnswerChecked {
        gen: u64,
        result: Result<Option<Fields>, StoreError>,
    },
    MediaReady {
        gen: u64,
        result: Result<LocalStream, MediaError>,
    },
    PeerCreated {
        gen: u64,
        result: Result<Arc<DescriptorExchange>, CallError>,
    },
    Negotiated {
        gen: u64,
        result: Result<Descriptor, DescriptorError>,
    },
    Created {
        gen: u64,
        key: String,
        result: Result<CreateOutcome, StoreError>,
    },
    AnswerPublished {
        gen: u64,
        result: Result<(), StoreError>,
    },
    Subscribed {
        gen: u64,
        feed: Feed,
        result: Result<Subscription, StoreError>,
    },
    RecordChanged {
        gen: u64,
        fields: Option<Fields>,
    },
    RemoteApplied {
        gen: u64,
        result: Result<(), DescriptorError>,
    },
    LocalCandidate {
        gen: u64,
        candidate: IceCandidate,
    },
    RemoteCandidate {
        gen: u64,
        candidate: IceCandidate,
    },
    RemoteTrack {
        gen: u64,
        track: RemoteTrack,
    },
    PeerState {
        gen: u64,
        state: PeerState,
    },
    RingTimeout {
        gen: u64,
    },
    GraceExpired {
        gen: u64,
    },
}

pub(crate) struct Engine {
    local_id: String,
    config: EngineConfig,
    store: Arc<dyn SignalingStore>,
    peers: Arc<dyn PeerFactory>,
    media: Arc<dyn MediaSource>,
    events: mpsc::UnboundedSender<CallEvent>,
    tx: mpsc::UnboundedSender<Msg>,
    state: CallState,
    session: Option<SessionContext>,
    incoming: Option<Incoming>,
    conversation: Option<(u64, String)>,
    watcher: Option<Subscription>,
    purges: Vec<JoinHandle<()>>,
    generation: u64,
}

impl Engine {
    pub(crate) fn new(
        local_id: String,
        config: EngineConfig,
        store: Arc<dyn SignalingStore>,
        peers: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaSource>,
        events: mpsc::UnboundedSender<CallEvent>,
        tx: mpsc::UnboundedSender<Msg>,
    ) -> Self {
        Self {
            local_id,
            config,
            store,
            peers,
            media,
            events,
            tx,
            state: CallState::Idle,
            session: None,
            incoming: None,
            conversation: None,
            watcher: None,
            purges: Vec::new(),
            generation: 0,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        debug!(local = %self.local_id, "call engine started");
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Call(Command::Shutdown { reply }) => {
                    self.shutdown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
                other => self.handle(other),
            }
        }
        debug!(local = %self.local_id, "call engine stopped");
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Call(cmd) => self.on_command(cmd),
            Msg::Incoming(change) => self.on_query_change(change),
            Msg::IncomingExpired { key } => self.on_incoming_expired(&key),
            Msg::Probed {
                gen,
                result,
                after_purge,
            } => self.on_probed(gen, result, after_purge),
            Msg::AnswerChecked { gen, result } => self.on_answer_checked(gen, result),
            Msg::MediaReady { gen, result } => self.on_media_ready(gen, result),
            Msg::PeerCreated { gen, result } => self.on_peer_created(gen, result),
            Msg::Negotiated { gen, result } => self.on_negotiated(gen, result),
            Msg::Created { gen, key, result } => self.on_created(gen, key, result),
            Msg::AnswerPublished { gen, result } => self.on_answer_published(gen, result),
            Msg::Subscribed { gen, feed, result } => self.on_subscribed(gen, feed, result),
            Msg::RecordChanged { gen, fields } => self.on_record_changed(gen, fields),
            Msg::RemoteApplied { gen, result } => self.on_remote_applied(gen, result),
            Msg::LocalCandidate { gen, candidate } => {
                if let Some(ctx) = self.current(gen) {
                    ctx.relay.on_local_candidate(candidate);
                }
            }
            Msg::RemoteCandidate { gen, candidate } => {
                if let Some(ctx) = self.current(gen) {
                    ctx.relay.on_remote_candidate(candidate);
                }
            }
            Msg::RemoteTrack { gen, track } => {
                if self.is_current(gen) {
                    self.emit(CallEvent::RemoteStreamAvailable(track));
                }
            }
            Msg::PeerState { gen, state } => self.on_peer_state(gen, state),
            Msg::RingTimeout { gen } => self.on_ring_timeout(gen),
            Msg::GraceExpired { gen } => self.on_grace_expired(gen),
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartCall { target, reply } => self.start_call(target, reply),
            Command::Answer { reply } => self.answer(reply),
            Command::Decline { reply } => {
                let _ = reply.send(self.decline());
            }
            Command::HangUp { reply } => {
                self.hang_up();
                let _ = reply.send(());
            }
            Command::SetTrackEnabled {
                kind,
                enabled,
                reply,
            } => {
                let result = match self.session.as_ref().and_then(|c| c.stream.as_ref()) {
                    Some(stream) => {
                        self.media.set_enabled(stream, kind, enabled);
                        Ok(())
                    }
                    None => Err(CallError::NoActiveCall),
                };
                let _ = reply.send(result);
            }
            Command::State { reply } => {
                let _ = reply.send(self.state);
            }
            Command::OpenConversation { token, peer } => self.open_conversation(token, peer),
            Command::CloseConversation { token } => self.close_conversation(token),
            // handled by the run loop
            Command::Shutdown { .. } => {}
        }
    }

    fn open_conversation(&mut self, token: u64, peer: String) {
        let other_call = self
            .session
            .as_ref()
            .map(|c| c.peer_id != peer)
            .unwrap_or(false);
        debug!(%peer, "conversation opened");
        self.conversation = Some((token, peer));
        if other_call {
            self.end_session(true, crate::peer::CallEndReason::ContextClosed);
        }
    }

    fn close_conversation(&mut self, token: u64) {
        // a guard superseded by a newer conversation has nothing to close
        if self.conversation.as_ref().map(|(t, _)| *t) != Some(token) {
            return;
        }
        self.conversation = None;
        if self.session.is_some() {
            self.end_session(true, crate::peer::CallEndReason::ContextClosed);
        }
    }

    /// Run `fut` off the engine task and post its result back.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = Msg> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let msg = fut.await;
            let _ = tx.send(msg);
        });
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        if !self.state.allows(next) {
            warn!(from = %self.state, to = %next, "illegal call state transition ignored");
            return;
        }
        debug!(from = %self.state, to = %next, "call state");
        self.state = next;
        self.emit(CallEvent::StateChanged(next));
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn is_current(&self, gen: u64) -> bool {
        self.session
            .as_ref()
            .map(|c| c.generation == gen && c.live.is_live())
            .unwrap_or(false)
    }

    fn current(&mut self, gen: u64) -> Option<&mut SessionContext> {
        self.session
            .as_mut()
            .filter(|c| c.generation == gen && c.live.is_live())
    }
}
