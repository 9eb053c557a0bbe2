//! Public handle for one endpoint's calls.

use crate::config::EngineConfig;
use crate::engine::{Command, Engine, Msg};
use crate::error::{CallError, Result};
use crate::media::{MediaKind, MediaSource, RemoteTrack};
use crate::peer::{CallEndReason, CallState, PeerFactory};
use crate::store::SignalingStore;
use crate::utils::is_valid_identity;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CallEvent {
    IncomingCall { from: String, session_key: String },
    IncomingCallCancelled { from: String },
    StateChanged(CallState),
    RemoteStreamAvailable(RemoteTrack),
    CallEnded { reason: CallEndReason },
    /// Transport dropped; the grace period is running.
    ConnectionProblem,
    ConnectionRecovered,
}

pub type EventReceiver = mpsc::UnboundedReceiver<CallEvent>;

/// Handle to a running call engine. Dropping it tears down any call in
/// the background, as when the hosting window closes.
pub struct CallEngine {
    local_id: String,
    tx: mpsc::UnboundedSender<Msg>,
    next_token: AtomicU64,
}

impl CallEngine {
    /// Validate `config`, install the incoming-call watcher and start the
    /// engine task.
    pub async fn spawn(
        local_id: impl Into<String>,
        config: EngineConfig,
        store: Arc<dyn SignalingStore>,
        peers: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaSource>,
    ) -> Result<(CallEngine, EventReceiver)> {
        let local_id = local_id.into();
        if !is_valid_identity(&local_id) {
            return Err(CallError::InvalidTarget(local_id));
        }
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut engine = Engine::new(
            local_id.clone(),
            config,
            store,
            peers,
            media,
            events_tx,
            tx.clone(),
        );
        engine.install_watcher().await?;
        tokio::spawn(engine.run(rx));

        let handle = CallEngine {
            local_id,
            tx,
            next_token: AtomicU64::new(0),
        };
        Ok((handle, events_rx))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(Msg::Call(cmd))
            .map_err(|_| CallError::EngineStopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| CallError::EngineStopped)
    }

    /// Resolves once the collision check is done. Later failures arrive
    /// as [`CallEvent::CallEnded`]; a refused call only returns its error.
    pub async fn start_call(&self, target: &str) -> Result<()> {
        let target = target.to_string();
        self.request(|reply| Command::StartCall { target, reply })
            .await?
    }

    pub async fn answer_incoming_call(&self) -> Result<()> {
        self.request(|reply| Command::Answer { reply }).await?
    }

    pub async fn decline_incoming_call(&self) -> Result<()> {
        self.request(|reply| Command::Decline { reply }).await?
    }

    /// Safe from any state, any number of times.
    pub async fn hang_up(&self) -> Result<()> {
        self.request(|reply| Command::HangUp { reply }).await
    }

    pub async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetTrackEnabled {
            kind,
            enabled,
            reply,
        })
        .await?
    }

    pub async fn state(&self) -> Result<CallState> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Mark the UI as showing the conversation with `peer`. A call with
    /// anyone else ends, and so does any call once the guard is dropped.
    pub fn open_conversation(&self, peer: &str) -> ConversationGuard {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.send(Command::OpenConversation {
            token,
            peer: peer.to_string(),
        });
        ConversationGuard {
            token,
            peer: peer.to_string(),
            tx: self.tx.clone(),
        }
    }

    /// End the active call, stop the watcher and wait (bounded) for
    /// pending store purges.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply: Some(reply) })
            .await
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        debug!(local = %self.local_id, "call engine handle dropped");
        let _ = self.tx.send(Msg::Call(Command::Shutdown { reply: None }));
    }
}

/// Held while a conversation view is open.
pub struct ConversationGuard {
    token: u64,
    peer: String,
    tx: mpsc::UnboundedSender<Msg>,
}

impl ConversationGuard {
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Call(Command::CloseConversation { token: self.token }));
    }
}
