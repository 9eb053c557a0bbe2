//! Peer-to-peer call signaling over a shared record store.
//!
//! Two endpoints reach a connected media session by exchanging an
//! offer, an answer and their connectivity candidates through a store
//! both can read and write. [`CallEngine`] runs the state machine for
//! one endpoint; the store, the peer connection and local media are
//! collaborators behind traits.

pub mod config;
mod engine;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod utils;

pub use config::EngineConfig;
pub use engine::{purge_session, PurgePolicy};
pub use error::{CallError, Result};
pub use media::{MediaKind, MediaSource, SampleTrackSource};
pub use peer::{CallEndReason, CallState, PeerFactory, RtcPeerFactory, Role};
pub use signaling::{CallEngine, CallEvent, ConversationGuard, EventReceiver};
pub use store::{MemoryStore, SignalingStore};
pub use utils::session_key;
