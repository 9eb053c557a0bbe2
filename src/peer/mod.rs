pub mod connection;
pub mod descriptor;
pub mod ice;
pub mod state;
pub mod types;

use crate::error::PeerError;
use crate::media::{LocalTrack, RemoteTrack};
use async_trait::async_trait;
use std::sync::Arc;

pub use connection::{RtcPeer, RtcPeerFactory};
pub use descriptor::DescriptorExchange;
pub use ice::CandidateRelay;
pub use state::{CallEndReason, CallState, Role};
pub use types::{Descriptor, IceCandidate, PeerState, SdpKind, ServerConfig};

pub type OnLocalCandidate = Box<dyn Fn(IceCandidate) + Send + Sync>;
pub type OnRemoteTrack = Box<dyn Fn(RemoteTrack) + Send + Sync>;
pub type OnPeerState = Box<dyn Fn(PeerState) + Send + Sync>;

/// One local peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_track(&self, track: &LocalTrack, stream_id: &str) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<Descriptor, PeerError>;
    async fn create_answer(&self) -> Result<Descriptor, PeerError>;
    async fn set_local_description(&self, desc: Descriptor) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: Descriptor) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    /// Called for every gathered local candidate; end-of-gathering is not reported.
    fn on_ice_candidate(&self, handler: OnLocalCandidate);
    fn on_remote_track(&self, handler: OnRemoteTrack);
    fn on_state_change(&self, handler: OnPeerState);
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        ice_servers: &[ServerConfig],
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
