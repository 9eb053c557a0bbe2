//! Offer/answer exchange over one peer connection.
//!
//! The exchange enforces the call order the negotiation needs: tracks
//! before any local description, a remote offer before the answer, and
//! at most one remote description per session.

use super::state::Role;
use super::types::{Descriptor, SdpKind};
use super::PeerConnection;
use crate::error::{DescriptorError, PeerError};
use crate::media::LocalStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct DescriptorExchange {
    pc: Arc<dyn PeerConnection>,
    role: Role,
    tracks_attached: AtomicBool,
    local_created: AtomicBool,
    remote_applied: AtomicBool,
}

impl DescriptorExchange {
    pub fn new(pc: Arc<dyn PeerConnection>, role: Role) -> Self {
        Self {
            pc,
            role,
            tracks_attached: AtomicBool::new(false),
            local_created: AtomicBool::new(false),
            remote_applied: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.pc
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_applied(&self) -> bool {
        self.remote_applied.load(Ordering::SeqCst)
    }

    pub async fn attach_stream(&self, stream: &LocalStream) -> Result<(), DescriptorError> {
        if stream.tracks.is_empty() {
            return Err(DescriptorError::OutOfOrder("local stream has no tracks"));
        }
        for track in &stream.tracks {
            self.pc.add_local_track(track, &stream.id).await?;
        }
        self.tracks_attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn create_local_offer(&self) -> Result<Descriptor, DescriptorError> {
        if self.role != Role::Caller {
            return Err(DescriptorError::OutOfOrder("only the caller creates an offer"));
        }
        self.claim_local()?;
        let offer = self.pc.create_offer().await?;
        self.pc.set_local_description(offer.clone()).await?;
        debug!(len = offer.sdp.len(), "local offer created");
        Ok(offer)
    }

    pub async fn create_local_answer(
        &self,
        remote_offer: Descriptor,
    ) -> Result<Descriptor, DescriptorError> {
        if self.role != Role::Callee {
            return Err(DescriptorError::OutOfOrder("only the callee creates an answer"));
        }
        if !self.tracks_attached.load(Ordering::SeqCst) {
            return Err(DescriptorError::OutOfOrder("tracks must be attached first"));
        }
        self.apply_remote_descriptor(remote_offer).await?;
        self.claim_local()?;
        let answer = self.pc.create_answer().await?;
        self.pc.set_local_description(answer.clone()).await?;
        debug!(len = answer.sdp.len(), "local answer created");
        Ok(answer)
    }

    pub async fn apply_remote_descriptor(&self, desc: Descriptor) -> Result<(), DescriptorError> {
        let expected = match self.role {
            Role::Caller => SdpKind::Answer,
            Role::Callee => SdpKind::Offer,
        };
        if desc.kind != expected {
            return Err(DescriptorError::Malformed(format!(
                "{} received a {:?}",
                self.role, desc.kind
            )));
        }
        validate_sdp(&desc.sdp)?;
        if self.role == Role::Caller && !self.local_created.load(Ordering::SeqCst) {
            return Err(DescriptorError::OutOfOrder("answer applied before the offer"));
        }
        if self
            .remote_applied
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DescriptorError::OutOfOrder("remote descriptor already applied"));
        }
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| match e {
                PeerError::InvalidDescriptor(msg) => DescriptorError::Malformed(msg),
                other => DescriptorError::Peer(other),
            })
    }

    fn claim_local(&self) -> Result<(), DescriptorError> {
        if !self.tracks_attached.load(Ordering::SeqCst) {
            return Err(DescriptorError::OutOfOrder("tracks must be attached first"));
        }
        if self
            .local_created
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DescriptorError::OutOfOrder("local descriptor already created"));
        }
        Ok(())
    }
}

fn validate_sdp(sdp: &str) -> Result<(), DescriptorError> {
    if !sdp.trim_start().starts_with("v=") {
        return Err(DescriptorError::Malformed("sdp must start with a version line".into()));
    }
    Ok(())
}
