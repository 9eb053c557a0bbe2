use super::types::{Descriptor, IceCandidate, PeerState, SdpKind, ServerConfig};
use super::{OnLocalCandidate, OnPeerState, OnRemoteTrack, PeerConnection, PeerFactory};
use crate::error::PeerError;
use crate::logger::dump_selected_pair;
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds `webrtc` peer connections with default codecs and interceptors.
#[derive(Default, Clone)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create_peer_connection(
        &self,
        ice_servers: &[ServerConfig],
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(ice_servers)).await?);
        debug!(servers = ice_servers.len(), "peer connection created");
        Ok(Arc::new(RtcPeer {
            pc,
            tracks: Mutex::new(HashMap::new()),
        }))
    }
}

/// Creates the configuration for a peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| {
            let url = add_ice_url_scheme(config);

            RTCIceServer {
                urls: vec![url],
                username: config.username.clone().unwrap_or_default(),
                credential: config.credential.clone().unwrap_or_default(),
            }
        })
        .collect()
}

/// `PeerConnection` over a `webrtc::RTCPeerConnection`.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl RtcPeer {
    /// Sample track for a local track id; the capture layer writes media into it.
    pub fn sample_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().ok().and_then(|t| t.get(id).cloned())
    }

    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

fn to_rtc(desc: Descriptor) -> Result<RTCSessionDescription, PeerError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| PeerError::InvalidDescriptor(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<Descriptor, PeerError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(PeerError::InvalidDescriptor(format!(
                "unsupported sdp type {other}"
            )))
        }
    };
    Ok(Descriptor {
        kind,
        sdp: desc.sdp,
    })
}

fn map_state(st: RTCPeerConnectionState) -> PeerState {
    match st {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_local_track(&self, track: &LocalTrack, stream_id: &str) -> Result<(), PeerError> {
        let mime = match track.kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            stream_id.to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&sample) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Drain RTCP so the interceptors keep running.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.insert(track.id.clone(), sample);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<Descriptor, PeerError> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<Descriptor, PeerError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: Descriptor) -> Result<(), PeerError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: Descriptor) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| PeerError::InvalidDescriptor(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    fn on_ice_candidate(&self, handler: OnLocalCandidate) {
        let handler = Arc::new(handler);
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                match cand.map(|c| c.to_json()) {
                    Some(Ok(init)) => handler(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Some(Err(e)) => debug!(error = %e, "could not serialize local candidate"),
                    // cand == None marks the end of gathering
                    None => debug!("ICE candidate gathering completed"),
                }
                Box::pin(async {})
            }));
    }

    fn on_remote_track(&self, handler: OnRemoteTrack) {
        let handler = Arc::new(handler);
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Video => MediaKind::Video,
                    _ => MediaKind::Audio,
                };
                handler(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                });
                Box::pin(async {})
            },
        ));
    }

    fn on_state_change(&self, handler: OnPeerState) {
        let handler = Arc::new(handler);
        let weak = Arc::downgrade(&self.pc);
        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                info!("Peer connection state changed to: {:?}", st);
                if matches!(
                    st,
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
                ) {
                    if let Some(pc) = weak.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        });
                    }
                }
                handler(map_state(st));
                Box::pin(async {})
            }));
    }

    async fn close(&self) -> Result<(), PeerError> {
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.clear();
        }
        self.pc.close().await?;
        Ok(())
    }
}
