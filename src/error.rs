use thiserror::Error;

/// Failures of the shared record store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("store operation timed out")]
    Timeout,
    #[error("record codec error: {0}")]
    Codec(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PeerError {
    #[error("peer connection error: {0}")]
    Backend(String),
    #[error("peer connection already closed")]
    Closed,
    #[error("invalid session description: {0}")]
    InvalidDescriptor(String),
}

impl From<webrtc::Error> for PeerError {
    fn from(e: webrtc::Error) -> Self {
        PeerError::Backend(e.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("media backend error: {0}")]
    Backend(String),
}

/// Misuse of the offer/answer sequence, or an unusable remote payload.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor operation out of order: {0}")]
    OutOfOrder(&'static str),
    #[error("malformed descriptor: {0}")]
    Malformed(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call already in progress")]
    AlreadyInProgress,
    #[error("another call is active")]
    Busy,
    #[error("invalid call target: {0}")]
    InvalidTarget(String),
    #[error("no incoming call to answer")]
    NoIncomingCall,
    #[error("no call with local media is active")]
    NoActiveCall,
    #[error("request cancelled before it completed")]
    Cancelled,
    #[error("call engine stopped")]
    EngineStopped,
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
