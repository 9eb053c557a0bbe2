use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Caller,
    Callee,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Caller => f.write_str("caller"),
            Role::Callee => f.write_str("callee"),
        }
    }
}

/// Lifecycle of the local endpoint's call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CallState {
    #[default]
    Idle,
    Initiating,
    Ringing(Role),
    Connected(Role),
    Ended,
}

impl CallState {
    /// Whether `next` is a legal successor of `self`.
    pub fn allows(&self, next: CallState) -> bool {
        use CallState::*;
        match (*self, next) {
            (Idle, Initiating) | (Idle, Ringing(Role::Callee)) => true,
            (Initiating, Ringing(_)) => true,
            // a callee that answers keeps ringing until its answer is written
            (Ringing(Role::Callee), Ringing(Role::Callee)) => true,
            (Ringing(a), Connected(b)) => a == b,
            (Ended, Idle) => true,
            (Idle, Ended) | (Ended, Ended) => false,
            (_, Ended) => true,
            // a ringing callee whose caller cancelled goes straight back
            (Ringing(Role::Callee), Idle) | (Initiating, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Idle => f.write_str("idle"),
            CallState::Initiating => f.write_str("initiating"),
            CallState::Ringing(r) => write!(f, "ringing({r})"),
            CallState::Connected(r) => write!(f, "connected({r})"),
            CallState::Ended => f.write_str("ended"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CallEndReason {
    LocalHangUp,
    RemoteHangUp,
    Declined,
    NoAnswer,
    Missed,
    PermissionDenied,
    MalformedDescriptor,
    SignalingFailed(String),
    TransportFailed,
    AlreadyInProgress,
    ContextClosed,
    Shutdown,
}
