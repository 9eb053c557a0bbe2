use super::Fields;
use crate::error::StoreError;
use crate::peer::state::Role;
use crate::peer::types::Descriptor;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const CALLS_COLLECTION: &str = "calls";
pub const OFFER_CANDIDATES: &str = "offerCandidates";
pub const ANSWER_CANDIDATES: &str = "answerCandidates";

pub const END_REASON_DECLINED: &str = "declined";

/// Sub-collection an endpoint writes its own candidates into.
pub fn local_candidates(role: Role) -> &'static str {
    match role {
        Role::Caller => OFFER_CANDIDATES,
        Role::Callee => ANSWER_CANDIDATES,
    }
}

/// Sub-collection holding the other endpoint's candidates.
pub fn remote_candidates(role: Role) -> &'static str {
    match role {
        Role::Caller => ANSWER_CANDIDATES,
        Role::Callee => OFFER_CANDIDATES,
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Pending,
    Active,
    Ended,
}

impl CallStatus {
    pub fn as_value(self) -> Value {
        match self {
            CallStatus::Pending => json!("pending"),
            CallStatus::Active => json!("active"),
            CallStatus::Ended => json!("ended"),
        }
    }
}

/// Shared handshake document for one call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Descriptor>,
    pub caller_id: String,
    pub callee_id: String,
    pub status: CallStatus,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
}

impl SessionRecord {
    /// Fresh ringing record written by the caller.
    pub fn pending(caller_id: &str, callee_id: &str, offer: Descriptor, created_at: i64) -> Self {
        Self {
            offer: Some(offer),
            answer: None,
            caller_id: caller_id.to_string(),
            callee_id: callee_id.to_string(),
            status: CallStatus::Pending,
            created_at,
            end_reason: None,
        }
    }

    pub fn to_fields(&self) -> Result<Fields, StoreError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(StoreError::Codec("session record is not an object".into())),
        }
    }

    pub fn from_fields(fields: Fields) -> Result<Self, StoreError> {
        Ok(serde_json::from_value(Value::Object(fields))?)
    }

    /// A record nobody has answered yet.
    pub fn is_ringing(&self) -> bool {
        self.status == CallStatus::Pending && self.answer.is_none()
    }

    pub fn declined(&self) -> bool {
        self.end_reason.as_deref() == Some(END_REASON_DECLINED)
    }

    /// The participant that is not `local`.
    pub fn peer_of(&self, local: &str) -> &str {
        if self.caller_id == local {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }
}

/// Fields the callee writes when it answers.
pub fn answer_update(answer: &Descriptor, callee_id: &str) -> Result<Fields, StoreError> {
    let mut partial = Fields::new();
    partial.insert("answer".into(), serde_json::to_value(answer)?);
    partial.insert("calleeId".into(), json!(callee_id));
    partial.insert("status".into(), CallStatus::Active.as_value());
    Ok(partial)
}

/// Broadcast that the call is over.
pub fn ended_update(reason: Option<&str>) -> Fields {
    let mut partial = Fields::new();
    partial.insert("status".into(), CallStatus::Ended.as_value());
    if let Some(reason) = reason {
        partial.insert("endReason".into(), json!(reason));
    }
    partial
}

/// Query filter for records ringing `local`.
pub fn incoming_filter(local: &str) -> Vec<(String, Value)> {
    vec![
        ("calleeId".into(), json!(local)),
        ("status".into(), CallStatus::Pending.as_value()),
    ]
}
