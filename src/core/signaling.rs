//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

/// The messages we exchange over the signaling channel to establish,
/// renegotiate, and tear down a session.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{ConnectionId, EndpointId, Result, SessionId, SignalTarget};
use crate::error::RespokeError;

/// An enum representing the different types of signaling messages that
/// can be sent and received.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "camelCase")]
pub enum SignalType {
    Offer,
    Answer,
    Connected,
    IceCandidates,
    Bye,
    Modify,
    Ack,
}

/// Renegotiation verbs carried by a `modify` signal.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModifyAction {
    Initiate,
    Accept,
    Reject,
}

/// An opaque connectivity candidate, relayed verbatim between the
/// peer-connection primitives on either side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_m_line_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Candidate bodies carry addresses; keep them out of logs.
        write!(f, "IceCandidate(mline: {}, ...)", self.sdp_m_line_index)
    }
}

/// The per-type payload of a signal. Each arm carries only the fields
/// that signal type uses.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "signalType", rename_all = "camelCase")]
pub enum SignalBody {
    #[serde(rename_all = "camelCase")]
    Offer { sdp: String },
    #[serde(rename_all = "camelCase")]
    Answer { sdp: String },
    Connected,
    #[serde(rename_all = "camelCase")]
    IceCandidates { candidates: Vec<IceCandidate> },
    #[serde(rename_all = "camelCase")]
    Bye {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Modify { action: ModifyAction },
    #[serde(rename_all = "camelCase")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        acked_signal_id: Option<String>,
    },
}

impl SignalBody {
    pub fn signal_type(&self) -> SignalType {
        match self {
            Self::Offer { .. } => SignalType::Offer,
            Self::Answer { .. } => SignalType::Answer,
            Self::Connected => SignalType::Connected,
            Self::IceCandidates { .. } => SignalType::IceCandidates,
            Self::Bye { .. } => SignalType::Bye,
            Self::Modify { .. } => SignalType::Modify,
            Self::Ack { .. } => SignalType::Ack,
        }
    }
}

impl fmt::Display for SignalBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            Self::Offer { .. } => "Offer(...)".to_string(),
            Self::Answer { .. } => "Answer(...)".to_string(),
            Self::Connected => "Connected".to_string(),
            Self::IceCandidates { candidates } => {
                format!("IceCandidates(count: {})", candidates.len())
            }
            Self::Bye { reason } => format!("Bye({:?})", reason),
            Self::Modify { action } => format!("Modify({})", action),
            Self::Ack { .. } => "Ack".to_string(),
        };
        write!(f, "({})", display)
    }
}

/// One outbound signal as serialized onto the wire.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub signal_id: String,
    pub session_id: SessionId,
    pub target: SignalTarget,
    pub from_endpoint: EndpointId,
    pub from_connection: ConnectionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_original: Option<EndpointId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(flatten)]
    pub body: SignalBody,
}

impl SignalingMessage {
    pub fn to_wire_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| RespokeError::ParseFailed(e.to_string()))
    }
}

impl fmt::Display for SignalingMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "signal: {}, session_id: {}, target: {}, body: {}",
            self.signal_id, self.session_id, self.target, self.body
        )
    }
}

/// An inbound signal with its routing envelope, after validation.
#[derive(Clone, Debug)]
pub struct ReceivedSignal {
    pub signal_id: Option<String>,
    pub session_id: SessionId,
    pub target: SignalTarget,
    pub from_endpoint: EndpointId,
    pub from_connection: ConnectionId,
    pub to_original: Option<EndpointId>,
    pub caller_id: Option<String>,
    pub metadata: Option<Value>,
    pub body: SignalBody,
}

impl fmt::Display for ReceivedSignal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "session_id: {}, target: {}, from: {}/{}, body: {}",
            self.session_id, self.target, self.from_endpoint, self.from_connection, self.body
        )
    }
}

fn required_str(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RespokeError::MalformedSignal(format!("missing {}", field)))
}

fn optional_str(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Validate an inbound signal payload.
///
/// A signal missing `target` or `signalType`, or carrying a
/// `signalType` we have never heard of, is an error; the one carve-out
/// is that `ack` is recognised so it can be dropped quietly upstream.
pub fn parse_received(value: &Value) -> Result<ReceivedSignal> {
    let target_text = required_str(value, "target")?;
    let target: SignalTarget = serde_json::from_value(Value::String(target_text.clone()))
        .map_err(|_| RespokeError::MalformedSignal(format!("unknown target {}", target_text)))?;

    let type_text = required_str(value, "signalType")?;
    SignalType::from_str(&type_text).map_err(|_| {
        RespokeError::MalformedSignal(format!("unknown signalType {}", type_text))
    })?;

    let body: SignalBody = serde_json::from_value(value.clone())
        .map_err(|e| RespokeError::MalformedSignal(format!("{}: {}", type_text, e)))?;

    Ok(ReceivedSignal {
        signal_id: optional_str(value, "signalId"),
        session_id: required_str(value, "sessionId")?,
        target,
        from_endpoint: required_str(value, "fromEndpoint")?,
        from_connection: required_str(value, "fromConnection")?,
        to_original: optional_str(value, "toOriginal"),
        caller_id: optional_str(value, "callerId"),
        metadata: value.get("metadata").cloned().filter(|m| !m.is_null()),
        body,
    })
}
