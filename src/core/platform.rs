//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Platform trait describing the interface the owning client must
/// implement for calling.
use std::fmt;

use serde_json::Value;

use crate::common::{ConnectionId, EndpointId, GroupId, Result, SessionId, SignalTarget};
use crate::core::call::Call;
use crate::core::call_state::{Edge, State};
use crate::core::channel::SignalingChannel;
use crate::core::signaling::{IceCandidate, ReceivedSignal, SignalType};

/// Events surfaced on the client as a whole.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// The duplex session was lost.
    Disconnect { reason: String },
    /// The duplex session came back and groups were rejoined.
    Reconnect,
    /// A direct message from another endpoint.
    Message {
        from: EndpointId,
        from_connection: Option<ConnectionId>,
        message: String,
    },
    /// An observed endpoint changed presence.
    Presence {
        endpoint: EndpointId,
        connection: ConnectionId,
        presence: Value,
    },
    /// Someone joined a group we belong to.
    GroupJoin {
        group: GroupId,
        endpoint: EndpointId,
        connection: ConnectionId,
    },
    /// Someone left a group we belong to.
    GroupLeave {
        group: GroupId,
        endpoint: EndpointId,
        connection: ConnectionId,
    },
    /// A message published to a group we belong to.
    GroupMessage {
        group: GroupId,
        from: EndpointId,
        message: String,
    },
}

/// Events surfaced per call.
#[derive(Clone, Debug)]
pub enum CallEvent {
    /// `<state>:entry` / `<state>:exit`.
    State { state: State, edge: Edge },
    /// `signal-offer`, `signal-answer`, ... fired when an inbound
    /// signal of that kind was delivered to the call.
    Signal { signal_type: SignalType },
    /// Direct-connection lifecycle.
    Direct(DirectConnectionEvent),
}

#[derive(Clone, Debug)]
pub enum DirectConnectionEvent {
    /// A direct connection was requested (outbound side).
    Start,
    /// The remote request was accepted locally.
    Accept,
    /// The underlying data channel is open.
    Open,
    /// A message arrived on the data channel.
    Message(String),
    /// The data channel failed.
    Error(String),
    /// The data channel closed.
    Close,
}

impl fmt::Display for DirectConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Accept => "accept",
            Self::Open => "open",
            Self::Message(_) => "message",
            Self::Error(_) => "error",
            Self::Close => "close",
        };
        write!(f, "{}", name)
    }
}

/// A bidirectional data channel created by the peer connection.
pub trait DataChannel: Send {
    fn send(&self, message: &str) -> Result<()>;
    fn close(&mut self);
}

/// The peer-connection primitive.
///
/// Assumed to be provided by the platform (the browser engine, a
/// native WebRTC build). Implementations deliver their asynchronous
/// events through the owning [`Call`]'s hooks: `received_local_media`,
/// `received_remote_media`, `local_candidates_ready`,
/// `remote_data_channel`, and `stats_ready`.
pub trait PeerConnection: Send {
    /// Generate a local offer.
    fn create_offer(&mut self, done: Box<dyn FnOnce(Result<String>) + Send>);

    /// Apply the remote answer to a previously created offer.
    fn accept_answer(&mut self, sdp: &str, done: Box<dyn FnOnce(Result<()>) + Send>);

    /// Apply a remote offer and generate the local answer.
    fn create_answer(&mut self, offer_sdp: &str, done: Box<dyn FnOnce(Result<String>) + Send>);

    /// Feed remote ICE candidates.
    fn add_remote_candidates(&mut self, candidates: Vec<IceCandidate>) -> Result<()>;

    /// Open a data channel (direct connections).
    fn create_data_channel(&mut self, label: &str) -> Result<Box<dyn DataChannel>>;

    /// Snapshot connection statistics.
    fn get_stats(&self, done: Box<dyn FnOnce(Value) + Send>);

    /// Tear down the connection and release media.
    fn close(&mut self);
}

/// A trait describing the interface the owning client must implement
/// for calling.
///
/// The client owns the `sessionId -> Call` index; the channel queries
/// it for every routed signal and never holds call references of its
/// own.
pub trait Platform: Sized + Send + 'static {
    /// Look up a call by session id. Implementations may fall back to
    /// an endpoint-scoped lookup; the router drops the signal if the
    /// returned call's id disagrees.
    fn call_for_session(&mut self, session_id: &SessionId, target: SignalTarget)
        -> Option<Call<Self>>;

    /// A first `offer` arrived for an unknown session; create the
    /// callee-side call and index it.
    fn create_incoming_call(
        &mut self,
        channel: &SignalingChannel<Self>,
        offer: &ReceivedSignal,
    ) -> Result<Call<Self>>;

    /// A first `offer` arrived for an unknown direct-connection
    /// session. At most one direct connection exists per endpoint;
    /// reuse the existing call when its session matches.
    fn direct_connection_call(
        &mut self,
        channel: &SignalingChannel<Self>,
        offer: &ReceivedSignal,
    ) -> Result<Call<Self>>;

    /// Create the platform peer connection for a call. The platform
    /// wires the primitive's events back to `call`'s hooks.
    fn create_peer_connection(&mut self, call: &Call<Self>) -> Result<Box<dyn PeerConnection>>;

    /// Start gathering device media for a call. Completion arrives via
    /// `call.received_local_media()`; user approval via
    /// `call.approve()`.
    fn request_device_media(&mut self, call: &Call<Self>) -> Result<()>;

    /// Whether the client application listens for incoming calls. A
    /// call initiated with nobody listening terminates immediately.
    fn has_call_listener(&self) -> bool;

    /// Groups the client belongs to; rejoined after a reconnect.
    fn joined_groups(&self) -> Vec<GroupId>;

    /// Notify the client application about an event.
    fn on_client_event(&mut self, event: ClientEvent);

    /// Notify the client application about a call-scoped event.
    fn on_call_event(&mut self, call: &Call<Self>, event: CallEvent);

    /// The call fully terminated; drop it from the index.
    fn call_concluded(&mut self, session_id: &SessionId);
}
