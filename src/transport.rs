//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! The duplex session to the cloud service.
//!
//! One framed, ordered, at-least-once socket carries every RPC and
//! every unsolicited push once the session is open. Frames have the
//! same REST shape as the bootstrap HTTP calls, so a frame is
//! `{ method, path, headers, data }` and its response reuses
//! [`http::Response`]. The concrete socket (WebSocket in a browser
//! shell) lives behind the [`Transport`] trait.

use std::collections::HashMap;

use serde::Serialize;

use crate::common::Result;
use crate::http;

/// One outbound RPC frame.
#[derive(Clone, Debug, Serialize)]
pub struct Frame {
    pub method: http::Method,
    pub path: String,
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// The kinds of unsolicited frames the service delivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PushKind {
    Signal,
    Pubsub,
    Join,
    Leave,
    Message,
    Presence,
}

/// An unsolicited frame, not correlated to any outbound request.
#[derive(Clone, Debug)]
pub struct Push {
    pub kind: PushKind,
    pub payload: serde_json::Value,
}

/// Completion for one outbound frame. `None` indicates the transport
/// failed before a response frame arrived.
pub type FrameCallback = Box<dyn FnOnce(Option<http::Response>) + Send>;

/// Callbacks from the transport into its owner. Implementations must
/// deliver pushes in server order and call `on_close` exactly once per
/// established session.
pub trait TransportEvents: Send {
    fn on_push(&self, push: Push);
    fn on_close(&self, reason: String);
}

/// Identity the server assigned to this connection at session open.
#[derive(Clone, Debug)]
pub struct ConnectInfo {
    pub connection_id: String,
}

/// The framed duplex socket.
///
/// The channel is the only caller; implementations should drop the
/// `TransportEvents` sink when the session closes.
pub trait Transport: Send + Sync {
    /// Open the session using a previously acquired session token.
    fn connect(
        &self,
        session_token: &str,
        events: Box<dyn TransportEvents>,
        done: Box<dyn FnOnce(Result<ConnectInfo>) + Send>,
    );

    /// Submit one frame; `callback` fires exactly once.
    fn send_frame(&self, frame: Frame, callback: FrameCallback);

    /// Tear the session down. No further frames or pushes after this.
    fn close(&self);
}
