//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Common types used throughout the library.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod scheduler;

/// Common Result type, using [`RespokeError`](crate::error::RespokeError)
/// for the error arm.
pub type Result<T> = std::result::Result<T, crate::error::RespokeError>;

/// Logical user identity, as issued by the service.
pub type EndpointId = String;

/// One live session of an endpoint, identified by a server-issued id.
pub type ConnectionId = String;

/// Correlates every signal of one call; equals the call's id.
pub type SessionId = String;

/// Named group for membership and pubsub operations.
pub type GroupId = String;

/// The call direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallDirection {
    /// This side received the first offer.
    Incoming,
    /// This side emits the first offer.
    Outgoing,
}

impl CallDirection {
    pub fn is_caller(self) -> bool {
        self == CallDirection::Outgoing
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What kind of session a signal belongs to.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SignalTarget {
    Call,
    Screenshare,
    DirectConnection,
}

/// Client configuration. Plain data owned by the signaling channel; the
/// embedder decides where the values come from.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the service API, without a trailing slash.
    pub base_url: String,
    /// Application id, required for development-mode token acquisition.
    pub app_id: Option<String>,
    /// Local endpoint id, required for development-mode token acquisition.
    pub endpoint_id: Option<String>,
    /// When true, `open` may mint its own token via `POST /v1/tokens`.
    pub dev_mode: bool,
    /// Whether the channel schedules reconnect attempts after a
    /// transport loss.
    pub reconnect: bool,
    /// Timeout inherited by every RPC over the duplex session.
    pub connect_timeout: Duration,
    /// First reconnect delay; doubles up to `reconnect_backoff_cap`.
    pub reconnect_backoff_floor: Duration,
    /// Ceiling for the reconnect delay.
    pub reconnect_backoff_cap: Duration,
    /// Gates `POST /v1/call-debugs` reports.
    pub enable_call_debugs: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.respoke.io".to_string(),
            app_id: None,
            endpoint_id: None,
            dev_mode: false,
            reconnect: true,
            connect_timeout: Duration::from_secs(10),
            reconnect_backoff_floor: Duration::from_millis(2500),
            reconnect_backoff_cap: Duration::from_secs(300),
            enable_call_debugs: false,
        }
    }
}
