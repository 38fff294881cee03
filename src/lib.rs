//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! # Respoke -- A Rust client core for WebRTC signaling
//!
//! This crate is the client half of a cloud-brokered
//! [WebRTC](https://webrtc.org/) calling system: endpoints
//! authenticated to the service discover one another, exchange
//! session-description and ICE-candidate signals over one duplex
//! socket, and open audio, video, screen-share, or data-channel
//! sessions.
//!
//! The two central pieces are the per-call state machine
//! ([`core::call_state`]) and the signaling channel
//! ([`core::channel`]), which multiplexes RPCs, pushes, and
//! peer-to-peer signals over the framed transport. Media, rendering,
//! and the peer-connection primitive itself stay behind traits the
//! embedder implements ([`core::platform`]).

#[macro_use]
extern crate log;

pub mod common;

pub mod error;

/// Core, platform independent functionality.
pub mod core {
    pub mod batch;
    pub mod call;
    pub mod call_mutex;
    pub mod call_state;
    pub mod channel;
    pub mod direct;
    pub mod platform;
    pub mod signaling;
    pub mod util;
}

/// HTTP bootstrap (token acquisition) abstractions.
pub mod http;

/// The framed duplex session to the cloud service.
pub mod transport;

#[cfg(feature = "sim")]
pub mod sim {
    pub mod sim_http;
    pub mod sim_platform;
    pub mod sim_scheduler;
    pub mod sim_transport;
}
