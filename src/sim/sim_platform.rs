//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Simulation client platform for tests.
//!
//! Owns the call index like a real client would, records every
//! surfaced event, and provides a scripted peer-connection primitive
//! whose SDP generation completes synchronously.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::common::{GroupId, Result, SessionId, SignalTarget};
use crate::core::call::Call;
use crate::core::call_state::{Edge, State};
use crate::core::channel::SignalingChannel;
use crate::core::platform::{
    CallEvent, ClientEvent, DataChannel, PeerConnection, Platform,
};
use crate::core::signaling::{IceCandidate, ReceivedSignal};

/// Counters shared by every peer connection the platform creates.
#[derive(Default)]
pub struct PcStats {
    pub offers_created: AtomicUsize,
    pub answers_created: AtomicUsize,
    pub answers_applied: AtomicUsize,
    pub remote_candidates: AtomicUsize,
    pub data_channels: AtomicUsize,
    pub closed: AtomicUsize,
    pub dc_messages: Mutex<Vec<String>>,
}

pub struct SimPeerConnection {
    stats: Arc<PcStats>,
}

impl PeerConnection for SimPeerConnection {
    fn create_offer(&mut self, done: Box<dyn FnOnce(Result<String>) + Send>) {
        self.stats.offers_created.fetch_add(1, Ordering::SeqCst);
        done(Ok("v=0 sim-offer".to_string()));
    }

    fn accept_answer(&mut self, _sdp: &str, done: Box<dyn FnOnce(Result<()>) + Send>) {
        self.stats.answers_applied.fetch_add(1, Ordering::SeqCst);
        done(Ok(()));
    }

    fn create_answer(&mut self, _offer_sdp: &str, done: Box<dyn FnOnce(Result<String>) + Send>) {
        self.stats.answers_created.fetch_add(1, Ordering::SeqCst);
        done(Ok("v=0 sim-answer".to_string()));
    }

    fn add_remote_candidates(&mut self, candidates: Vec<IceCandidate>) -> Result<()> {
        self.stats
            .remote_candidates
            .fetch_add(candidates.len(), Ordering::SeqCst);
        Ok(())
    }

    fn create_data_channel(&mut self, _label: &str) -> Result<Box<dyn DataChannel>> {
        self.stats.data_channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimDataChannel {
            stats: Arc::clone(&self.stats),
        }))
    }

    fn get_stats(&self, done: Box<dyn FnOnce(Value) + Send>) {
        done(json!({ "sim": true }));
    }

    fn close(&mut self) {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct SimDataChannel {
    stats: Arc<PcStats>,
}

impl DataChannel for SimDataChannel {
    fn send(&self, message: &str) -> Result<()> {
        self.stats.dc_messages.lock().unwrap().push(message.to_string());
        Ok(())
    }

    fn close(&mut self) {}
}

pub struct SimPlatform {
    calls: HashMap<SessionId, Call<SimPlatform>>,
    client_events: Vec<ClientEvent>,
    call_events: Vec<(SessionId, CallEvent)>,
    joined: Vec<GroupId>,
    listening: bool,
    media_requests: Vec<SessionId>,
    concluded: Vec<SessionId>,
    pc_stats: Arc<PcStats>,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
            client_events: Vec::new(),
            call_events: Vec::new(),
            joined: Vec::new(),
            listening: true,
            media_requests: Vec::new(),
            concluded: Vec::new(),
            pc_stats: Arc::new(PcStats::default()),
        }
    }

    pub fn set_listening(&mut self, listening: bool) {
        self.listening = listening;
    }

    pub fn set_joined_groups(&mut self, groups: Vec<GroupId>) {
        self.joined = groups;
    }

    /// Index an outbound call the test created.
    pub fn add_call(&mut self, call: Call<SimPlatform>) {
        self.calls.insert(call.session_id(), call);
    }

    pub fn call(&self, session_id: &str) -> Option<Call<SimPlatform>> {
        self.calls.get(session_id).cloned()
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn pc_stats(&self) -> Arc<PcStats> {
        Arc::clone(&self.pc_stats)
    }

    pub fn client_events(&self) -> Vec<ClientEvent> {
        self.client_events.clone()
    }

    pub fn media_requests(&self) -> usize {
        self.media_requests.len()
    }

    pub fn concluded(&self) -> Vec<SessionId> {
        self.concluded.clone()
    }

    /// Entry edges recorded for one session, in firing order.
    pub fn state_entries(&self, session_id: &str) -> Vec<State> {
        self.call_events
            .iter()
            .filter(|(session, _)| session == session_id)
            .filter_map(|(_, event)| match event {
                CallEvent::State {
                    state,
                    edge: Edge::Entry,
                } => Some(*state),
                _ => None,
            })
            .collect()
    }

    /// Inbound signal kinds surfaced for one session.
    pub fn signal_events(&self, session_id: &str) -> Vec<crate::core::signaling::SignalType> {
        self.call_events
            .iter()
            .filter(|(session, _)| session == session_id)
            .filter_map(|(_, event)| match event {
                CallEvent::Signal { signal_type } => Some(*signal_type),
                _ => None,
            })
            .collect()
    }

    pub fn direct_events(&self, session_id: &str) -> Vec<String> {
        self.call_events
            .iter()
            .filter(|(session, _)| session == session_id)
            .filter_map(|(_, event)| match event {
                CallEvent::Direct(direct) => Some(direct.to_string()),
                _ => None,
            })
            .collect()
    }
}

impl Platform for SimPlatform {
    fn call_for_session(
        &mut self,
        session_id: &SessionId,
        _target: SignalTarget,
    ) -> Option<Call<SimPlatform>> {
        self.calls.get(session_id).cloned()
    }

    fn create_incoming_call(
        &mut self,
        channel: &SignalingChannel<SimPlatform>,
        offer: &ReceivedSignal,
    ) -> Result<Call<SimPlatform>> {
        let call = Call::incoming(channel, offer);
        self.calls.insert(call.session_id(), call.clone());
        Ok(call)
    }

    fn direct_connection_call(
        &mut self,
        channel: &SignalingChannel<SimPlatform>,
        offer: &ReceivedSignal,
    ) -> Result<Call<SimPlatform>> {
        let existing = self
            .calls
            .values()
            .find(|call| {
                call.target() == SignalTarget::DirectConnection
                    && call.remote_endpoint() == offer.from_endpoint
            })
            .cloned();
        if let Some(existing) = existing {
            if existing.session_id() == offer.session_id {
                return Ok(existing);
            }
            // One direct connection per endpoint; a new session
            // replaces the old call in the index.
            self.calls.remove(&existing.session_id());
        }
        let call = Call::incoming(channel, offer);
        self.calls.insert(call.session_id(), call.clone());
        Ok(call)
    }

    fn create_peer_connection(
        &mut self,
        _call: &Call<SimPlatform>,
    ) -> Result<Box<dyn PeerConnection>> {
        Ok(Box::new(SimPeerConnection {
            stats: Arc::clone(&self.pc_stats),
        }))
    }

    fn request_device_media(&mut self, call: &Call<SimPlatform>) -> Result<()> {
        self.media_requests.push(call.session_id());
        Ok(())
    }

    fn has_call_listener(&self) -> bool {
        self.listening
    }

    fn joined_groups(&self) -> Vec<GroupId> {
        self.joined.clone()
    }

    fn on_client_event(&mut self, event: ClientEvent) {
        self.client_events.push(event);
    }

    fn on_call_event(&mut self, call: &Call<SimPlatform>, event: CallEvent) {
        self.call_events.push((call.session_id(), event));
    }

    fn call_concluded(&mut self, session_id: &SessionId) {
        self.calls.remove(session_id);
        self.concluded.push(session_id.clone());
    }
}
