//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! A point-to-point media or data session with a remote endpoint.
//!
//! A `Call` aggregates one state machine, one peer-connection handle,
//! and a signaling channel handle. State-machine edges drive the side
//! effects: device access is requested on `approvingDeviceAccess`,
//! the offer goes out on `offering`, the answer on `connecting`, the
//! `connected` signal when the callee lands in `connected`, and the
//! teardown (bye, peer-connection close, index removal) on
//! `terminated`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::common::{CallDirection, ConnectionId, EndpointId, Result, SessionId, SignalTarget};
use crate::core::call_mutex::CallMutex;
use crate::core::call_state::{CallStateMachine, Edge, Event, State, StateEvent};
use crate::core::channel::{log_failures, SignalParams, SignalingChannel};
use crate::core::direct::DirectConnection;
use crate::core::platform::{
    CallEvent, DataChannel, DirectConnectionEvent, PeerConnection, Platform,
};
use crate::core::signaling::{
    IceCandidate, ModifyAction, ReceivedSignal, SignalBody, SignalType,
};
use crate::error::RespokeError;

/// Represents one call between the local client and a remote
/// endpoint. Clone-able handle; clones share state.
pub struct Call<T>
where
    T: Platform,
{
    /// Session id; doubles as the call id.
    session_id: SessionId,
    /// The call direction. `Outgoing` emits the first offer.
    direction: CallDirection,
    /// Media call, screen share, or data-channel session.
    target: SignalTarget,
    /// The remote party.
    remote_endpoint: EndpointId,
    platform: Arc<CallMutex<T>>,
    channel: SignalingChannel<T>,
    fsm: Arc<CallMutex<CallStateMachine>>,
    /// The winning remote connection, once chosen (caller) or the
    /// caller's connection (callee).
    remote_connection: Arc<CallMutex<Option<ConnectionId>>>,
    pc: Arc<CallMutex<Option<Box<dyn PeerConnection>>>>,
    /// Remote description waiting for the peer connection (callee).
    pending_remote_sdp: Arc<CallMutex<Option<String>>>,
    /// Candidates that arrived before the peer connection was ready.
    pending_candidates: Arc<CallMutex<Vec<IceCandidate>>>,
    direct: Arc<CallMutex<Option<DirectConnection>>>,
    /// The remote side already ended the call; suppresses the bye.
    remote_ended: Arc<AtomicBool>,
    hangup_sent: Arc<AtomicBool>,
}

impl<T> Clone for Call<T>
where
    T: Platform,
{
    fn clone(&self) -> Self {
        Self {
            session_id: self.session_id.clone(),
            direction: self.direction,
            target: self.target,
            remote_endpoint: self.remote_endpoint.clone(),
            platform: Arc::clone(&self.platform),
            channel: self.channel.clone(),
            fsm: Arc::clone(&self.fsm),
            remote_connection: Arc::clone(&self.remote_connection),
            pc: Arc::clone(&self.pc),
            pending_remote_sdp: Arc::clone(&self.pending_remote_sdp),
            pending_candidates: Arc::clone(&self.pending_candidates),
            direct: Arc::clone(&self.direct),
            remote_ended: Arc::clone(&self.remote_ended),
            hangup_sent: Arc::clone(&self.hangup_sent),
        }
    }
}

impl<T> fmt::Display for Call<T>
where
    T: Platform,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self.fsm.lock() {
            Ok(fsm) => format!("{}", fsm.state()),
            Err(_) => "unavailable".to_string(),
        };
        write!(
            f,
            "session_id: {}, direction: {}, target: {}, state: {}",
            self.session_id, self.direction, self.target, state
        )
    }
}

impl<T> fmt::Debug for Call<T>
where
    T: Platform,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl<T> Call<T>
where
    T: Platform,
{
    /// Create the caller side of a new session.
    pub fn outgoing(
        channel: &SignalingChannel<T>,
        remote_endpoint: EndpointId,
        target: SignalTarget,
    ) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        info!("call: outgoing, session_id: {}", session_id);
        Self::new(channel, session_id, remote_endpoint, CallDirection::Outgoing, target)
    }

    /// Create the callee side for a first inbound offer.
    pub fn incoming(channel: &SignalingChannel<T>, signal: &ReceivedSignal) -> Self {
        info!("call: incoming, session_id: {}", signal.session_id);
        let call = Self::new(
            channel,
            signal.session_id.clone(),
            signal.from_endpoint.clone(),
            CallDirection::Incoming,
            signal.target,
        );
        // Answers go back to the device that called us.
        if let Ok(mut remote) = call.remote_connection.lock() {
            *remote = Some(signal.from_connection.clone());
        }
        call
    }

    fn new(
        channel: &SignalingChannel<T>,
        session_id: SessionId,
        remote_endpoint: EndpointId,
        direction: CallDirection,
        target: SignalTarget,
    ) -> Self {
        Self {
            session_id,
            direction,
            target,
            remote_endpoint,
            platform: channel.platform(),
            channel: channel.clone(),
            fsm: Arc::new(CallMutex::new(
                CallStateMachine::new(direction.is_caller()),
                "call_fsm",
            )),
            remote_connection: Arc::new(CallMutex::new(None, "remote_connection")),
            pc: Arc::new(CallMutex::new(None, "peer_connection")),
            pending_remote_sdp: Arc::new(CallMutex::new(None, "pending_remote_sdp")),
            pending_candidates: Arc::new(CallMutex::new(Vec::new(), "pending_candidates")),
            direct: Arc::new(CallMutex::new(None, "direct_connection")),
            remote_ended: Arc::new(AtomicBool::new(false)),
            hangup_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id.clone()
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn target(&self) -> SignalTarget {
        self.target
    }

    pub fn remote_endpoint(&self) -> EndpointId {
        self.remote_endpoint.clone()
    }

    pub fn remote_connection_id(&self) -> Option<ConnectionId> {
        self.remote_connection.lock().ok().and_then(|r| r.clone())
    }

    pub fn state(&self) -> State {
        self.fsm
            .lock()
            .map(|fsm| fsm.state())
            .unwrap_or(State::Terminated)
    }

    pub fn is_modifying(&self) -> bool {
        self.fsm.lock().map(|fsm| fsm.is_modifying()).unwrap_or(false)
    }

    pub fn is_active(&self) -> bool {
        self.fsm.lock().map(|fsm| fsm.is_active()).unwrap_or(false)
    }

    ////////////////////////////////////////////////////////////////////////
    // Application API
    ////////////////////////////////////////////////////////////////////////

    /// Begin the call. Terminates immediately when nobody on this
    /// client listens for calls.
    pub fn start(&self) -> Result<()> {
        let listening = self.platform.lock()?.has_call_listener();
        self.dispatch(Event::Initiate { listening })?;
        if self.direction.is_caller() && self.state() != State::Terminated {
            if self.target == SignalTarget::DirectConnection {
                self.notify_direct_event(DirectConnectionEvent::Start);
            }
            // The caller proceeds without a separate local accept.
            self.dispatch(Event::Answer)?;
        }
        Ok(())
    }

    /// Accept the call (callee), or proceed after a renegotiation
    /// re-prepare.
    pub fn answer(&self) -> Result<()> {
        if self.direction == CallDirection::Incoming
            && self.target == SignalTarget::DirectConnection
        {
            self.notify_direct_event(DirectConnectionEvent::Accept);
        }
        self.dispatch(Event::Answer)
    }

    /// User approval: first grants device access, second approves the
    /// gathered content.
    pub fn approve(&self) -> Result<()> {
        self.dispatch(Event::Approve)
    }

    /// Decline. Before media flows this tears the call down; on an
    /// established call it declines a renegotiation instead.
    pub fn reject(&self) -> Result<()> {
        self.dispatch(Event::Reject)
    }

    /// Hang up. Idempotent at the peer; duplicates are ignored there.
    pub fn hangup(&self, reason: Option<String>) -> Result<()> {
        if reason.is_some() {
            // Say the reasoned bye now; the terminated-entry teardown
            // sends a plain one only if nothing went out yet.
            self.send_bye(reason);
        }
        self.dispatch(Event::Hangup)
    }

    /// Ask the remote side to renegotiate the established call.
    pub fn modify(&self) -> Result<()> {
        self.dispatch(Event::Modify { receive: false })
    }

    /// Accept a renegotiation the remote side initiated.
    pub fn accept_modify(&self) -> Result<()> {
        self.channel.send_modify(
            self.signal_params(),
            ModifyAction::Accept,
            log_failures("send modify accept"),
        );
        self.dispatch(Event::Modify { receive: true })
    }

    /// Decline a renegotiation the remote side initiated; the
    /// established call stays up.
    pub fn reject_modify(&self) -> Result<()> {
        self.channel.send_modify(
            self.signal_params(),
            ModifyAction::Reject,
            log_failures("send modify reject"),
        );
        Ok(())
    }

    /// Send a message over the direct connection.
    pub fn send_direct_message(&self, message: &str) -> Result<()> {
        let direct = self.direct.lock()?;
        match direct.as_ref() {
            Some(direct) => direct.send(message),
            None => Err(RespokeError::OptionValueNotSet(
                "send_direct_message".to_string(),
                "direct".to_string(),
            )),
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Peer-connection hooks
    ////////////////////////////////////////////////////////////////////////

    /// Local media finished gathering.
    pub fn received_local_media(&self) -> Result<()> {
        self.dispatch(Event::ReceiveLocalMedia)
    }

    /// Remote media started flowing.
    pub fn received_remote_media(&self) -> Result<()> {
        self.dispatch(Event::ReceiveRemoteMedia)
    }

    /// Locally gathered candidates are ready to signal.
    pub fn local_candidates_ready(&self, candidates: Vec<IceCandidate>) {
        if candidates.is_empty() {
            return;
        }
        self.channel.send_candidates(
            self.signal_params(),
            candidates,
            log_failures("send candidates"),
        );
    }

    /// The remote side opened a data channel toward us.
    pub fn remote_data_channel(&self, data_channel: Box<dyn DataChannel>) {
        if let Err(e) = self.attach_data_channel(data_channel) {
            error!("attaching remote data channel failed: {}", e);
        }
    }

    /// A message arrived on the direct connection.
    pub fn direct_message_received(&self, message: String) {
        self.notify_direct_event(DirectConnectionEvent::Message(message));
    }

    /// Periodic statistics from the peer connection.
    pub fn stats_ready(&self, stats: Value) {
        debug!("call {}: stats snapshot", self.session_id);
        self.channel
            .send_call_debug_report(stats, log_failures("send call debug report"));
    }

    ////////////////////////////////////////////////////////////////////////
    // Inbound signals
    ////////////////////////////////////////////////////////////////////////

    /// Deliver one routed inbound signal.
    pub fn inject_signal(&self, signal: ReceivedSignal) -> Result<()> {
        let signal_type = signal.body.signal_type();
        debug!("call {}: inbound {}", self.session_id, signal.body);
        self.notify_call_event(CallEvent::Signal { signal_type });

        match signal.body {
            SignalBody::Offer { sdp } => self.inject_offer(sdp),
            SignalBody::Answer { sdp } => self.inject_answer(sdp, signal.from_connection),
            SignalBody::Connected => Ok(()),
            SignalBody::IceCandidates { candidates } => self.inject_candidates(candidates),
            SignalBody::Modify { action } => self.inject_modify(action),
            SignalBody::Bye { reason } => self.inject_hangup(reason),
            SignalBody::Ack { .. } => Ok(()),
        }
    }

    fn inject_offer(&self, sdp: String) -> Result<()> {
        {
            let mut pending = self.pending_remote_sdp.lock()?;
            *pending = Some(sdp);
        }
        if self.state() == State::Idle {
            let listening = self.platform.lock()?.has_call_listener();
            if self.target == SignalTarget::DirectConnection {
                self.notify_direct_event(DirectConnectionEvent::Start);
            }
            self.dispatch(Event::Initiate { listening })?;
        }
        Ok(())
    }

    fn inject_answer(&self, sdp: String, from_connection: ConnectionId) -> Result<()> {
        if self.direction == CallDirection::Incoming {
            warn!("call {}: dropping answer on callee side", self.session_id);
            return Ok(());
        }

        enum Fork {
            Winner,
            Duplicate,
            Loser,
        }

        let fork = {
            let mut remote = self.remote_connection.lock()?;
            match remote.as_ref() {
                None => {
                    *remote = Some(from_connection.clone());
                    Fork::Winner
                }
                Some(winner) if *winner == from_connection => Fork::Duplicate,
                Some(_) => Fork::Loser,
            }
        };

        match fork {
            Fork::Winner => {
                self.apply_remote_answer(&sdp)?;
                self.dispatch(Event::ReceiveAnswer)
            }
            Fork::Duplicate => Ok(()),
            Fork::Loser => {
                // Another of the callee's connections answered after we
                // committed to a winner; tell it to stand down. The
                // winner's own state must not move.
                info!(
                    "call {}: answer from losing fork {}",
                    self.session_id, from_connection
                );
                let mut params = self.signal_params();
                params.connection_id = Some(from_connection);
                self.channel
                    .send_hangup(params, None, log_failures("send losing-fork bye"));
                Ok(())
            }
        }
    }

    fn inject_candidates(&self, candidates: Vec<IceCandidate>) -> Result<()> {
        let mut pc = self.pc.lock()?;
        match pc.as_mut() {
            Some(pc) => pc.add_remote_candidates(candidates),
            None => {
                drop(pc);
                self.pending_candidates.lock()?.extend(candidates);
                Ok(())
            }
        }
    }

    fn inject_modify(&self, action: ModifyAction) -> Result<()> {
        match action {
            // The application decides; `accept_modify` re-prepares.
            ModifyAction::Initiate => Ok(()),
            ModifyAction::Accept => self.dispatch(Event::Accept),
            ModifyAction::Reject => self.dispatch(Event::Reject),
        }
    }

    fn inject_hangup(&self, reason: Option<String>) -> Result<()> {
        if let Some(reason) = reason {
            info!("call {}: remote hangup: {}", self.session_id, reason);
        }
        self.remote_ended.store(true, Ordering::SeqCst);
        self.dispatch(Event::Hangup)
    }

    ////////////////////////////////////////////////////////////////////////
    // State machine plumbing
    ////////////////////////////////////////////////////////////////////////

    /// Feed one event through the state machine and run the side
    /// effects of any resulting transition.
    pub fn dispatch(&self, event: Event) -> Result<()> {
        let events = {
            let mut fsm = self.fsm.lock()?;
            fsm.dispatch(event)
        };
        for state_event in events {
            self.notify_call_event(CallEvent::State {
                state: state_event.state,
                edge: state_event.edge,
            });
            if let Err(e) = self.handle_state_event(state_event) {
                error!(
                    "call {}: {} handler failed: {}",
                    self.session_id, state_event, e
                );
                if state_event.state != State::Terminated {
                    let _ = self.dispatch(Event::Hangup);
                }
            }
        }
        Ok(())
    }

    fn handle_state_event(&self, state_event: StateEvent) -> Result<()> {
        if state_event.edge != Edge::Entry {
            return Ok(());
        }
        match state_event.state {
            State::ApprovingDeviceAccess => {
                let call = self.clone();
                self.platform.lock()?.request_device_media(&call)
            }
            State::Offering => self.begin_offer(),
            State::Connecting => self.begin_answer(),
            State::Modifying => {
                self.channel.send_modify(
                    self.signal_params(),
                    ModifyAction::Initiate,
                    log_failures("send modify initiate"),
                );
                Ok(())
            }
            State::Connected => self.handle_connected(),
            State::Terminated => self.conclude(),
            _ => Ok(()),
        }
    }

    /// Caller: emit the offer once media is approved and gathered.
    fn begin_offer(&self) -> Result<()> {
        self.ensure_peer_connection()?;
        let call = self.clone();
        let mut pc = self.pc.lock()?;
        let pc = pc.as_mut().ok_or_else(|| {
            RespokeError::OptionValueNotSet("begin_offer".to_string(), "pc".to_string())
        })?;
        pc.create_offer(Box::new(move |result| match result {
            Ok(sdp) => {
                let sent = call.clone();
                call.channel.send_sdp(
                    call.signal_params(),
                    SignalType::Offer,
                    sdp,
                    Box::new(move |result| match result {
                        Ok(_) => {
                            let _ = sent.dispatch(Event::SentOffer);
                        }
                        Err(e) => sent.fail("sending offer", e),
                    }),
                );
            }
            Err(e) => call.fail("creating offer", e),
        }));
        Ok(())
    }

    /// Callee: apply the stored remote offer and emit the answer.
    fn begin_answer(&self) -> Result<()> {
        let caller = self.fsm.lock()?.caller();
        if caller {
            // The caller lands here via receiveAnswer; the answer was
            // already applied. Just flush any buffered candidates.
            return self.flush_pending_candidates();
        }

        let offer_sdp = self
            .pending_remote_sdp
            .lock()?
            .take()
            .ok_or_else(|| {
                RespokeError::OptionValueNotSet(
                    "begin_answer".to_string(),
                    "pending_remote_sdp".to_string(),
                )
            })?;

        self.ensure_peer_connection()?;
        {
            let call = self.clone();
            let mut pc = self.pc.lock()?;
            let pc = pc.as_mut().ok_or_else(|| {
                RespokeError::OptionValueNotSet("begin_answer".to_string(), "pc".to_string())
            })?;
            pc.create_answer(
                &offer_sdp,
                Box::new(move |result| match result {
                    Ok(sdp) => {
                        let sent = call.clone();
                        call.channel.send_sdp(
                            call.signal_params(),
                            SignalType::Answer,
                            sdp,
                            Box::new(move |result| {
                                if let Err(e) = result {
                                    sent.fail("sending answer", e);
                                }
                            }),
                        );
                    }
                    Err(e) => call.fail("creating answer", e),
                }),
            );
        }
        self.flush_pending_candidates()
    }

    fn handle_connected(&self) -> Result<()> {
        let caller = self.fsm.lock()?.caller();
        if !caller {
            self.channel
                .send_connected(self.signal_params(), log_failures("send connected"));
        }
        if self.target == SignalTarget::DirectConnection && caller {
            // The caller opens the channel; the callee receives it via
            // remote_data_channel.
            let data_channel = {
                let mut pc = self.pc.lock()?;
                let pc = pc.as_mut().ok_or_else(|| {
                    RespokeError::OptionValueNotSet(
                        "handle_connected".to_string(),
                        "pc".to_string(),
                    )
                })?;
                pc.create_data_channel("respoke")?
            };
            self.attach_data_channel(data_channel)?;
        }
        Ok(())
    }

    /// Terminal teardown: bye (unless the remote side ended it or we
    /// already said it), close media, drop from the client index.
    fn conclude(&self) -> Result<()> {
        info!("call {}: concluded", self.session_id);

        if !self.remote_ended.load(Ordering::SeqCst) {
            self.send_bye(None);
        }

        let had_direct = {
            let mut direct = self.direct.lock()?;
            match direct.take() {
                Some(mut direct) => {
                    direct.close();
                    true
                }
                None => false,
            }
        };
        if had_direct {
            self.notify_direct_event(DirectConnectionEvent::Close);
        }

        if let Ok(mut pc) = self.pc.lock() {
            if let Some(pc) = pc.as_mut() {
                pc.close();
            }
            *pc = None;
        }

        self.platform.lock()?.call_concluded(&self.session_id);
        Ok(())
    }

    fn send_bye(&self, reason: Option<String>) {
        if self.hangup_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.channel
            .send_hangup(self.signal_params(), reason, log_failures("send bye"));
    }

    ////////////////////////////////////////////////////////////////////////
    // Internal helpers
    ////////////////////////////////////////////////////////////////////////

    fn signal_params(&self) -> SignalParams {
        let mut params = SignalParams::new(
            self.remote_endpoint.clone(),
            self.session_id.clone(),
            self.target,
        );
        params.connection_id = self.remote_connection_id();
        params
    }

    fn ensure_peer_connection(&self) -> Result<()> {
        {
            let pc = self.pc.lock()?;
            if pc.is_some() {
                return Ok(());
            }
        }
        let call = self.clone();
        let created = self.platform.lock()?.create_peer_connection(&call)?;
        let mut pc = self.pc.lock()?;
        if pc.is_none() {
            *pc = Some(created);
        }
        Ok(())
    }

    fn apply_remote_answer(&self, sdp: &str) -> Result<()> {
        let call = self.clone();
        let mut pc = self.pc.lock()?;
        let pc = pc.as_mut().ok_or_else(|| {
            RespokeError::OptionValueNotSet("apply_remote_answer".to_string(), "pc".to_string())
        })?;
        pc.accept_answer(
            sdp,
            Box::new(move |result| {
                if let Err(e) = result {
                    call.fail("applying remote answer", e);
                }
            }),
        );
        Ok(())
    }

    fn flush_pending_candidates(&self) -> Result<()> {
        let mut buffered = {
            let mut pending = self.pending_candidates.lock()?;
            std::mem::take(&mut *pending)
        };
        if buffered.is_empty() {
            return Ok(());
        }
        let mut pc = self.pc.lock()?;
        match pc.as_mut() {
            Some(pc) => pc.add_remote_candidates(buffered),
            None => {
                drop(pc);
                // Still no peer connection; put them back in order.
                let mut pending = self.pending_candidates.lock()?;
                buffered.append(&mut pending);
                *pending = buffered;
                Ok(())
            }
        }
    }

    fn attach_data_channel(&self, data_channel: Box<dyn DataChannel>) -> Result<()> {
        {
            let mut direct = self.direct.lock()?;
            match direct.as_mut() {
                Some(existing) => existing.attach(data_channel),
                None => {
                    let mut created = DirectConnection::new(
                        self.session_id.clone(),
                        self.remote_endpoint.clone(),
                    );
                    created.attach(data_channel);
                    *direct = Some(created);
                }
            }
        }
        self.notify_direct_event(DirectConnectionEvent::Open);
        Ok(())
    }

    fn notify_call_event(&self, event: CallEvent) {
        if let Ok(mut platform) = self.platform.lock() {
            platform.on_call_event(self, event);
        }
    }

    fn notify_direct_event(&self, event: DirectConnectionEvent) {
        self.notify_call_event(CallEvent::Direct(event));
    }

    fn fail(&self, context: &str, error: RespokeError) {
        error!("call {}: {} failed: {}", self.session_id, context, error);
        // Deferred: a peer-connection primitive may run its completion
        // inline while the call still holds the pc lock the teardown
        // needs.
        let call = self.clone();
        self.channel.post(Box::new(move || {
            let _ = call.dispatch(Event::Hangup);
        }));
    }
}
