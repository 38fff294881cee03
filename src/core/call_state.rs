//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Call Finite State Machine
//!
//! Encodes every legal call lifecycle transition and rejects
//! everything else silently: an event a state has no row for leaves
//! the state unchanged and raises nothing. The surrounding [`Call`]
//! object reacts to the emitted `exit`/`entry` edges to trigger side
//! effects such as media acquisition, SDP emission, and teardown.
//!
//! # Events
//!
//! ## From the client application
//!
//! - Initiate
//! - Answer
//! - Approve
//! - Modify
//! - Reject
//! - Hangup
//!
//! ## From the peer-connection primitive
//!
//! - ReceiveLocalMedia
//! - ReceiveRemoteMedia
//!
//! ## From the signaling channel
//!
//! - SentOffer
//! - ReceiveAnswer
//! - Accept
//! - Reject
//! - Hangup
//!
//! [`Call`]: crate::core::call::Call

use std::fmt;
use std::mem;

/// Tracks the state of the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "camelCase")]
pub enum State {
    /// No call in progress.
    Idle,
    /// The call exists locally; nothing has been approved yet.
    Preparing,
    /// Waiting for the user to grant device access.
    ApprovingDeviceAccess,
    /// Waiting for the user to approve the gathered content.
    ApprovingContent,
    /// Caller side has (or is about to have) an offer in flight.
    Offering,
    /// Both descriptions known; waiting for media to flow.
    Connecting,
    /// Media is flowing.
    Connected,
    /// This side initiated a renegotiation and awaits the verdict.
    Modifying,
    /// Terminal. No further transitions or events.
    Terminated,
}

/// The different types of call events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "camelCase")]
pub enum Event {
    /// The call was created. `listening` reports whether the client
    /// has an incoming-call listener; without one the call dies here.
    Initiate { listening: bool },
    /// Proceed with the call (callee accepting, or re-prepare).
    Answer,
    /// User approval; first for device access, then for content.
    Approve,
    /// Local media finished gathering.
    ReceiveLocalMedia,
    /// The offer went out on the signaling channel.
    SentOffer,
    /// The remote answer arrived.
    ReceiveAnswer,
    /// Remote media started flowing.
    ReceiveRemoteMedia,
    /// The remote side accepted our renegotiation request.
    Accept,
    /// Renegotiate. `receive: true` means the remote side asked.
    Modify { receive: bool },
    /// Decline: teardown before media flows, keep-the-call after.
    Reject,
    /// Local or remote teardown.
    Hangup,
}

/// Which side of a state change an emitted event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Edge {
    Exit,
    Entry,
}

/// One `<state>:exit` / `<state>:entry` emission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateEvent {
    pub state: State,
    pub edge: Edge,
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.state, self.edge)
    }
}

type Listener = Box<dyn FnMut(StateEvent) + Send>;

/// The per-call state machine.
///
/// Transitions are a total function over `(State, Event)` with an
/// identity default; the match in [`dispatch`](Self::dispatch) is the
/// transition table.
pub struct CallStateMachine {
    state: State,
    caller: bool,
    is_media_flowing: bool,
    has_local_media: bool,
    has_local_media_approval: bool,
    /// Latched on entry to `modifying` (or a remote-initiated
    /// re-prepare); cleared on entry to `connected` or `terminated`.
    modifying: bool,
    listeners: Vec<Listener>,
}

impl fmt::Display for CallStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "state: {}, caller: {}, flowing: {}",
            self.state, self.caller, self.is_media_flowing
        )
    }
}

impl fmt::Debug for CallStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl CallStateMachine {
    pub fn new(caller: bool) -> Self {
        Self {
            state: State::Idle,
            caller,
            is_media_flowing: false,
            has_local_media: false,
            has_local_media_approval: false,
            modifying: false,
            listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn caller(&self) -> bool {
        self.caller
    }

    pub fn is_media_flowing(&self) -> bool {
        self.is_media_flowing
    }

    pub fn has_local_media(&self) -> bool {
        self.has_local_media
    }

    pub fn has_local_media_approval(&self) -> bool {
        self.has_local_media_approval
    }

    /// True between entry to `modifying` (or a modify-caused
    /// re-prepare) and the next entry to `connected` or `terminated`.
    pub fn is_modifying(&self) -> bool {
        self.modifying
    }

    /// Whether the call currently carries, or is still carrying, media.
    pub fn is_active(&self) -> bool {
        self.state == State::Connected || (self.modifying && self.is_media_flowing)
    }

    /// Register a passive observer for every emitted edge. Listeners
    /// must not dispatch back into the machine; the owning call reacts
    /// to the edges returned by [`dispatch`](Self::dispatch) instead.
    pub fn on_event(&mut self, listener: Listener) {
        self.listeners.push(listener);
    }

    /// Feed one event through the transition table.
    ///
    /// Returns the emitted edges: `[<prev>:exit, <next>:entry]` for a
    /// transition, empty for a stay or an event the current state has
    /// no row for. After `terminated` nothing transitions and nothing
    /// is emitted.
    pub fn dispatch(&mut self, event: Event) -> Vec<StateEvent> {
        if self.state == State::Terminated {
            return Vec::new();
        }

        use Event as E;
        use State::*;

        // `Some(next)` is a table row; `None` covers both explicit
        // "stay" cells and events outside the table.
        let next = match (self.state, event) {
            (Idle, E::Initiate { listening }) => {
                Some(if listening { Preparing } else { Terminated })
            }
            (Idle, E::Hangup) => Some(Terminated),

            (Preparing, E::Answer) if !self.is_media_flowing => Some(ApprovingDeviceAccess),
            // A modify accept can land after the re-prepare already
            // happened; absorb it.
            (Preparing, E::Accept) => None,
            (Preparing, E::Reject) if !self.is_media_flowing => Some(Terminated),
            (Preparing, E::Hangup) => Some(Terminated),

            (ApprovingDeviceAccess, E::Approve) => Some(ApprovingContent),
            (ApprovingDeviceAccess, E::Reject) | (ApprovingDeviceAccess, E::Hangup) => {
                Some(Terminated)
            }

            (ApprovingContent, E::Approve) => {
                self.has_local_media_approval = true;
                if self.has_local_media {
                    Some(self.post_media_state())
                } else {
                    None
                }
            }
            (ApprovingContent, E::ReceiveLocalMedia) => {
                self.has_local_media = true;
                if self.has_local_media_approval {
                    Some(self.post_media_state())
                } else {
                    None
                }
            }
            (ApprovingContent, E::Reject) | (ApprovingContent, E::Hangup) => Some(Terminated),

            (Offering, E::ReceiveLocalMedia) => {
                self.has_local_media = true;
                None
            }
            (Offering, E::SentOffer) => None,
            (Offering, E::ReceiveAnswer) => Some(Connecting),
            (Offering, E::Reject) | (Offering, E::Hangup) => Some(Terminated),

            (Connecting, E::ReceiveRemoteMedia) => Some(Connected),
            (Connecting, E::Reject) | (Connecting, E::Hangup) => Some(Terminated),

            (Connected, E::Modify { receive: true }) => {
                self.caller = false;
                self.reset_media_flags();
                self.modifying = true;
                Some(Preparing)
            }
            (Connected, E::Modify { receive: false }) => {
                self.modifying = true;
                Some(Modifying)
            }
            // A reject with media flowing is a signaling-level reject
            // of a losing fork; the established call stays up.
            (Connected, E::Reject) => None,
            (Connected, E::Hangup) => Some(Terminated),

            (Modifying, E::Accept) => {
                self.caller = true;
                self.reset_media_flags();
                Some(Preparing)
            }
            (Modifying, E::Reject) => Some(Connected),
            (Modifying, E::Hangup) => Some(Terminated),

            (state, event) => {
                debug!("dropping event {} while in state {}", event, state);
                None
            }
        };

        match next {
            Some(next) if next != self.state => self.perform_transition(next),
            _ => Vec::new(),
        }
    }

    /// Where a fully approved, media-bearing call goes next.
    fn post_media_state(&self) -> State {
        if self.caller {
            State::Offering
        } else {
            State::Connecting
        }
    }

    fn reset_media_flags(&mut self) {
        self.has_local_media = false;
        self.has_local_media_approval = false;
    }

    fn perform_transition(&mut self, next: State) -> Vec<StateEvent> {
        let prev = self.state;
        self.state = next;

        match next {
            State::Preparing => self.is_media_flowing = false,
            State::Connected => {
                self.is_media_flowing = true;
                self.modifying = false;
            }
            State::Terminated => {
                self.is_media_flowing = false;
                self.modifying = false;
            }
            _ => {}
        }

        let events = vec![
            StateEvent {
                state: prev,
                edge: Edge::Exit,
            },
            StateEvent {
                state: next,
                edge: Edge::Entry,
            },
        ];
        self.emit(&events);
        events
    }

    fn emit(&mut self, events: &[StateEvent]) {
        if self.listeners.is_empty() {
            return;
        }
        // Taken out so a listener registering another listener does
        // not alias the vector mid-iteration.
        let mut listeners = mem::take(&mut self.listeners);
        for event in events {
            for listener in listeners.iter_mut() {
                listener(*event);
            }
        }
        let added = mem::replace(&mut self.listeners, listeners);
        self.listeners.extend(added);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::Edge::*;
    use super::Event as E;
    use super::State::*;
    use super::*;

    fn machine_in(state: State, caller: bool) -> CallStateMachine {
        let mut fsm = CallStateMachine::new(caller);
        fsm.state = state;
        if state == Connected {
            fsm.is_media_flowing = true;
        }
        fsm
    }

    fn entries(events: &[StateEvent]) -> Vec<State> {
        events
            .iter()
            .filter(|e| e.edge == Entry)
            .map(|e| e.state)
            .collect()
    }

    const ALL_EVENTS: [E; 13] = [
        E::Initiate { listening: true },
        E::Initiate { listening: false },
        E::Answer,
        E::Approve,
        E::ReceiveLocalMedia,
        E::SentOffer,
        E::ReceiveAnswer,
        E::ReceiveRemoteMedia,
        E::Accept,
        E::Modify { receive: false },
        E::Modify { receive: true },
        E::Reject,
        E::Hangup,
    ];

    #[test]
    fn caller_happy_path() {
        let mut fsm = CallStateMachine::new(true);
        let mut seen = Vec::new();
        for event in [
            E::Initiate { listening: true },
            E::Answer,
            E::Approve,
            E::ReceiveLocalMedia,
            E::Approve,
            E::SentOffer,
            E::ReceiveAnswer,
            E::ReceiveRemoteMedia,
        ] {
            seen.extend(entries(&fsm.dispatch(event)));
        }
        assert_eq!(fsm.state(), Connected);
        assert!(fsm.is_media_flowing());
        assert_eq!(
            seen,
            vec![
                Preparing,
                ApprovingDeviceAccess,
                ApprovingContent,
                Offering,
                Connecting,
                Connected,
            ]
        );
    }

    #[test]
    fn callee_happy_path() {
        let mut fsm = CallStateMachine::new(false);
        for event in [
            E::Initiate { listening: true },
            E::Answer,
            E::Approve,
            E::ReceiveLocalMedia,
            E::Approve,
        ] {
            fsm.dispatch(event);
        }
        assert_eq!(fsm.state(), Connecting);
        fsm.dispatch(E::ReceiveRemoteMedia);
        assert_eq!(fsm.state(), Connected);
    }

    #[test]
    fn approve_before_media_stays_and_latches_approval() {
        let mut fsm = machine_in(ApprovingContent, true);
        assert!(fsm.dispatch(E::Approve).is_empty());
        assert_eq!(fsm.state(), ApprovingContent);
        assert!(fsm.has_local_media_approval());
        // Media arriving now completes the pair.
        let events = fsm.dispatch(E::ReceiveLocalMedia);
        assert_eq!(entries(&events), vec![Offering]);
    }

    #[test]
    fn initiate_without_listener_terminates() {
        let mut fsm = CallStateMachine::new(false);
        let events = fsm.dispatch(E::Initiate { listening: false });
        assert_eq!(entries(&events), vec![Terminated]);
        assert_eq!(fsm.state(), Terminated);
    }

    #[test]
    fn unlisted_events_are_dropped_silently() {
        for state in [
            Idle,
            Preparing,
            ApprovingDeviceAccess,
            ApprovingContent,
            Offering,
            Connecting,
            Connected,
            Modifying,
        ] {
            for event in ALL_EVENTS {
                let mut fsm = machine_in(state, true);
                let before = fsm.state();
                let events = fsm.dispatch(event);
                if events.is_empty() {
                    assert_eq!(fsm.state(), before, "{:?} + {:?} mutated state", state, event);
                }
            }
        }
    }

    #[test]
    fn every_transition_emits_exit_then_entry_once() {
        let mut fsm = CallStateMachine::new(true);
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        fsm.on_event(Box::new(move |event| sink.lock().unwrap().push(event)));

        fsm.dispatch(E::Initiate { listening: true });
        let seen = log.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                StateEvent {
                    state: Idle,
                    edge: Exit
                },
                StateEvent {
                    state: Preparing,
                    edge: Entry
                },
            ]
        );
    }

    #[test]
    fn stays_emit_nothing() {
        let mut fsm = machine_in(Offering, true);
        assert!(fsm.dispatch(E::SentOffer).is_empty());
        assert!(fsm.dispatch(E::ReceiveLocalMedia).is_empty());
        assert_eq!(fsm.state(), Offering);
    }

    #[test]
    fn terminated_absorbs_everything() {
        let mut fsm = machine_in(Connected, true);
        fsm.dispatch(E::Hangup);
        assert_eq!(fsm.state(), Terminated);
        for event in ALL_EVENTS {
            assert!(fsm.dispatch(event).is_empty());
            assert_eq!(fsm.state(), Terminated);
        }
    }

    #[test]
    fn answer_requires_no_media_flowing() {
        let mut fsm = machine_in(Preparing, false);
        fsm.is_media_flowing = true;
        assert!(fsm.dispatch(E::Answer).is_empty());
        assert_eq!(fsm.state(), Preparing);

        fsm.is_media_flowing = false;
        let events = fsm.dispatch(E::Answer);
        assert_eq!(entries(&events), vec![ApprovingDeviceAccess]);
    }

    #[test]
    fn reject_keeps_established_call() {
        let mut fsm = machine_in(Connected, true);
        assert!(fsm.dispatch(E::Reject).is_empty());
        assert_eq!(fsm.state(), Connected);
        assert!(fsm.is_media_flowing());
    }

    #[test]
    fn modify_initiator_round_trip() {
        let mut fsm = machine_in(Connected, true);

        let events = fsm.dispatch(E::Modify { receive: false });
        assert_eq!(entries(&events), vec![Modifying]);
        assert!(fsm.is_modifying());
        assert!(fsm.is_active());

        let events = fsm.dispatch(E::Accept);
        assert_eq!(entries(&events), vec![Preparing]);
        assert!(fsm.caller());
        assert!(!fsm.has_local_media());
        assert!(!fsm.has_local_media_approval());
        assert!(fsm.is_modifying());
    }

    #[test]
    fn modify_receive_re_prepares_as_callee() {
        let mut fsm = machine_in(Connected, true);
        let events = fsm.dispatch(E::Modify { receive: true });
        assert_eq!(entries(&events), vec![Preparing]);
        assert!(!fsm.caller());
        assert!(!fsm.has_local_media());
        assert!(!fsm.has_local_media_approval());
        assert!(fsm.is_modifying());
        // The re-prepare stopped counting media as flowing, so answer
        // is accepted again.
        let events = fsm.dispatch(E::Answer);
        assert_eq!(entries(&events), vec![ApprovingDeviceAccess]);
    }

    #[test]
    fn modify_reject_returns_to_connected() {
        let mut fsm = machine_in(Connected, true);
        fsm.dispatch(E::Modify { receive: false });
        assert!(fsm.is_modifying());
        let events = fsm.dispatch(E::Reject);
        assert_eq!(entries(&events), vec![Connected]);
        assert!(!fsm.is_modifying());
    }

    #[test]
    fn is_modifying_window_closes_on_terminated() {
        let mut fsm = machine_in(Connected, true);
        fsm.dispatch(E::Modify { receive: false });
        assert!(fsm.is_modifying());
        fsm.dispatch(E::Hangup);
        assert!(!fsm.is_modifying());
    }

    #[test]
    fn is_modifying_window_spans_re_prepare_until_connected() {
        let mut fsm = machine_in(Connected, false);
        fsm.dispatch(E::Modify { receive: true });
        for event in [
            E::Answer,
            E::Approve,
            E::ReceiveLocalMedia,
            E::Approve,
        ] {
            fsm.dispatch(event);
            assert!(fsm.is_modifying(), "window closed early at {:?}", event);
        }
        fsm.dispatch(E::ReceiveRemoteMedia);
        assert_eq!(fsm.state(), Connected);
        assert!(!fsm.is_modifying());
    }

    #[test]
    fn modify_accept_absorbed_during_re_prepare() {
        let mut fsm = machine_in(Connected, true);
        fsm.dispatch(E::Modify { receive: false });
        fsm.dispatch(E::Accept);
        assert_eq!(fsm.state(), Preparing);
        // Duplicate accept after the re-prepare is a stay.
        assert!(fsm.dispatch(E::Accept).is_empty());
        assert_eq!(fsm.state(), Preparing);
    }
}
