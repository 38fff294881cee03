//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Tests for incoming calls

// Requires the 'sim' feature

mod common;

use std::sync::atomic::Ordering;

use serde_json::json;

use common::{signal_from, TestContext};
use respoke::core::call_state::State;
use respoke::sim::sim_platform::SimPlatform;

fn offer_payload(session_id: &str) -> serde_json::Value {
    signal_from(
        "alice",
        "alice-conn-1",
        session_id,
        json!({ "signalType": "offer", "sdp": "v=0 remote-offer" }),
    )
}

fn incoming_call(
    context: &TestContext,
    session_id: &str,
) -> respoke::core::call::Call<SimPlatform> {
    context.deliver_signal(offer_payload(session_id));
    context
        .with_platform(|platform| platform.call(session_id))
        .expect("offer should create a call")
}

#[test]
fn callee_happy_path() {
    let context = TestContext::connected();
    let call = incoming_call(&context, "sess-in-1");

    // The first offer parked the call in preparing, waiting on the
    // application.
    assert_eq!(call.state(), State::Preparing);
    assert!(!call.direction().is_caller());
    assert_eq!(call.remote_connection_id().as_deref(), Some("alice-conn-1"));

    call.answer().unwrap();
    call.approve().unwrap();
    call.received_local_media().unwrap();
    call.approve().unwrap();
    assert_eq!(call.state(), State::Connecting);

    // Our answer went to the caller's device.
    let answers = context.signals_of_type("answer");
    assert_eq!(answers.len(), 1);
    let answer_frame = &context.transport.frames_for("/v1/signaling")[0];
    assert_eq!(
        answer_frame.data.as_ref().unwrap()["toConnection"],
        "alice-conn-1"
    );

    call.received_remote_media().unwrap();
    assert_eq!(call.state(), State::Connected);

    // The callee announces the established call.
    assert_eq!(context.signals_of_type("connected").len(), 1);

    context.with_platform(|platform| {
        assert_eq!(
            platform.state_entries("sess-in-1"),
            vec![
                State::Preparing,
                State::ApprovingDeviceAccess,
                State::ApprovingContent,
                State::Connecting,
                State::Connected,
            ]
        );
    });
}

#[test]
fn offer_with_nobody_listening_terminates() {
    let context = TestContext::connected();
    context.with_platform_mut(|platform| platform.set_listening(false));

    context.deliver_signal(offer_payload("sess-unwanted"));

    context.with_platform(|platform| {
        assert_eq!(platform.call_count(), 0);
        assert_eq!(platform.concluded(), vec!["sess-unwanted".to_string()]);
    });
    // The caller finds out via a bye.
    assert_eq!(context.signals_of_type("bye").len(), 1);
}

#[test]
fn candidates_before_answer_are_buffered() {
    let context = TestContext::connected();
    let call = incoming_call(&context, "sess-in-2");

    context.deliver_signal(signal_from(
        "alice",
        "alice-conn-1",
        "sess-in-2",
        json!({
            "signalType": "iceCandidates",
            "candidates": [
                { "candidate": "candidate:0 1 UDP 1 10.0.0.1 1000 typ host", "sdpMLineIndex": 0 },
                { "candidate": "candidate:1 1 UDP 2 10.0.0.2 1001 typ host", "sdpMLineIndex": 0 },
            ],
        }),
    ));

    // No peer connection yet; nothing was applied.
    context.with_platform(|platform| {
        assert_eq!(platform.pc_stats().remote_candidates.load(Ordering::SeqCst), 0);
    });

    call.answer().unwrap();
    call.approve().unwrap();
    call.received_local_media().unwrap();
    call.approve().unwrap();

    // Reaching connecting created the peer connection and flushed the
    // buffer in arrival order.
    context.with_platform(|platform| {
        assert_eq!(platform.pc_stats().remote_candidates.load(Ordering::SeqCst), 2);
    });

    // Late candidates go straight through now.
    context.deliver_signal(signal_from(
        "alice",
        "alice-conn-1",
        "sess-in-2",
        json!({
            "signalType": "iceCandidates",
            "candidates": [
                { "candidate": "candidate:2 1 UDP 3 10.0.0.3 1002 typ host", "sdpMLineIndex": 0 },
            ],
        }),
    ));
    context.with_platform(|platform| {
        assert_eq!(platform.pc_stats().remote_candidates.load(Ordering::SeqCst), 3);
    });
}

#[test]
fn non_offer_for_unknown_session_is_dropped() {
    let context = TestContext::connected();

    context.deliver_signal(signal_from(
        "alice",
        "alice-conn-1",
        "sess-never-seen",
        json!({ "signalType": "bye" }),
    ));
    context.deliver_signal(signal_from(
        "alice",
        "alice-conn-1",
        "sess-never-seen",
        json!({ "signalType": "answer", "sdp": "v=0" }),
    ));

    context.with_platform(|platform| {
        assert_eq!(platform.call_count(), 0);
        assert!(platform.concluded().is_empty());
    });
}

#[test]
fn malformed_signals_are_dropped_quietly() {
    let context = TestContext::connected();

    // Missing target.
    context.deliver_signal(json!({
        "signalId": "sig-x",
        "sessionId": "sess-x",
        "signalType": "offer",
        "fromEndpoint": "alice",
        "fromConnection": "alice-conn-1",
        "sdp": "v=0",
    }));
    // Unknown signal type.
    context.deliver_signal(signal_from(
        "alice",
        "alice-conn-1",
        "sess-x",
        json!({ "signalType": "teleport" }),
    ));
    // Ack is recognised and dropped without a call.
    context.deliver_signal(signal_from(
        "alice",
        "alice-conn-1",
        "sess-x",
        json!({ "signalType": "ack" }),
    ));

    context.with_platform(|platform| {
        assert_eq!(platform.call_count(), 0);
    });
}

#[test]
fn remote_modify_waits_for_local_verdict() {
    let context = TestContext::connected();
    let call = incoming_call(&context, "sess-in-3");
    call.answer().unwrap();
    call.approve().unwrap();
    call.received_local_media().unwrap();
    call.approve().unwrap();
    call.received_remote_media().unwrap();
    assert_eq!(call.state(), State::Connected);
    context.transport.clear_frames();

    // The remote side asks to renegotiate; nothing moves until the
    // application decides.
    context.deliver_signal(signal_from(
        "alice",
        "alice-conn-1",
        "sess-in-3",
        json!({ "signalType": "modify", "action": "initiate" }),
    ));
    assert_eq!(call.state(), State::Connected);

    call.accept_modify().unwrap();
    assert_eq!(call.state(), State::Preparing);
    assert!(call.is_modifying());

    let modifies = context.signals_of_type("modify");
    assert_eq!(modifies.len(), 1);
    assert_eq!(modifies[0]["action"], "accept");
}

#[test]
fn incoming_direct_connection_reuses_one_call_per_endpoint() {
    let context = TestContext::connected();

    let mut payload = offer_payload("sess-dc-1");
    payload["target"] = json!("directConnection");
    context.deliver_signal(payload.clone());

    let first = context
        .with_platform(|platform| platform.call("sess-dc-1"))
        .expect("direct connection call");
    assert_eq!(first.state(), State::Preparing);

    // The same offer again reuses the call instead of forking a twin.
    context.deliver_signal(payload);
    context.with_platform(|platform| {
        assert_eq!(platform.call_count(), 1);
    });

    // A new session from the same endpoint replaces it.
    let mut replacement = offer_payload("sess-dc-2");
    replacement["target"] = json!("directConnection");
    context.deliver_signal(replacement);
    context.with_platform(|platform| {
        assert_eq!(platform.call_count(), 1);
        assert!(platform.call("sess-dc-2").is_some());
    });
}
