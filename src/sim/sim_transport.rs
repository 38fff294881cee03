//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Scripted duplex transport for tests.
//!
//! Records every outbound frame, answers each one synchronously from
//! a scripted response queue (default `200 {}`), and lets the test
//! inject pushes and transport losses.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::common::Result;
use crate::error::RespokeError;
use crate::http;
use crate::transport::{
    ConnectInfo, Frame, FrameCallback, Push, PushKind, Transport, TransportEvents,
};

struct Inner {
    connected: bool,
    connect_count: u32,
    connect_failures_remaining: u32,
    session_token: Option<String>,
    frames: Vec<Frame>,
    scripted: VecDeque<http::Response>,
    hold_responses: bool,
    held: Vec<FrameCallback>,
    events: Option<Box<dyn TransportEvents>>,
}

#[derive(Clone)]
pub struct SimTransport {
    inner: Arc<Mutex<Inner>>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                connected: false,
                connect_count: 0,
                connect_failures_remaining: 0,
                session_token: None,
                frames: Vec::new(),
                scripted: VecDeque::new(),
                hold_responses: false,
                held: Vec::new(),
                events: None,
            })),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    pub fn connect_count(&self) -> u32 {
        self.inner.lock().unwrap().connect_count
    }

    pub fn session_token(&self) -> Option<String> {
        self.inner.lock().unwrap().session_token.clone()
    }

    /// Every frame sent so far, oldest first.
    pub fn frames(&self) -> Vec<Frame> {
        self.inner.lock().unwrap().frames.clone()
    }

    /// Frames whose path starts with `path`.
    pub fn frames_for(&self, path: &str) -> Vec<Frame> {
        self.frames()
            .into_iter()
            .filter(|frame| frame.path.starts_with(path))
            .collect()
    }

    pub fn clear_frames(&self) {
        self.inner.lock().unwrap().frames.clear();
    }

    /// Queue a response for the next frame; unscripted frames get
    /// `200 {}`.
    pub fn queue_response(&self, status_code: u16, body: &str) {
        self.inner
            .lock()
            .unwrap()
            .scripted
            .push_back(http::Response {
                status_code,
                body: body.as_bytes().to_vec(),
            });
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.lock().unwrap().connect_failures_remaining = count;
    }

    /// Park responses instead of answering, leaving requests pending.
    pub fn hold_responses(&self, hold: bool) {
        self.inner.lock().unwrap().hold_responses = hold;
    }

    /// Deliver one unsolicited push, as if from the server.
    pub fn push(&self, kind: PushKind, payload: Value) {
        let events = self.inner.lock().unwrap().events.take();
        if let Some(events) = events {
            events.on_push(Push { kind, payload });
            let mut inner = self.inner.lock().unwrap();
            if inner.events.is_none() {
                inner.events = Some(events);
            }
        } else {
            panic!("push with no connected transport events");
        }
    }

    /// Kill the session from the server side.
    pub fn disconnect(&self, reason: &str) {
        let events = {
            let mut inner = self.inner.lock().unwrap();
            inner.connected = false;
            inner.held.clear();
            inner.events.take()
        };
        if let Some(events) = events {
            events.on_close(reason.to_string());
        }
    }
}

impl Transport for SimTransport {
    fn connect(
        &self,
        session_token: &str,
        events: Box<dyn TransportEvents>,
        done: Box<dyn FnOnce(Result<ConnectInfo>) + Send>,
    ) {
        let result = {
            let mut inner = self.inner.lock().unwrap();
            inner.connect_count += 1;
            if inner.connect_failures_remaining > 0 {
                inner.connect_failures_remaining -= 1;
                Err(RespokeError::Transport("connect refused".to_string()))
            } else {
                inner.connected = true;
                inner.session_token = Some(session_token.to_string());
                inner.events = Some(events);
                Ok(ConnectInfo {
                    connection_id: format!("local-conn-{}", inner.connect_count),
                })
            }
        };
        done(result);
    }

    fn send_frame(&self, frame: Frame, callback: FrameCallback) {
        let response = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.connected {
                None
            } else {
                inner.frames.push(frame);
                if inner.hold_responses {
                    inner.held.push(callback);
                    return;
                }
                Some(inner.scripted.pop_front().unwrap_or(http::Response {
                    status_code: 200,
                    body: b"{}".to_vec(),
                }))
            }
        };
        callback(response);
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.session_token = None;
        inner.events = None;
    }
}
