//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! A peer-to-peer data-channel session.
//!
//! A direct connection is the data-channel special case of a call: it
//! rides the same signaling and the same state machine, and is owned
//! by its [`Call`](crate::core::call::Call), which also surfaces its
//! lifecycle events. An endpoint has at most one; the client's
//! direct-connection factory reuses an existing one whose session
//! matches.

use std::fmt;

use crate::common::{EndpointId, Result, SessionId};
use crate::core::platform::DataChannel;
use crate::error::RespokeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DirectState {
    /// Signaled but no data channel yet.
    Pending,
    /// The data channel is open.
    Open,
    /// Closed; a new session is needed to talk again.
    Closed,
}

pub struct DirectConnection {
    session_id: SessionId,
    remote_endpoint: EndpointId,
    state: DirectState,
    data_channel: Option<Box<dyn DataChannel>>,
}

impl fmt::Display for DirectConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "session_id: {}, remote: {}, state: {}",
            self.session_id, self.remote_endpoint, self.state
        )
    }
}

impl fmt::Debug for DirectConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl DirectConnection {
    pub fn new(session_id: SessionId, remote_endpoint: EndpointId) -> Self {
        Self {
            session_id,
            remote_endpoint,
            state: DirectState::Pending,
            data_channel: None,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn remote_endpoint(&self) -> &EndpointId {
        &self.remote_endpoint
    }

    pub fn state(&self) -> DirectState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == DirectState::Open
    }

    /// Adopt the established data channel.
    pub fn attach(&mut self, data_channel: Box<dyn DataChannel>) {
        self.data_channel = Some(data_channel);
        self.state = DirectState::Open;
    }

    /// Send one text message.
    pub fn send(&self, message: &str) -> Result<()> {
        match (&self.data_channel, self.state) {
            (Some(data_channel), DirectState::Open) => data_channel.send(message),
            _ => Err(RespokeError::Disconnected),
        }
    }

    /// Close the data channel. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut data_channel) = self.data_channel.take() {
            data_channel.close();
        }
        self.state = DirectState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct FakeDataChannel {
        sent: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    impl DataChannel for FakeDataChannel {
        fn send(&self, _message: &str) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn lifecycle() {
        let sent = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let mut direct =
            DirectConnection::new("sess-1".to_string(), "bob".to_string());

        assert_eq!(direct.state(), DirectState::Pending);
        assert!(direct.send("too early").is_err());

        direct.attach(Box::new(FakeDataChannel {
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        }));
        assert!(direct.is_active());
        direct.send("hello").unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 1);

        direct.close();
        direct.close();
        assert_eq!(direct.state(), DirectState::Closed);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(direct.send("after close").is_err());
    }
}
