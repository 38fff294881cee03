//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Batch windows for membership operations.
//!
//! `join_group`, `leave_group`, and `register_presence` each
//! accumulate identifiers synchronously and flush once on the next
//! scheduler tick, so N synchronous calls become one wire RPC. Every
//! caller inside one window receives the *same* completion handle.

use std::collections::HashSet;
use std::sync::Arc;

use crate::common::Result;
use crate::core::call_mutex::CallMutex;

/// Which membership operation a batch belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "camelCase")]
pub enum BatchKind {
    JoinGroup,
    LeaveGroup,
    RegisterPresence,
}

type Waiter = Box<dyn FnOnce(Result<()>) + Send>;

struct HandleState {
    result: Option<Result<()>>,
    waiters: Vec<Waiter>,
}

/// Shared completion of one batch window.
///
/// Handle identity is observable: callers batched into the same window
/// hold the same `Arc`, comparable with [`Arc::ptr_eq`].
pub struct BatchHandle {
    state: CallMutex<HandleState>,
}

impl BatchHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: CallMutex::new(
                HandleState {
                    result: None,
                    waiters: Vec::new(),
                },
                "batch_handle",
            ),
        })
    }

    /// A handle that is already complete, for callers that never made
    /// it into a window.
    pub(crate) fn completed(result: Result<()>) -> Arc<Self> {
        let handle = Self::new();
        handle.complete(result);
        handle
    }

    /// Register a completion callback; fires immediately if the batch
    /// already completed.
    pub fn when_done(&self, waiter: Waiter) {
        let ready = match self.state.lock() {
            Ok(mut state) => match &state.result {
                Some(result) => Some(result.clone()),
                None => {
                    state.waiters.push(waiter);
                    return;
                }
            },
            Err(_) => None,
        };
        if let Some(result) = ready {
            waiter(result);
        }
    }

    /// The outcome, if the flush already happened.
    pub fn result(&self) -> Option<Result<()>> {
        self.state.lock().ok().and_then(|state| state.result.clone())
    }

    pub(crate) fn complete(&self, result: Result<()>) {
        let waiters = match self.state.lock() {
            Ok(mut state) => {
                if state.result.is_some() {
                    warn!("batch completed twice");
                    return;
                }
                state.result = Some(result.clone());
                std::mem::take(&mut state.waiters)
            }
            Err(_) => return,
        };
        for waiter in waiters {
            waiter(result.clone());
        }
    }
}

/// Accumulator for one membership operation.
pub struct Batcher {
    kind: BatchKind,
    pending: Vec<String>,
    seen: HashSet<String>,
    window: Option<Arc<BatchHandle>>,
}

impl Batcher {
    pub fn new(kind: BatchKind) -> Self {
        Self {
            kind,
            pending: Vec::new(),
            seen: HashSet::new(),
            window: None,
        }
    }

    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    /// Add identifiers to the current window, opening one if needed.
    ///
    /// Returns the window's shared handle and whether this call opened
    /// the window (the opener schedules the flush). Duplicates within
    /// a window are dropped; insertion order is preserved.
    pub fn add<I>(&mut self, ids: I) -> (Arc<BatchHandle>, bool)
    where
        I: IntoIterator<Item = String>,
    {
        let opened = self.window.is_none();
        let handle = self
            .window
            .get_or_insert_with(BatchHandle::new)
            .clone();
        for id in ids {
            if self.seen.insert(id.clone()) {
                self.pending.push(id);
            }
        }
        (handle, opened)
    }

    /// Close the window for flushing. A new window starts on the next
    /// `add`.
    pub fn take(&mut self) -> Option<(Vec<String>, Arc<BatchHandle>)> {
        let handle = self.window.take()?;
        self.seen.clear();
        Some((std::mem::take(&mut self.pending), handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_window_one_handle() {
        let mut batcher = Batcher::new(BatchKind::JoinGroup);
        let (first, opened_first) = batcher.add(vec!["g1".to_string()]);
        let (second, opened_second) = batcher.add(vec!["g2".to_string(), "g1".to_string()]);

        assert!(opened_first);
        assert!(!opened_second);
        assert!(Arc::ptr_eq(&first, &second));

        let (ids, handle) = batcher.take().unwrap();
        assert_eq!(ids, vec!["g1".to_string(), "g2".to_string()]);
        assert!(Arc::ptr_eq(&handle, &first));
    }

    #[test]
    fn take_resets_window() {
        let mut batcher = Batcher::new(BatchKind::LeaveGroup);
        let (first, _) = batcher.add(vec!["g1".to_string()]);
        batcher.take().unwrap();
        assert!(batcher.take().is_none());

        let (second, opened) = batcher.add(vec!["g1".to_string()]);
        assert!(opened);
        assert!(!Arc::ptr_eq(&first, &second));
        // The dedup set does not leak across windows.
        let (ids, _) = batcher.take().unwrap();
        assert_eq!(ids, vec!["g1".to_string()]);
    }

    #[test]
    fn handle_delivers_to_late_and_early_waiters() {
        let handle = BatchHandle::new();
        let early = Arc::new(CallMutex::new(None, "early"));
        let sink = Arc::clone(&early);
        handle.when_done(Box::new(move |result| {
            *sink.lock().unwrap() = Some(result.is_ok());
        }));

        handle.complete(Ok(()));
        assert_eq!(*early.lock().unwrap(), Some(true));
        assert!(handle.result().unwrap().is_ok());

        let late = Arc::new(CallMutex::new(None, "late"));
        let sink = Arc::clone(&late);
        handle.when_done(Box::new(move |result| {
            *sink.lock().unwrap() = Some(result.is_ok());
        }));
        assert_eq!(*late.lock().unwrap(), Some(true));
    }
}
