//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Manually pumped scheduler for tests.
//!
//! Time only moves when the test says so: `run_until_idle` drains the
//! ready queue, `advance` moves the clock and fires due timers in
//! order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::scheduler::{Scheduler, Task, TimerId};

#[derive(Default)]
struct Inner {
    now: Duration,
    next_timer: TimerId,
    ready: VecDeque<Task>,
    timers: BTreeMap<(Duration, TimerId), Task>,
}

#[derive(Clone, Default)]
pub struct SimScheduler {
    inner: Arc<Mutex<Inner>>,
}

impl SimScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.inner.lock().unwrap().now
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.lock().unwrap().timers.len()
    }

    /// The deadline of the next timer, if any.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner
            .lock()
            .unwrap()
            .timers
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    /// Run everything already posted, including tasks those tasks
    /// post. The clock does not move.
    pub fn run_until_idle(&self) {
        loop {
            let task = {
                let mut inner = self.inner.lock().unwrap();
                inner.ready.pop_front()
            };
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Move the clock forward, firing due timers in deadline order and
    /// draining the ready queue after each.
    pub fn advance(&self, delta: Duration) {
        let target = self.now() + delta;
        loop {
            let due = {
                let mut inner = self.inner.lock().unwrap();
                let key = inner
                    .timers
                    .keys()
                    .next()
                    .filter(|(deadline, _)| *deadline <= target)
                    .copied();
                match key {
                    Some(key) => {
                        inner.now = key.0;
                        inner.timers.remove(&key)
                    }
                    None => None,
                }
            };
            match due {
                Some(task) => {
                    task();
                    self.run_until_idle();
                }
                None => break,
            }
        }
        self.inner.lock().unwrap().now = target;
        self.run_until_idle();
    }
}

impl Scheduler for SimScheduler {
    fn post(&self, task: Task) {
        self.inner.lock().unwrap().ready.push_back(task);
    }

    fn delay(&self, delay: Duration, task: Task) -> TimerId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_timer;
        inner.next_timer += 1;
        let deadline = inner.now + delay;
        inner.timers.insert((deadline, id), task);
        id
    }

    fn cancel(&self, timer: TimerId) {
        let mut inner = self.inner.lock().unwrap();
        let key = inner
            .timers
            .keys()
            .find(|(_, id)| *id == timer)
            .copied();
        if let Some(key) = key {
            inner.timers.remove(&key);
        }
    }
}
