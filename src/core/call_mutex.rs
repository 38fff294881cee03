//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Call Mutex
///
/// Wrapper around std::sync::Mutex::lock() that on error consumes the
/// poisoned mutex and returns a simple error code.
///
use std::sync::{Mutex, MutexGuard};

use crate::common::Result;
use crate::error::RespokeError;

pub struct CallMutex<T: ?Sized> {
    /// Human readable label for the mutex
    label: &'static str,
    /// The actual mutex
    mutex: Mutex<T>,
}

impl<T> CallMutex<T> {
    /// Creates a new CallMutex
    pub fn new(t: T, label: &'static str) -> CallMutex<T> {
        CallMutex {
            mutex: Mutex::new(t),
            label,
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        match self.mutex.lock() {
            Ok(v) => Ok(v),
            Err(_) => Err(RespokeError::MutexPoisoned(self.label.to_string())),
        }
    }
}
