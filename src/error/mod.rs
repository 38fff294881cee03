//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Common error codes.

use thiserror::Error;

/// Platform independent error conditions.
#[derive(Clone, Debug, Error)]
pub enum RespokeError {
    // Project wide common error codes
    #[error("Mutex poisoned: {0}")]
    MutexPoisoned(String),
    #[error("Expecting non-none option value in: {0}, var: {1}")]
    OptionValueNotSet(String, String),

    // Authentication and account state
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("{0}")]
    BillingSuspension(String),
    #[error("{0}")]
    Suspension(String),

    // Signaling channel
    #[error("signaling channel is not connected")]
    Disconnected,
    #[error("request body is {size} bytes; limit is {limit}")]
    OverLimit { size: usize, limit: usize },
    #[error("rate limited after {tries} attempts: {message}")]
    RateLimited { tries: u32, message: String },
    #[error("error response, status {status}: {message}")]
    ServerError { status: u16, message: String },
    #[error("unable to parse response body: {0}")]
    ParseFailed(String),
    #[error("transport failure: {0}")]
    Transport(String),

    // Inbound signals
    #[error("malformed signal: {0}")]
    MalformedSignal(String),

    // API misuse caught before anything hits the wire
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Peer connection primitive
    #[error("peer connection failure: {0}")]
    PeerConnection(String),
}
