//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Scripted HTTP client for tests.
//!
//! Serves the token bootstrap endpoints with canned bodies and records
//! every request.

use std::sync::{Arc, Mutex};

use crate::http::{Client, Request, Response, ResponseCallback};

struct Inner {
    requests: Vec<Request>,
    overrides: Vec<(String, Response)>,
    fail_all: bool,
}

#[derive(Clone)]
pub struct SimHttpClient {
    inner: Arc<Mutex<Inner>>,
}

impl Default for SimHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHttpClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                requests: Vec::new(),
                overrides: Vec::new(),
                fail_all: false,
            })),
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.inner.lock().unwrap().requests.clone()
    }

    /// Respond to URLs containing `url_part` with the given response,
    /// taking precedence over the built-in token endpoints.
    pub fn set_response(&self, url_part: &str, status_code: u16, body: &str) {
        self.inner.lock().unwrap().overrides.push((
            url_part.to_string(),
            Response {
                status_code,
                body: body.as_bytes().to_vec(),
            },
        ));
    }

    /// Make every request fail at the transport level.
    pub fn fail_all(&self, fail: bool) {
        self.inner.lock().unwrap().fail_all = fail;
    }
}

impl Client for SimHttpClient {
    fn send_request(&self, request: Request, callback: ResponseCallback) {
        let response = {
            let mut inner = self.inner.lock().unwrap();
            let url = request.url.clone();
            inner.requests.push(request);
            if inner.fail_all {
                None
            } else if let Some((_, response)) = inner
                .overrides
                .iter()
                .find(|(part, _)| url.contains(part.as_str()))
            {
                Some(response.clone())
            } else if url.contains("/v1/session-tokens") {
                Some(Response {
                    status_code: 200,
                    body: br#"{"token":"sim-session-token"}"#.to_vec(),
                })
            } else if url.contains("/v1/tokens") {
                Some(Response {
                    status_code: 200,
                    body: br#"{"tokenId":"sim-token-id"}"#.to_vec(),
                })
            } else {
                Some(Response {
                    status_code: 200,
                    body: b"{}".to_vec(),
                })
            }
        };
        callback(response);
    }
}
