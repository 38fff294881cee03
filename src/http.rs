//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Make calls to the App to do HTTP requests
//! and define common types like Method, Response, Client, etc.
//!
//! HTTP is only used before the duplex session opens (token
//! acquisition and session-token exchange); everything else rides the
//! framed transport.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::Result;
use crate::error::RespokeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

pub type ResponseCallback = Box<dyn FnOnce(Option<Response>) + Send>;

/// An abstract HTTP client.
/// Rust consumers of HTTP clients should use this trait.
/// Apps should use a platform-specific Client impl.
pub trait Client: Send + Sync {
    fn send_request(&self, request: Request, callback: ResponseCallback);
}

/// Platform-specific methods that must be provided by
/// the application to create a platform-specific Client impl.
pub trait Delegate {
    /// Responses should be provided via DelegatingClient::received_response
    fn send_request(&self, request_id: u32, request: Request);
}

/// An impl of Client that calls out to a Delegate to make requests.
#[derive(Clone)]
pub struct DelegatingClient {
    delegate: Arc<Mutex<dyn Delegate + Send>>,
    response_callbacks: Arc<Mutex<ResponseCallbacks>>,
}

impl DelegatingClient {
    pub fn new(delegate: impl Delegate + Send + 'static) -> Self {
        Self {
            delegate: Arc::new(Mutex::new(delegate)),
            response_callbacks: Arc::default(),
        }
    }

    /// A None Response indicates a failure.
    pub fn received_response(&self, request_id: u32, response: Option<Response>) {
        debug!(
            "http::DelegatingClient::received_response(): request_id: {}",
            request_id
        );

        let response_callback = {
            let mut response_callbacks = self
                .response_callbacks
                .lock()
                .expect("http::DelegatingClient::response_callbacks lock");
            response_callbacks.pop(request_id)
        };
        if let Some(response_callback) = response_callback {
            response_callback(response);
        } else {
            error!(
                "http::DelegatingClient::received_response(): unknown request ID: {}",
                request_id
            );
        }
    }
}

impl Client for DelegatingClient {
    fn send_request(&self, request: Request, response_callback: ResponseCallback) {
        debug!(
            "http::DelegatingClient::send_request(): url: {} method: {}",
            request.url, request.method
        );
        let request_id = {
            let mut response_callbacks = self
                .response_callbacks
                .lock()
                .expect("http::DelegatingClient::response_callbacks lock");
            response_callbacks.push(response_callback)
        };
        let delegate = self
            .delegate
            .lock()
            .expect("http::DelegatingClient::delegate lock");
        delegate.send_request(request_id, request)
    }
}

#[derive(Default)]
struct ResponseCallbacks {
    response_callback_by_request_id: HashMap<u32, ResponseCallback>,
    next_request_id: u32,
}

impl ResponseCallbacks {
    fn push(&mut self, response_callback: ResponseCallback) -> u32 {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.response_callback_by_request_id
            .insert(request_id, response_callback);
        request_id
    }

    fn pop(&mut self, request_id: u32) -> Option<ResponseCallback> {
        self.response_callback_by_request_id.remove(&request_id)
    }
}

/// Deserialize a successful JSON response body, mapping transport
/// failure and error statuses onto the common taxonomy.
pub fn parse_json_response<T: DeserializeOwned>(response: Option<&Response>) -> Result<T> {
    let response = response.ok_or_else(|| RespokeError::Transport("no response".to_string()))?;
    if !response.is_success() {
        return Err(RespokeError::ServerError {
            status: response.status_code,
            message: String::from_utf8_lossy(&response.body).into_owned(),
        });
    }
    serde_json::from_slice(&response.body).map_err(|e| RespokeError::ParseFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Token {
        token: String,
    }

    #[test]
    fn parse_json_response_classifies() {
        let ok = Response {
            status_code: 200,
            body: br#"{"token":"abc"}"#.to_vec(),
        };
        assert_eq!(
            parse_json_response::<Token>(Some(&ok)).unwrap().token,
            "abc"
        );

        let err = Response {
            status_code: 500,
            body: b"boom".to_vec(),
        };
        assert!(matches!(
            parse_json_response::<Token>(Some(&err)),
            Err(RespokeError::ServerError { status: 500, .. })
        ));

        assert!(matches!(
            parse_json_response::<Token>(None),
            Err(RespokeError::Transport(_))
        ));

        let garbled = Response {
            status_code: 200,
            body: b"not-json".to_vec(),
        };
        assert!(matches!(
            parse_json_response::<Token>(Some(&garbled)),
            Err(RespokeError::ParseFailed(_))
        ));
    }
}
