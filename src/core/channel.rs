//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! The signaling channel.
//!
//! One duplex session to the cloud service carries every RPC and every
//! push. This module owns that session: it multiplexes
//! request/response pairs over the framed transport, routes unsolicited
//! pushes to the client and to calls, batches membership operations
//! into single RPCs, retries rate-limited requests, and survives
//! transport loss with backoff reconnects that rejoin groups.
//!
//! The channel holds no call references. Calls live in the client's
//! index ([`Platform`]); routing looks them up per signal.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::common::scheduler::Scheduler;
use crate::common::{
    ClientConfig, ConnectionId, EndpointId, GroupId, Result, SessionId, SignalTarget,
};
use crate::core::batch::{BatchHandle, BatchKind, Batcher};
use crate::core::call_mutex::CallMutex;
use crate::core::platform::{ClientEvent, Platform};
use crate::core::signaling::{
    parse_received, IceCandidate, ModifyAction, ReceivedSignal, SignalBody, SignalType,
    SignalingMessage,
};
use crate::core::util;
use crate::error::RespokeError;
use crate::http;
use crate::transport::{ConnectInfo, Frame, Push, PushKind, Transport, TransportEvents};

/// Statuses whose bodies resolve to the caller rather than erroring.
/// 401 is further inspected for account suspension first.
const RESOLVED_STATUSES: [u16; 8] = [200, 204, 205, 302, 401, 403, 404, 418];

/// Total send attempts for a rate-limited request, first try included.
const MAX_RATE_LIMIT_ATTEMPTS: u32 = 4;

const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_secs(1);

const APP_TOKEN_HEADER: &str = "App-Token";
const SDK_HEADER: &str = "Respoke-SDK";

fn sdk_header_value() -> String {
    format!("Respoke-Rust/{}", env!("CARGO_PKG_VERSION"))
}

pub type RpcResult = Result<Value>;
pub type RpcDone = Box<dyn FnOnce(RpcResult) + Send>;

/// An RPC completion that only logs failures. For fire-and-forget
/// sends where nothing upstream waits.
pub fn log_failures(context: &'static str) -> RpcDone {
    Box::new(move |result| {
        if let Err(e) = result {
            error!("{} failed: {}", context, e);
        }
    })
}

/// How `open` authenticates.
#[derive(Clone, Debug)]
pub enum Authenticate {
    /// A token the application already obtained out of band.
    TokenId(String),
    /// Development mode: mint a token via `POST /v1/tokens` using the
    /// configured app id and endpoint id.
    Development { ttl: Duration },
}

/// Addressing for one outbound signal.
#[derive(Clone, Debug)]
pub struct SignalParams {
    pub recipient: EndpointId,
    pub connection_id: Option<ConnectionId>,
    pub session_id: SessionId,
    pub target: SignalTarget,
    pub cc_self: bool,
    pub to_original: Option<EndpointId>,
    pub caller_id: Option<String>,
    pub metadata: Option<Value>,
}

impl SignalParams {
    pub fn new(recipient: EndpointId, session_id: SessionId, target: SignalTarget) -> Self {
        Self {
            recipient,
            connection_id: None,
            session_id,
            target,
            cc_self: false,
            to_original: None,
            caller_id: None,
            metadata: None,
        }
    }
}

/// An application text message.
#[derive(Clone, Debug)]
pub struct MessageParams {
    pub recipient: EndpointId,
    pub message: String,
    pub connection_id: Option<ConnectionId>,
    pub cc_self: bool,
    pub push: bool,
}

impl MessageParams {
    pub fn new(recipient: EndpointId, message: String) -> Self {
        Self {
            recipient,
            message,
            connection_id: None,
            cc_self: true,
            push: false,
        }
    }
}

/// Ephemeral ICE servers from `GET /v1/turn`.
#[derive(Clone, Debug, Deserialize)]
pub struct TurnCredentials {
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// A group member row from `GET /v1/channels/{id}/subscribers/`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub endpoint_id: EndpointId,
    pub connection_id: ConnectionId,
}

struct PendingRequest {
    method: http::Method,
    path: String,
    data: Option<Value>,
    tries: u32,
    started_at: Instant,
    timeout_timer: Option<u64>,
    callback: Option<RpcDone>,
}

#[derive(Default)]
struct PendingRequests {
    by_id: HashMap<u64, PendingRequest>,
    next_id: u64,
}

impl PendingRequests {
    fn insert(&mut self, request: PendingRequest) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.by_id.insert(id, request);
        id
    }
}

struct ChannelState {
    connected: bool,
    closing: bool,
    session_token: Option<String>,
    endpoint_id: EndpointId,
    connection_id: Option<ConnectionId>,
    auth: Option<Authenticate>,
}

struct MembershipBatches {
    join: Batcher,
    leave: Batcher,
    presence: Batcher,
    /// Endpoints whose presence we already observe; suppresses
    /// duplicate subscriptions across windows.
    registered: HashSet<EndpointId>,
}

struct ReconnectState {
    enabled: bool,
    backoff: Duration,
    scheduled: bool,
    attempt_in_flight: bool,
}

/// The signaling channel. Clone-able handle; clones share state.
pub struct SignalingChannel<T>
where
    T: Platform,
{
    platform: Arc<CallMutex<T>>,
    http: Arc<dyn http::Client>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    config: Arc<ClientConfig>,
    state: Arc<CallMutex<ChannelState>>,
    pending: Arc<CallMutex<PendingRequests>>,
    batches: Arc<CallMutex<MembershipBatches>>,
    reconnect: Arc<CallMutex<ReconnectState>>,
}

impl<T> Clone for SignalingChannel<T>
where
    T: Platform,
{
    fn clone(&self) -> Self {
        Self {
            platform: Arc::clone(&self.platform),
            http: Arc::clone(&self.http),
            transport: Arc::clone(&self.transport),
            scheduler: Arc::clone(&self.scheduler),
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
            pending: Arc::clone(&self.pending),
            batches: Arc::clone(&self.batches),
            reconnect: Arc::clone(&self.reconnect),
        }
    }
}

impl<T> fmt::Display for SignalingChannel<T>
where
    T: Platform,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let connected = self
            .state
            .lock()
            .map(|s| s.connected)
            .unwrap_or(false);
        write!(f, "SignalingChannel(connected: {})", connected)
    }
}

impl<T> fmt::Debug for SignalingChannel<T>
where
    T: Platform,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

struct ChannelEvents<T>
where
    T: Platform,
{
    channel: SignalingChannel<T>,
}

impl<T> TransportEvents for ChannelEvents<T>
where
    T: Platform,
{
    fn on_push(&self, push: Push) {
        self.channel.handle_push(push);
    }

    fn on_close(&self, reason: String) {
        self.channel.handle_transport_close(reason);
    }
}

impl<T> SignalingChannel<T>
where
    T: Platform,
{
    pub fn new(
        platform: T,
        http: Arc<dyn http::Client>,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        config: ClientConfig,
    ) -> Self {
        let endpoint_id = config.endpoint_id.clone().unwrap_or_default();
        let backoff = config.reconnect_backoff_floor;
        Self {
            platform: Arc::new(CallMutex::new(platform, "platform")),
            http,
            transport,
            scheduler,
            config: Arc::new(config),
            state: Arc::new(CallMutex::new(
                ChannelState {
                    connected: false,
                    closing: false,
                    session_token: None,
                    endpoint_id,
                    connection_id: None,
                    auth: None,
                },
                "channel_state",
            )),
            pending: Arc::new(CallMutex::new(PendingRequests::default(), "pending_requests")),
            batches: Arc::new(CallMutex::new(
                MembershipBatches {
                    join: Batcher::new(BatchKind::JoinGroup),
                    leave: Batcher::new(BatchKind::LeaveGroup),
                    presence: Batcher::new(BatchKind::RegisterPresence),
                    registered: HashSet::new(),
                },
                "membership_batches",
            )),
            reconnect: Arc::new(CallMutex::new(
                ReconnectState {
                    enabled: true,
                    backoff,
                    scheduled: false,
                    attempt_in_flight: false,
                },
                "reconnect_state",
            )),
        }
    }

    pub fn platform(&self) -> Arc<CallMutex<T>> {
        Arc::clone(&self.platform)
    }

    /// Run a task on the next scheduler tick.
    pub(crate) fn post(&self, task: crate::common::scheduler::Task) {
        self.scheduler.post(task);
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().map(|s| s.connected).unwrap_or(false)
    }

    /// Local identity for outbound signal envelopes. Errors until the
    /// session is open.
    pub fn local_identity(&self) -> Result<(EndpointId, ConnectionId)> {
        let state = self.state.lock()?;
        match (&state.connection_id, state.connected) {
            (Some(connection_id), true) => Ok((state.endpoint_id.clone(), connection_id.clone())),
            _ => Err(RespokeError::Disconnected),
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Session lifecycle
    ////////////////////////////////////////////////////////////////////////

    /// Authenticate over HTTP, obtain a session token, and open the
    /// duplex session.
    pub fn open(&self, auth: Authenticate, done: Box<dyn FnOnce(Result<()>) + Send>) {
        info!("API:open():");
        if let Ok(mut state) = self.state.lock() {
            state.closing = false;
            state.auth = Some(auth.clone());
        }
        let channel = self.clone();
        self.acquire_session_token(
            auth,
            Box::new(move |token| match token {
                Ok(token) => channel.connect_transport(token, done),
                Err(e) => done(Err(e)),
            }),
        );
    }

    /// Best-effort deregister, invalidate the session token, and close
    /// the transport. No reconnect follows.
    pub fn close(&self) {
        info!("API:close():");
        let was_connected = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let was = state.connected;
            state.closing = true;
            was
        };
        if let Ok(mut reconnect) = self.reconnect.lock() {
            reconnect.enabled = false;
        }
        if was_connected {
            self.request(
                http::Method::Delete,
                "/v1/connections".to_string(),
                None,
                log_failures("deregister connection"),
            );
            self.request(
                http::Method::Delete,
                "/v1/session-tokens".to_string(),
                None,
                log_failures("invalidate session token"),
            );
        }
        if let Ok(mut state) = self.state.lock() {
            state.connected = false;
            state.session_token = None;
            state.connection_id = None;
        }
        self.transport.close();
    }

    fn acquire_session_token(
        &self,
        auth: Authenticate,
        done: Box<dyn FnOnce(Result<String>) + Send>,
    ) {
        match auth {
            Authenticate::TokenId(token_id) => self.exchange_session_token(token_id, done),
            Authenticate::Development { ttl } => {
                if !self.config.dev_mode {
                    return done(Err(RespokeError::Auth(
                        "development authentication requires dev_mode".to_string(),
                    )));
                }
                let (Some(app_id), Some(endpoint_id)) =
                    (self.config.app_id.clone(), self.config.endpoint_id.clone())
                else {
                    return done(Err(RespokeError::Auth(
                        "development authentication requires app_id and endpoint_id".to_string(),
                    )));
                };

                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct TokenIdResponse {
                    token_id: String,
                }

                let channel = self.clone();
                self.http.send_request(
                    http::Request {
                        method: http::Method::Post,
                        url: format!("{}/v1/tokens", self.config.base_url),
                        headers: HashMap::new(),
                        body: Some(
                            json!({
                                "appId": app_id,
                                "endpointId": endpoint_id,
                                "ttl": ttl.as_secs(),
                            })
                            .to_string()
                            .into_bytes(),
                        ),
                    },
                    Box::new(move |response| {
                        match http::parse_json_response::<TokenIdResponse>(response.as_ref()) {
                            Ok(parsed) => {
                                channel.exchange_session_token(parsed.token_id, done)
                            }
                            Err(e) => done(Err(auth_error(e))),
                        }
                    }),
                );
            }
        }
    }

    fn exchange_session_token(
        &self,
        token_id: String,
        done: Box<dyn FnOnce(Result<String>) + Send>,
    ) {
        #[derive(Deserialize)]
        struct SessionTokenResponse {
            token: String,
        }

        let state = Arc::clone(&self.state);
        self.http.send_request(
            http::Request {
                method: http::Method::Post,
                url: format!("{}/v1/session-tokens", self.config.base_url),
                headers: HashMap::new(),
                body: Some(json!({ "tokenId": token_id }).to_string().into_bytes()),
            },
            Box::new(move |response| {
                match http::parse_json_response::<SessionTokenResponse>(response.as_ref()) {
                    Ok(parsed) => {
                        if let Ok(mut state) = state.lock() {
                            state.session_token = Some(parsed.token.clone());
                        }
                        done(Ok(parsed.token))
                    }
                    Err(e) => done(Err(auth_error(e))),
                }
            }),
        );
    }

    fn connect_transport(&self, token: String, done: Box<dyn FnOnce(Result<()>) + Send>) {
        let channel = self.clone();
        let events = Box::new(ChannelEvents {
            channel: self.clone(),
        });
        self.transport.connect(
            &token,
            events,
            Box::new(move |result| match result {
                Ok(info) => {
                    channel.mark_connected(info);
                    done(Ok(()))
                }
                Err(e) => done(Err(e)),
            }),
        );
    }

    fn mark_connected(&self, info: ConnectInfo) {
        if let Ok(mut state) = self.state.lock() {
            state.connected = true;
            state.connection_id = Some(info.connection_id);
        }
        if let Ok(mut reconnect) = self.reconnect.lock() {
            reconnect.backoff = self.config.reconnect_backoff_floor;
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Request/response multiplexing
    ////////////////////////////////////////////////////////////////////////

    /// Submit one RPC over the duplex session. `done` fires exactly
    /// once.
    pub fn request(
        &self,
        method: http::Method,
        path: String,
        params: Option<Value>,
        done: RpcDone,
    ) {
        if !self.is_connected() {
            return done(Err(RespokeError::Disconnected));
        }

        // GET and DELETE carry their parameters in the query string;
        // POST and PUT carry a body subject to the size limit.
        let (path, data) = match method {
            http::Method::Get | http::Method::Delete => {
                let path = match &params {
                    Some(params) => util::with_query(&path, params),
                    None => path,
                };
                (path, None)
            }
            http::Method::Post | http::Method::Put => {
                if let Some(body) = &params {
                    let size = util::body_size(body);
                    if size > util::BODY_SIZE_LIMIT {
                        return done(Err(RespokeError::OverLimit {
                            size,
                            limit: util::BODY_SIZE_LIMIT,
                        }));
                    }
                }
                (path, params)
            }
        };

        let id = match self.pending.lock() {
            Ok(mut pending) => pending.insert(PendingRequest {
                method,
                path,
                data,
                tries: 0,
                started_at: Instant::now(),
                timeout_timer: None,
                callback: Some(done),
            }),
            Err(e) => return done(Err(e)),
        };

        let channel = self.clone();
        let timer = self.scheduler.delay(
            self.config.connect_timeout,
            Box::new(move || {
                channel.complete_request(
                    id,
                    Err(RespokeError::Transport("request timed out".to_string())),
                )
            }),
        );
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(request) = pending.by_id.get_mut(&id) {
                request.timeout_timer = Some(timer);
            } else {
                // Completed before we stored the timer.
                self.scheduler.cancel(timer);
            }
        }

        self.submit_attempt(id);
    }

    fn submit_attempt(&self, id: u64) {
        let frame = {
            let Ok(mut pending) = self.pending.lock() else {
                return;
            };
            let Some(request) = pending.by_id.get_mut(&id) else {
                return;
            };
            request.tries += 1;
            Frame {
                method: request.method,
                path: request.path.clone(),
                headers: self.frame_headers(),
                data: request.data.clone(),
            }
        };
        let channel = self.clone();
        self.transport
            .send_frame(frame, Box::new(move |response| {
                channel.handle_rpc_response(id, response)
            }));
    }

    fn frame_headers(&self) -> HashMap<String, String> {
        let token = self
            .state
            .lock()
            .ok()
            .and_then(|s| s.session_token.clone())
            .unwrap_or_default();
        HashMap::from([
            (APP_TOKEN_HEADER.to_string(), token),
            (SDK_HEADER.to_string(), sdk_header_value()),
        ])
    }

    fn handle_rpc_response(&self, id: u64, response: Option<http::Response>) {
        let Some(response) = response else {
            return self.complete_request(
                id,
                Err(RespokeError::Transport("request failed".to_string())),
            );
        };

        let status = response.status_code;
        let parsed: Option<Value> = if response.body.is_empty() {
            Some(Value::Null)
        } else {
            serde_json::from_slice(&response.body).ok()
        };

        if status == 429 {
            let tries = self
                .pending
                .lock()
                .ok()
                .and_then(|p| p.by_id.get(&id).map(|r| r.tries))
                .unwrap_or(MAX_RATE_LIMIT_ATTEMPTS);
            if tries < MAX_RATE_LIMIT_ATTEMPTS {
                debug!("request {} rate limited; retry {} scheduled", id, tries + 1);
                let channel = self.clone();
                self.scheduler.delay(
                    RATE_LIMIT_RETRY_DELAY,
                    Box::new(move || channel.submit_attempt(id)),
                );
            } else {
                let message = error_message(parsed.as_ref(), status);
                self.complete_request(id, Err(RespokeError::RateLimited { tries, message }));
            }
            return;
        }

        if status == 401 {
            if let Some(error) = parsed.as_ref().and_then(classify_suspension) {
                return self.complete_request(id, Err(error));
            }
        }

        if RESOLVED_STATUSES.contains(&status) {
            return match parsed {
                Some(body) => self.complete_request(id, Ok(body)),
                None => self.complete_request(
                    id,
                    Err(RespokeError::ParseFailed(format!(
                        "unparsable body with status {}",
                        status
                    ))),
                ),
            };
        }

        let message = error_message(parsed.as_ref(), status);
        self.complete_request(id, Err(RespokeError::ServerError { status, message }));
    }

    fn complete_request(&self, id: u64, result: RpcResult) {
        let request = {
            let Ok(mut pending) = self.pending.lock() else {
                return;
            };
            pending.by_id.remove(&id)
        };
        let Some(mut request) = request else {
            // Already completed (late timeout or duplicate response).
            return;
        };
        if let Some(timer) = request.timeout_timer.take() {
            self.scheduler.cancel(timer);
        }
        debug!(
            "request {} {} finished in {:?} after {} tries",
            request.method,
            request.path,
            request.started_at.elapsed(),
            request.tries
        );
        if let Some(callback) = request.callback.take() {
            callback(result);
        }
    }

    fn fail_all_pending(&self, error: RespokeError) {
        let drained: Vec<PendingRequest> = match self.pending.lock() {
            Ok(mut pending) => pending.by_id.drain().map(|(_, r)| r).collect(),
            Err(_) => return,
        };
        for mut request in drained {
            if let Some(timer) = request.timeout_timer.take() {
                self.scheduler.cancel(timer);
            }
            if let Some(callback) = request.callback.take() {
                callback(Err(error.clone()));
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Reconnection
    ////////////////////////////////////////////////////////////////////////

    fn handle_transport_close(&self, reason: String) {
        info!("transport closed: {}", reason);
        let closing = {
            match self.state.lock() {
                Ok(mut state) => {
                    state.connected = false;
                    state.connection_id = None;
                    state.closing
                }
                Err(_) => true,
            }
        };

        self.fail_all_pending(RespokeError::Disconnected);

        if closing {
            return;
        }

        self.notify_client(ClientEvent::Disconnect { reason });

        if self.config.reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let delay = {
            let Ok(mut reconnect) = self.reconnect.lock() else {
                return;
            };
            if !reconnect.enabled || reconnect.scheduled || reconnect.attempt_in_flight {
                return;
            }
            reconnect.scheduled = true;
            let delay = reconnect.backoff;
            reconnect.backoff = (reconnect.backoff * 2).min(self.config.reconnect_backoff_cap);
            delay
        };
        info!("scheduling reconnect in {:?}", delay);
        let channel = self.clone();
        self.scheduler
            .delay(delay, Box::new(move || channel.begin_reconnect()));
    }

    fn begin_reconnect(&self) {
        // Single-flight: exactly one attempt runs at a time, and the
        // flag is cleared on every exit path below.
        {
            let Ok(mut reconnect) = self.reconnect.lock() else {
                return;
            };
            reconnect.scheduled = false;
            if !reconnect.enabled || reconnect.attempt_in_flight {
                return;
            }
            reconnect.attempt_in_flight = true;
        }

        let auth = self.state.lock().ok().and_then(|s| s.auth.clone());
        let Some(auth) = auth else {
            self.finish_reconnect_attempt(Err(RespokeError::Auth(
                "no stored credentials to reconnect with".to_string(),
            )));
            return;
        };

        info!("reconnect: re-authenticating");
        let channel = self.clone();
        self.acquire_session_token(
            auth,
            Box::new(move |token| match token {
                Ok(token) => {
                    let inner = channel.clone();
                    channel.connect_transport(
                        token,
                        Box::new(move |result| inner.finish_reconnect_attempt(result)),
                    );
                }
                Err(e) => channel.finish_reconnect_attempt(Err(e)),
            }),
        );
    }

    fn finish_reconnect_attempt(&self, result: Result<()>) {
        if let Ok(mut reconnect) = self.reconnect.lock() {
            reconnect.attempt_in_flight = false;
        }
        match result {
            Ok(()) => self.rejoin_groups(),
            Err(e) => {
                warn!("reconnect attempt failed: {}", e);
                self.schedule_reconnect();
            }
        }
    }

    /// After a successful reconnect, rejoin everything the client had
    /// joined. A rejoin failure sends us back into the retry loop.
    fn rejoin_groups(&self) {
        let groups = match self.platform.lock() {
            Ok(platform) => platform.joined_groups(),
            Err(_) => Vec::new(),
        };
        if groups.is_empty() {
            self.notify_client(ClientEvent::Reconnect);
            return;
        }
        info!("reconnect: rejoining {} group(s)", groups.len());
        let channel = self.clone();
        self.join_group(groups).when_done(Box::new(move |result| {
            match result {
                Ok(()) => channel.notify_client(ClientEvent::Reconnect),
                Err(e) => {
                    warn!("reconnect: group rejoin failed: {}", e);
                    channel.schedule_reconnect();
                }
            }
        }));
    }

    ////////////////////////////////////////////////////////////////////////
    // Batched membership operations
    ////////////////////////////////////////////////////////////////////////

    /// Join groups. Synchronous calls in one tick share one RPC and
    /// one completion handle.
    pub fn join_group(&self, groups: Vec<GroupId>) -> Arc<BatchHandle> {
        self.batched(BatchKind::JoinGroup, groups)
    }

    /// Leave groups; batched like [`join_group`](Self::join_group).
    pub fn leave_group(&self, groups: Vec<GroupId>) -> Arc<BatchHandle> {
        self.batched(BatchKind::LeaveGroup, groups)
    }

    /// Subscribe to presence for endpoints. Endpoints already
    /// registered in an earlier, successful flush are omitted.
    pub fn register_presence(&self, endpoints: Vec<EndpointId>) -> Arc<BatchHandle> {
        let fresh = match self.batches.lock() {
            Ok(batches) => endpoints
                .into_iter()
                .filter(|endpoint| !batches.registered.contains(endpoint))
                .collect(),
            Err(_) => Vec::new(),
        };
        self.batched(BatchKind::RegisterPresence, fresh)
    }

    fn batched(&self, kind: BatchKind, ids: Vec<String>) -> Arc<BatchHandle> {
        let (handle, opened) = match self.batches.lock() {
            Ok(mut batches) => batches.batcher_mut(kind).add(ids),
            Err(e) => return BatchHandle::completed(Err(e)),
        };
        if opened {
            let channel = self.clone();
            self.scheduler
                .post(Box::new(move || channel.flush_batch(kind)));
        }
        handle
    }

    fn flush_batch(&self, kind: BatchKind) {
        let taken = match self.batches.lock() {
            Ok(mut batches) => batches.batcher_mut(kind).take(),
            Err(_) => None,
        };
        let Some((ids, handle)) = taken else {
            return;
        };
        if ids.is_empty() {
            handle.complete(Ok(()));
            return;
        }

        let (method, path, params) = match kind {
            BatchKind::JoinGroup => (
                http::Method::Post,
                "/v1/groups/",
                json!({ "groups": ids }),
            ),
            BatchKind::LeaveGroup => (
                http::Method::Delete,
                "/v1/groups/",
                json!({ "groups": ids }),
            ),
            BatchKind::RegisterPresence => (
                http::Method::Post,
                "/v1/presenceobservers",
                json!({ "endpointList": ids }),
            ),
        };

        let channel = self.clone();
        let flushed = ids;
        self.request(
            method,
            path.to_string(),
            Some(params),
            Box::new(move |result| match result {
                Ok(_) => {
                    if kind == BatchKind::RegisterPresence {
                        if let Ok(mut batches) = channel.batches.lock() {
                            batches.registered.extend(flushed);
                        }
                    }
                    handle.complete(Ok(()));
                }
                Err(e) => handle.complete(Err(e)),
            }),
        );
    }

    ////////////////////////////////////////////////////////////////////////
    // Signals and messages
    ////////////////////////////////////////////////////////////////////////

    /// Build a [`SignalingMessage`] with a fresh `signalId` and submit
    /// it. `done` resolves on the server ack.
    pub fn send_signal(&self, params: SignalParams, body: SignalBody, done: RpcDone) {
        let (from_endpoint, from_connection) = match self.local_identity() {
            Ok(identity) => identity,
            Err(e) => return done(Err(e)),
        };

        let message = SignalingMessage {
            signal_id: uuid::Uuid::new_v4().to_string(),
            session_id: params.session_id,
            target: params.target,
            from_endpoint,
            from_connection,
            to_original: params.to_original,
            caller_id: params.caller_id,
            metadata: params.metadata,
            body,
        };
        debug!("send_signal(): {}", message);

        let signal = match message.to_wire_string() {
            Ok(signal) => signal,
            Err(e) => return done(Err(e)),
        };

        let mut data = json!({
            "signal": signal,
            "to": params.recipient,
            "toType": params.target,
            "ccSelf": params.cc_self,
        });
        if let Some(connection_id) = params.connection_id {
            data["toConnection"] = Value::String(connection_id);
        }

        self.request(http::Method::Post, "/v1/signaling".to_string(), Some(data), done);
    }

    /// Send a session description. Only `offer` and `answer` are
    /// session descriptions.
    pub fn send_sdp(
        &self,
        params: SignalParams,
        signal_type: SignalType,
        sdp: String,
        done: RpcDone,
    ) {
        let body = match signal_type {
            SignalType::Offer => SignalBody::Offer { sdp },
            SignalType::Answer => SignalBody::Answer { sdp },
            other => {
                return done(Err(RespokeError::InvalidArgument(format!(
                    "send_sdp cannot send {}",
                    other
                ))))
            }
        };
        self.send_signal(params, body, done);
    }

    pub fn send_candidates(
        &self,
        params: SignalParams,
        candidates: Vec<IceCandidate>,
        done: RpcDone,
    ) {
        if candidates.is_empty() {
            return done(Err(RespokeError::InvalidArgument(
                "no candidates to send".to_string(),
            )));
        }
        self.send_signal(params, SignalBody::IceCandidates { candidates }, done);
    }

    pub fn send_connected(&self, params: SignalParams, done: RpcDone) {
        self.send_signal(params, SignalBody::Connected, done);
    }

    pub fn send_hangup(&self, params: SignalParams, reason: Option<String>, done: RpcDone) {
        self.send_signal(params, SignalBody::Bye { reason }, done);
    }

    pub fn send_modify(&self, params: SignalParams, action: ModifyAction, done: RpcDone) {
        self.send_signal(params, SignalBody::Modify { action }, done);
    }

    /// Application text message to an endpoint.
    pub fn send_message(&self, params: MessageParams, done: RpcDone) {
        let mut data = json!({
            "to": params.recipient,
            "message": params.message,
            "ccSelf": params.cc_self,
            "push": params.push,
        });
        if let Some(connection_id) = params.connection_id {
            data["toConnection"] = Value::String(connection_id);
        }
        self.request(http::Method::Post, "/v1/messages".to_string(), Some(data), done);
    }

    ////////////////////////////////////////////////////////////////////////
    // Thin service wrappers
    ////////////////////////////////////////////////////////////////////////

    pub fn get_turn_credentials(
        &self,
        done: Box<dyn FnOnce(Result<TurnCredentials>) + Send>,
    ) {
        self.request(
            http::Method::Get,
            "/v1/turn".to_string(),
            Some(json!({ "service": "turn" })),
            Box::new(move |result| {
                done(result.and_then(|body| {
                    serde_json::from_value(body)
                        .map_err(|e| RespokeError::ParseFailed(e.to_string()))
                }))
            }),
        );
    }

    pub fn set_presence(&self, presence: Value, done: RpcDone) {
        self.request(
            http::Method::Post,
            "/v1/presence".to_string(),
            Some(json!({ "presence": presence })),
            done,
        );
    }

    pub fn get_group_members(
        &self,
        group: &GroupId,
        done: Box<dyn FnOnce(Result<Vec<GroupMember>>) + Send>,
    ) {
        let path = util::expand_path("/v1/channels/{id}/subscribers/", &[("id", group.as_str())]);
        self.request(
            http::Method::Get,
            path,
            None,
            Box::new(move |result| {
                done(result.and_then(|body| {
                    serde_json::from_value(body)
                        .map_err(|e| RespokeError::ParseFailed(e.to_string()))
                }))
            }),
        );
    }

    pub fn publish_to_group(&self, group: &GroupId, message: String, done: RpcDone) {
        let path = util::expand_path("/v1/channels/{id}/publish/", &[("id", group.as_str())]);
        self.request(
            http::Method::Post,
            path,
            Some(json!({ "message": message })),
            done,
        );
    }

    pub fn get_group_history(&self, group: &GroupId, limit: Option<u32>, done: RpcDone) {
        let path = util::expand_path("/v1/groups/{group}/history", &[("group", group.as_str())]);
        let params = limit.map(|limit| json!({ "limit": limit }));
        self.request(http::Method::Get, path, params, done);
    }

    pub fn get_conference(&self, conference_id: &str, done: RpcDone) {
        let path = util::expand_path("/v1/conferences/{id}", &[("id", conference_id)]);
        self.request(http::Method::Get, path, None, done);
    }

    /// Remove a participant from a conference, or end the whole
    /// conference when no endpoint is named.
    pub fn remove_conference_participant(
        &self,
        conference_id: &str,
        endpoint_id: Option<&str>,
        done: RpcDone,
    ) {
        let path = match endpoint_id {
            Some(endpoint_id) => util::expand_path(
                "/v1/conferences/{id}/participants/{endpointId}",
                &[("id", conference_id), ("endpointId", endpoint_id)],
            ),
            None => util::expand_path("/v1/conferences/{id}", &[("id", conference_id)]),
        };
        self.request(http::Method::Delete, path, None, done);
    }

    /// Upload a call debug report, if the config allows it.
    pub fn send_call_debug_report(&self, report: Value, done: RpcDone) {
        if !self.config.enable_call_debugs {
            debug!("call debug reporting disabled; dropping report");
            return done(Ok(Value::Null));
        }
        self.request(
            http::Method::Post,
            "/v1/call-debugs".to_string(),
            Some(report),
            done,
        );
    }

    ////////////////////////////////////////////////////////////////////////
    // Inbound routing
    ////////////////////////////////////////////////////////////////////////

    fn handle_push(&self, push: Push) {
        match push.kind {
            PushKind::Signal => match parse_received(&push.payload) {
                Ok(signal) => {
                    if let Err(e) = self.route_signal(signal) {
                        error!("routing signal failed: {}", e);
                    }
                }
                Err(e) => error!("dropping inbound signal: {}", e),
            },
            PushKind::Message => self.handle_message_push(&push.payload),
            PushKind::Presence => self.handle_presence_push(&push.payload),
            PushKind::Join => self.handle_membership_push(&push.payload, true),
            PushKind::Leave => self.handle_membership_push(&push.payload, false),
            PushKind::Pubsub => self.handle_pubsub_push(&push.payload),
        }
    }

    /// Dispatch one validated inbound signal to its call.
    pub fn route_signal(&self, signal: ReceivedSignal) -> Result<()> {
        debug!("route_signal(): {}", signal);

        // Transport-level acks carry no call state.
        if let SignalBody::Ack { .. } = signal.body {
            return Ok(());
        }

        let existing = {
            let mut platform = self.platform.lock()?;
            platform.call_for_session(&signal.session_id, signal.target)
        };

        let call = match existing {
            Some(call) => {
                if call.session_id() != signal.session_id {
                    warn!(
                        "dropping orphaned signal for session {} (call is {})",
                        signal.session_id,
                        call.session_id()
                    );
                    return Ok(());
                }
                call
            }
            None => {
                if !matches!(signal.body, SignalBody::Offer { .. }) {
                    debug!(
                        "dropping {} for unknown session {}",
                        signal.body, signal.session_id
                    );
                    return Ok(());
                }
                let mut platform = self.platform.lock()?;
                if signal.target == SignalTarget::DirectConnection {
                    platform.direct_connection_call(self, &signal)?
                } else {
                    platform.create_incoming_call(self, &signal)?
                }
            }
        };

        // Losing-fork rule: once the caller picked a winning callee
        // connection, byes from the other forks must not tear the
        // call down.
        if let SignalBody::Bye { .. } = signal.body {
            if call.direction().is_caller() {
                if let Some(winner) = call.remote_connection_id() {
                    if winner != signal.from_connection {
                        info!(
                            "dropping bye from losing fork {} (winner {})",
                            signal.from_connection, winner
                        );
                        return Ok(());
                    }
                }
            }
        }

        call.inject_signal(signal)
    }

    fn notify_client(&self, event: ClientEvent) {
        if let Ok(mut platform) = self.platform.lock() {
            platform.on_client_event(event);
        }
    }

    fn handle_message_push(&self, payload: &Value) {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct MessagePush {
            from: EndpointId,
            #[serde(default)]
            from_connection: Option<ConnectionId>,
            message: String,
        }
        match serde_json::from_value::<MessagePush>(payload.clone()) {
            Ok(push) => self.notify_client(ClientEvent::Message {
                from: push.from,
                from_connection: push.from_connection,
                message: push.message,
            }),
            Err(e) => warn!("dropping malformed message push: {}", e),
        }
    }

    fn handle_presence_push(&self, payload: &Value) {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PresencePush {
            from: EndpointId,
            from_connection: ConnectionId,
            #[serde(default)]
            presence: Value,
        }
        match serde_json::from_value::<PresencePush>(payload.clone()) {
            Ok(push) => self.notify_client(ClientEvent::Presence {
                endpoint: push.from,
                connection: push.from_connection,
                presence: push.presence,
            }),
            Err(e) => warn!("dropping malformed presence push: {}", e),
        }
    }

    fn handle_membership_push(&self, payload: &Value, joined: bool) {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct MembershipPush {
            group: GroupId,
            endpoint_id: EndpointId,
            connection_id: ConnectionId,
        }
        match serde_json::from_value::<MembershipPush>(payload.clone()) {
            Ok(push) => {
                let event = if joined {
                    ClientEvent::GroupJoin {
                        group: push.group,
                        endpoint: push.endpoint_id,
                        connection: push.connection_id,
                    }
                } else {
                    ClientEvent::GroupLeave {
                        group: push.group,
                        endpoint: push.endpoint_id,
                        connection: push.connection_id,
                    }
                };
                self.notify_client(event);
            }
            Err(e) => warn!("dropping malformed membership push: {}", e),
        }
    }

    fn handle_pubsub_push(&self, payload: &Value) {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PubsubPush {
            group: GroupId,
            from: EndpointId,
            message: String,
        }
        match serde_json::from_value::<PubsubPush>(payload.clone()) {
            Ok(push) => self.notify_client(ClientEvent::GroupMessage {
                group: push.group,
                from: push.from,
                message: push.message,
            }),
            Err(e) => warn!("dropping malformed pubsub push: {}", e),
        }
    }
}

impl MembershipBatches {
    fn batcher_mut(&mut self, kind: BatchKind) -> &mut Batcher {
        match kind {
            BatchKind::JoinGroup => &mut self.join,
            BatchKind::LeaveGroup => &mut self.leave,
            BatchKind::RegisterPresence => &mut self.presence,
        }
    }
}

fn auth_error(e: RespokeError) -> RespokeError {
    match e {
        RespokeError::ServerError { status, message } => {
            RespokeError::Auth(format!("status {}: {}", status, message))
        }
        RespokeError::Transport(message) => RespokeError::Transport(message),
        other => other,
    }
}

fn error_message(body: Option<&Value>, status: u16) -> String {
    body.and_then(|b| b.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("received error status {}", status))
}

/// A 401 body mentioning suspension becomes a dedicated error so the
/// application can route the user to the right remediation.
fn classify_suspension(body: &Value) -> Option<RespokeError> {
    let details = body.get("details")?;
    let message = details.get("message").and_then(Value::as_str);
    let reason = details.get("reason").and_then(Value::as_str);

    if reason.is_some_and(|r| r.contains("billing suspension")) {
        let text = message
            .or(reason)
            .unwrap_or("account has a billing suspension");
        return Some(RespokeError::BillingSuspension(text.to_string()));
    }
    if let Some(message) = message {
        if message.contains("suspended") {
            return Some(RespokeError::Suspension(message.to_string()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn suspension_classification() {
        let billing = json!({
            "error": "unauthorized",
            "details": {
                "reason": "billing suspension",
                "message": "Your account is past due.",
            },
        });
        assert!(matches!(
            classify_suspension(&billing),
            Some(RespokeError::BillingSuspension(m)) if m == "Your account is past due."
        ));

        let general = json!({
            "details": { "message": "This account has been suspended." },
        });
        assert!(matches!(
            classify_suspension(&general),
            Some(RespokeError::Suspension(_))
        ));

        let unrelated = json!({ "details": { "message": "bad token" } });
        assert!(classify_suspension(&unrelated).is_none());
        assert!(classify_suspension(&json!({ "error": "x" })).is_none());
    }

    #[test]
    fn error_message_prefers_body_error() {
        assert_eq!(
            error_message(Some(&json!({ "error": "nope" })), 500),
            "nope"
        );
        assert_eq!(error_message(None, 503), "received error status 503");
    }
}
