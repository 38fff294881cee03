//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Common test utilities
#![allow(dead_code)]

// Requires the 'sim' feature

use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lazy_static::lazy_static;
use rand::distributions::{Distribution, Standard};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde_json::{json, Value};

use respoke::common::{ClientConfig, Result, SignalTarget};
use respoke::core::call::Call;
use respoke::core::channel::{Authenticate, SignalingChannel};
use respoke::sim::sim_http::SimHttpClient;
use respoke::sim::sim_platform::SimPlatform;
use respoke::sim::sim_scheduler::SimScheduler;
use respoke::sim::sim_transport::SimTransport;
use respoke::transport::PushKind;

pub struct Prng {
    seed: u64,
    rng: Mutex<Option<ChaCha20Rng>>,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Mutex::new(None),
        }
    }

    // Use a freshly seeded PRNG for each test
    pub fn init(&self) {
        let mut opt = self.rng.lock().unwrap();
        let _ = opt.replace(ChaCha20Rng::seed_from_u64(self.seed));
    }

    pub fn gen<T>(&self) -> T
    where
        Standard: Distribution<T>,
    {
        self.rng.lock().unwrap().as_mut().unwrap().gen::<T>()
    }
}

lazy_static! {
    pub static ref PRNG: Prng = {
        let rand_seed = match env::var("RANDOM_SEED") {
            Ok(v) => v.parse().unwrap(),
            Err(_) => 0,
        };

        println!("\n*** Using random seed: {}", rand_seed);
        Prng::new(rand_seed)
    };
}

pub fn test_init() {
    let level = if env::var("DEBUG_TESTS").is_ok() {
        "debug"
    } else {
        "error"
    };
    let _ = env_logger::Builder::new().parse_filters(level).try_init();

    PRNG.init();
}

/// A connected channel over scripted transports, plus handles to poke
/// them from the test.
pub struct TestContext {
    pub channel: SignalingChannel<SimPlatform>,
    pub transport: SimTransport,
    pub http: SimHttpClient,
    pub scheduler: SimScheduler,
}

impl TestContext {
    /// Build a channel and open it through the scripted bootstrap.
    pub fn connected() -> Self {
        test_init();

        let transport = SimTransport::new();
        let http = SimHttpClient::new();
        let scheduler = SimScheduler::new();

        let config = ClientConfig {
            base_url: "https://api.example.test".to_string(),
            app_id: Some("app-1".to_string()),
            endpoint_id: Some("local-endpoint".to_string()),
            dev_mode: true,
            ..ClientConfig::default()
        };

        let channel = SignalingChannel::new(
            SimPlatform::new(),
            Arc::new(http.clone()),
            Arc::new(transport.clone()),
            Arc::new(scheduler.clone()),
            config,
        );

        let opened = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&opened);
        channel.open(
            Authenticate::Development {
                ttl: Duration::from_secs(3600),
            },
            Box::new(move |result| {
                *sink.lock().unwrap() = Some(result);
            }),
        );
        scheduler.run_until_idle();
        opened
            .lock()
            .unwrap()
            .take()
            .expect("open did not complete")
            .expect("open failed");

        transport.clear_frames();
        TestContext {
            channel,
            transport,
            http,
            scheduler,
        }
    }

    pub fn with_platform<R>(&self, f: impl FnOnce(&SimPlatform) -> R) -> R {
        let platform = self.channel.platform();
        let guard = platform.lock().unwrap();
        f(&guard)
    }

    pub fn with_platform_mut<R>(&self, f: impl FnOnce(&mut SimPlatform) -> R) -> R {
        let platform = self.channel.platform();
        let mut guard = platform.lock().unwrap();
        f(&mut guard)
    }

    /// Create and index an outbound call.
    pub fn outgoing_call(&self, remote: &str, target: SignalTarget) -> Call<SimPlatform> {
        let call = Call::outgoing(&self.channel, remote.to_string(), target);
        self.with_platform_mut(|platform| platform.add_call(call.clone()));
        call
    }

    /// Deliver an inbound signal push, as the server would.
    pub fn deliver_signal(&self, payload: Value) {
        self.transport.push(PushKind::Signal, payload);
    }

    /// The decoded signal payloads this side has sent, oldest first.
    pub fn signals_sent(&self) -> Vec<Value> {
        self.transport
            .frames_for("/v1/signaling")
            .iter()
            .filter_map(|frame| frame.data.as_ref())
            .filter_map(|data| data.get("signal"))
            .filter_map(Value::as_str)
            .filter_map(|signal| serde_json::from_str(signal).ok())
            .collect()
    }

    /// Sent signals of one `signalType`.
    pub fn signals_of_type(&self, signal_type: &str) -> Vec<Value> {
        self.signals_sent()
            .into_iter()
            .filter(|signal| signal["signalType"] == signal_type)
            .collect()
    }
}

/// Envelope for an inbound signal from `endpoint`/`connection`.
pub fn signal_from(endpoint: &str, connection: &str, session_id: &str, extra: Value) -> Value {
    let mut base = json!({
        "signalId": format!("sig-{}", PRNG.gen::<u32>()),
        "sessionId": session_id,
        "target": "call",
        "fromEndpoint": endpoint,
        "fromConnection": connection,
    });
    base.as_object_mut()
        .unwrap()
        .extend(extra.as_object().unwrap().clone());
    base
}

/// Capture slot for an RPC completion.
pub fn capture() -> (
    Arc<Mutex<Option<Result<Value>>>>,
    Box<dyn FnOnce(Result<Value>) + Send>,
) {
    let slot = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    (
        slot,
        Box::new(move |result| {
            *sink.lock().unwrap() = Some(result);
        }),
    )
}
