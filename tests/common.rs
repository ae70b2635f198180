//! Common test harness utilities for integration tests.
//!
//! Provides in-memory stand-ins for the external collaborators (the
//! requester socket, the authentication backend, the responder
//! factory) plus builders for setup payloads and registries.

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use photon::cluster::{BrokerManager, StandaloneBrokerManager};
use photon::config::{BrokerConfig, StaleSweepConfig};
use photon::events::EventEnvelope;
use photon::metadata::{CompositeMetadata, SetupPayload, APPLICATION_MIME, BEARER_TOKEN_MIME};
use photon::registry::handler::{
    DefaultResponderFactory, RequesterSocket, ResponderContext, ResponderDeps, ResponderFactory,
    ResponderHandler, SocketError,
};
use photon::registry::HandlerRegistry;
use photon::routing::{FilterChain, MemoryRoutingSelector, NoLocalServices, OpenServiceMesh};
use photon::security::{AuthError, AuthenticationService, Principal};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const UUID_A: &str = "00000000000000000000000000000000-abc";
pub const UUID_B: &str = "11111111111111111111111111111111-abc";
pub const UUID_C: &str = "22222222222222222222222222222222-abc";
pub const UUID_D: &str = "33333333333333333333333333333333-abc";

/// Requester socket that records fired events in memory.
pub struct MemorySocket {
    fired: Mutex<Vec<EventEnvelope>>,
    disposed: AtomicBool,
    dispose_calls: AtomicUsize,
}

impl MemorySocket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            dispose_calls: AtomicUsize::new(0),
        })
    }

    pub fn fired(&self) -> Vec<EventEnvelope> {
        self.fired.lock().clone()
    }

    pub fn fired_count(&self) -> usize {
        self.fired.lock().len()
    }

    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::Acquire)
    }

    /// Simulate transport death without the close callback firing.
    pub fn fail_transport(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

impl RequesterSocket for MemorySocket {
    fn fire_event(&self, event: EventEnvelope) -> Result<(), SocketError> {
        if self.is_disposed() {
            return Err(SocketError::Closed);
        }
        self.fired.lock().push(event);
        Ok(())
    }

    fn dispose(&self) {
        self.dispose_calls.fetch_add(1, Ordering::AcqRel);
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Authentication backend with a fixed token table.
pub struct StaticAuth {
    principals: HashMap<String, Principal>,
    unavailable: bool,
}

impl StaticAuth {
    /// Accepts `token` and resolves it to [`test_principal`].
    pub fn with_token(token: &str) -> Self {
        let mut principals = HashMap::new();
        principals.insert(token.to_string(), test_principal());
        Self {
            principals,
            unavailable: false,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            principals: HashMap::new(),
            unavailable: true,
        }
    }
}

impl AuthenticationService for StaticAuth {
    fn auth(&self, method: &str, credentials: &str) -> Result<Option<Principal>, AuthError> {
        assert_eq!(method, "JWT");
        if self.unavailable {
            return Err(AuthError::Unavailable("backend down".into()));
        }
        Ok(self.principals.get(credentials).cloned())
    }
}

/// The principal [`StaticAuth::with_token`] resolves to.
pub fn test_principal() -> Principal {
    Principal {
        subject: "svc-principal".into(),
        organizations: set(&["acme"]),
        roles: set(&["ops"]),
        service_accounts: set(&["reader"]),
        authorities: set(&["1"]),
    }
}

fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

/// Factory that always fails construction.
pub struct FailingFactory;

impl ResponderFactory for FailingFactory {
    fn create(
        &self,
        _ctx: ResponderContext,
        _deps: ResponderDeps,
    ) -> anyhow::Result<Arc<ResponderHandler>> {
        anyhow::bail!("forced construction failure")
    }
}

pub struct Fixture {
    pub registry: HandlerRegistry,
    pub selector: Arc<MemoryRoutingSelector>,
}

pub fn fixture(auth_required: bool) -> Fixture {
    fixture_with(
        auth_required,
        Arc::new(StaticAuth::with_token("token-1")),
        Arc::new(StandaloneBrokerManager::new("tcp://self:9999")),
        Arc::new(DefaultResponderFactory),
    )
}

/// Install a subscriber once so registry logs show up on test failure.
/// RUST_LOG filters as usual.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn fixture_with(
    auth_required: bool,
    auth: Arc<dyn AuthenticationService>,
    brokers: Arc<dyn BrokerManager>,
    factory: Arc<dyn ResponderFactory>,
) -> Fixture {
    init_tracing();
    let mut cfg = BrokerConfig::default();
    cfg.auth_required = auth_required;
    cfg.sweep = StaleSweepConfig {
        interval_seconds: 1,
        grace_seconds: 3,
    };
    let selector = Arc::new(MemoryRoutingSelector::new());
    let registry = HandlerRegistry::new(
        &cfg,
        "test-broker",
        auth,
        selector.clone(),
        Arc::new(OpenServiceMesh),
        FilterChain::empty(),
        Arc::new(NoLocalServices),
        factory,
        brokers,
    );
    Fixture { registry, selector }
}

pub fn app_payload(uuid: &str, name: &str, ip: &str) -> Bytes {
    Bytes::from(
        serde_json::json!({ "uuid": uuid, "name": name, "ip": ip }).to_string(),
    )
}

/// Setup payload with only the app descriptor.
pub fn setup(uuid: &str, name: &str) -> SetupPayload {
    let mut composite = CompositeMetadata::new();
    composite.push(APPLICATION_MIME, app_payload(uuid, name, "10.0.0.1"));
    SetupPayload::new(composite.encode().unwrap(), Bytes::new())
}

/// Setup payload with a bearer token and the app descriptor.
pub fn setup_with_token(uuid: &str, name: &str, token: &str) -> SetupPayload {
    let mut composite = CompositeMetadata::new();
    composite.push(BEARER_TOKEN_MIME, Bytes::from(token.to_string()));
    composite.push(APPLICATION_MIME, app_payload(uuid, name, "10.0.0.1"));
    SetupPayload::new(composite.encode().unwrap(), Bytes::new())
}

/// Setup payload with a bearer token but no app descriptor.
pub fn setup_token_only(token: &str) -> SetupPayload {
    let mut composite = CompositeMetadata::new();
    composite.push(BEARER_TOKEN_MIME, Bytes::from(token.to_string()));
    SetupPayload::new(composite.encode().unwrap(), Bytes::new())
}

/// Let spawned tasks (disposal watchers, announcer subscriptions) run.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Yield until the condition holds; panics if it never does.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..512 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached while settling");
}
