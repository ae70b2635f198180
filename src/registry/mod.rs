//! Broker handler registry: admission gating, the directory of live
//! responder handlers, and the broadcast primitives built on it.
//!
//! The three directory indices (connection id, app uuid, app name) are
//! views over one owning container guarded by a single lock, so a
//! handler is observable in all of them or none.

pub mod handler;

use crate::cluster::{topology_changed_event, BrokerManager};
use crate::core::config::{BrokerConfig, StaleSweepConfig};
use crate::events::{AppStatus, AppStatusEvent, EventBus, EventEnvelope};
use crate::metadata::{
    AppDescriptor, BearerToken, CompositeMetadata, MimeKind, SetupPayload, ORGS_KEY, ROLES_KEY,
    SERVICE_ACCOUNTS_KEY,
};
use crate::ops::codes::BrokerCode;
use crate::routing::{
    instance_hash32, FilterChain, LocalServiceCaller, ServiceMeshInspector, ServiceRoutingSelector,
};
use crate::security::{AuthenticationService, Principal, JWT_METHOD};
use chrono::Utc;
use self::handler::{ResponderContext, ResponderDeps, ResponderFactory, ResponderHandler};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Minimum accepted app uuid length.
const MIN_APP_UUID_LEN: usize = 32;

/// App name synthesized for sessions admitted with authentication
/// disabled.
const MOCK_APP_NAME: &str = "MockApp";

/// Terminal rejection of a setup attempt, carrying the stable code the
/// client sees in its rejected-setup signal.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SetupRejected {
    pub code: BrokerCode,
    pub message: String,
}

impl SetupRejected {
    fn new(code: BrokerCode, args: &[&str]) -> Self {
        Self {
            code,
            message: code.message(args),
        }
    }
}

/// The three indices over the live handler set. One value, one lock:
/// the triple update is atomic with respect to every reader.
#[derive(Default)]
struct Directory {
    by_connection: HashMap<i32, Arc<ResponderHandler>>,
    by_uuid: HashMap<String, Arc<ResponderHandler>>,
    by_name: HashMap<String, Vec<Arc<ResponderHandler>>>,
}

/// Connection-admission and handler-registry core. Cloning is cheap and
/// clones share all state.
#[derive(Clone)]
pub struct HandlerRegistry {
    directory: Arc<RwLock<Directory>>,
    bus: EventBus,
    auth: Arc<dyn AuthenticationService>,
    selector: Arc<dyn ServiceRoutingSelector>,
    mesh: Arc<dyn ServiceMeshInspector>,
    filters: FilterChain,
    local: Arc<dyn LocalServiceCaller>,
    factory: Arc<dyn ResponderFactory>,
    brokers: Arc<dyn BrokerManager>,
    broker_id: String,
    auth_required: bool,
    sweep: StaleSweepConfig,
}

impl HandlerRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &BrokerConfig,
        broker_id: impl Into<String>,
        auth: Arc<dyn AuthenticationService>,
        selector: Arc<dyn ServiceRoutingSelector>,
        mesh: Arc<dyn ServiceMeshInspector>,
        filters: FilterChain,
        local: Arc<dyn LocalServiceCaller>,
        factory: Arc<dyn ResponderFactory>,
        brokers: Arc<dyn BrokerManager>,
    ) -> Self {
        Self {
            directory: Arc::new(RwLock::new(Directory::default())),
            bus: EventBus::new(&config.events),
            auth,
            selector,
            mesh,
            filters,
            local,
            factory,
            brokers,
            broker_id: broker_id.into(),
            auth_required: config.auth_required,
            sweep: config.sweep.clone(),
        }
    }

    /// Process-wide broker identity used as the topology event source.
    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Gate one setup attempt. On success the returned handler owns the
    /// socket; on rejection the socket is disposed exactly once and no
    /// directory state or events are produced.
    pub async fn accept(
        &self,
        setup: SetupPayload,
        socket: Arc<dyn handler::RequesterSocket>,
    ) -> Result<Arc<ResponderHandler>, SetupRejected> {
        match self.admit(setup, socket.clone()).await {
            Ok(admitted) => Ok(admitted),
            Err(rejection) => {
                if !socket.is_disposed() {
                    socket.dispose();
                }
                Err(rejection)
            }
        }
    }

    async fn admit(
        &self,
        setup: SetupPayload,
        socket: Arc<dyn handler::RequesterSocket>,
    ) -> Result<Arc<ResponderHandler>, SetupRejected> {
        // Parse
        let composite = CompositeMetadata::decode(setup.metadata.clone()).map_err(|err| {
            debug!(error = %err, "setup metadata rejected");
            SetupRejected::new(BrokerCode::MetadataParse, &[&err.to_string()])
        })?;

        // Authenticate
        let (principal, credentials) = if self.auth_required {
            let Some(payload) = composite.get(MimeKind::BearerToken) else {
                debug!("setup rejected: bearer token missing");
                return Err(SetupRejected::new(BrokerCode::Unauthenticated, &[]));
            };
            let token = BearerToken::decode(payload).map_err(|err| {
                error!(error = %err, "bearer token payload unreadable");
                SetupRejected::new(BrokerCode::Internal, &[&err.to_string()])
            })?;
            let credentials = token.into_token();
            let principal = self.verify_credentials(credentials.clone()).await?;
            (principal, credentials)
        } else {
            // Fresh random credentials keep replayed uuids on distinct
            // routing slots even without real authentication.
            (Principal::mock(MOCK_APP_NAME), Uuid::new_v4().to_string())
        };

        // App descriptor present
        let Some(payload) = composite.get(MimeKind::Application) else {
            debug!("setup rejected: app descriptor missing");
            return Err(SetupRejected::new(BrokerCode::MissingAppDescriptor, &[]));
        };
        let mut descriptor = AppDescriptor::decode(payload).map_err(|err| {
            error!(error = %err, "app descriptor payload unreadable");
            SetupRejected::new(BrokerCode::Internal, &[&err.to_string()])
        })?;

        // Uuid shape
        if descriptor.uuid.len() < MIN_APP_UUID_LEN {
            debug!(uuid = %descriptor.uuid, "setup rejected: malformed app uuid");
            return Err(SetupRejected::new(
                BrokerCode::MalformedUuid,
                &[&descriptor.uuid],
            ));
        }

        // Instance-id derivation: deterministic across restarts
        descriptor.id = instance_hash32(&credentials, &descriptor.uuid);

        // Uniqueness against the routing selector; the race with a
        // concurrent admission closes under the directory writer lock
        if self.selector.contains_instance(descriptor.id) {
            debug!(instance_id = descriptor.id, "setup rejected: duplicate live instance");
            return Err(SetupRejected::new(BrokerCode::DuplicateInstance, &[]));
        }

        // Principal enrichment: reserved keys never come from the client
        descriptor.add_metadata(ORGS_KEY, principal.joined_organizations());
        descriptor.add_metadata(ROLES_KEY, principal.joined_roles());
        descriptor.add_metadata(SERVICE_ACCOUNTS_KEY, principal.joined_service_accounts());
        descriptor.connected_at = Some(Utc::now());

        // Construct
        let ctx = ResponderContext {
            setup,
            composite,
            descriptor,
            principal,
            socket,
        };
        let admitted = self.factory.create(ctx, self.responder_deps()).map_err(|err| {
            error!(error = %err, "responder construction failed");
            SetupRejected::new(BrokerCode::ResponderConstruct, &[&err.to_string()])
        })?;

        // Disposal must never run on the accept path
        let registry = self.clone();
        let watched = admitted.clone();
        let closed = admitted.on_close();
        tokio::spawn(async move {
            closed.await;
            registry.on_handler_disposed(&watched);
        });

        // Register; a losing duplicate is disposed here, so the outer
        // rejection path finds the socket already closed
        if let Err(rejection) = self.on_handler_registered(&admitted) {
            admitted.dispose();
            return Err(rejection);
        }
        info!("{}", BrokerCode::AcceptOk.message(&[admitted.app_name()]));
        Ok(admitted)
    }

    async fn verify_credentials(&self, credentials: String) -> Result<Principal, SetupRejected> {
        let auth = self.auth.clone();
        let outcome = tokio::task::spawn_blocking(move || auth.auth(JWT_METHOD, &credentials))
            .await
            .map_err(|err| {
                error!(error = %err, "authentication worker failed");
                SetupRejected::new(BrokerCode::Internal, &[&err.to_string()])
            })?;
        match outcome {
            Ok(Some(principal)) => Ok(principal),
            Ok(None) => {
                debug!("setup rejected: credential verification failed");
                Err(SetupRejected::new(BrokerCode::Unauthenticated, &[]))
            }
            Err(err) => {
                warn!(error = %err, "authentication backend unavailable");
                Err(SetupRejected::new(BrokerCode::Internal, &[&err.to_string()]))
            }
        }
    }

    fn responder_deps(&self) -> ResponderDeps {
        ResponderDeps {
            selector: self.selector.clone(),
            mesh: self.mesh.clone(),
            filters: self.filters.clone(),
            local: self.local.clone(),
            bus: self.bus.clone(),
        }
    }

    /// Insert a handler into all three indices, re-checking uniqueness
    /// under the writer lock, then publish CONNECTED. In cluster mode
    /// the new handler immediately receives the current topology.
    pub fn on_handler_registered(
        &self,
        handler: &Arc<ResponderHandler>,
    ) -> Result<(), SetupRejected> {
        {
            let mut dir = self.directory.write();
            if dir.by_connection.contains_key(&handler.id())
                || dir.by_uuid.contains_key(handler.uuid())
            {
                debug!(
                    instance_id = handler.id(),
                    "registration lost the uniqueness race"
                );
                return Err(SetupRejected::new(BrokerCode::DuplicateInstance, &[]));
            }
            dir.by_connection.insert(handler.id(), handler.clone());
            dir.by_uuid
                .insert(handler.uuid().to_string(), handler.clone());
            dir.by_name
                .entry(handler.app_name().to_string())
                .or_default()
                .push(handler.clone());
        }
        self.selector
            .register_instance(handler.id(), handler.published_services());
        self.bus
            .publish(AppStatusEvent::envelope(handler.uuid(), AppStatus::Connected));
        self.bus.notify(
            BrokerCode::AppConnectedNote.message(&[handler.app_name(), handler.ip()]),
        );
        if !self.brokers.is_standalone() {
            let event =
                topology_changed_event(&self.broker_id, &self.brokers.current_brokers());
            handler.fire_event_to_peer(event);
        }
        Ok(())
    }

    /// Remove a handler from all three indices and publish STOPPED.
    /// Removal is identity-checked: a handler that never won
    /// registration (or was already swept) cannot evict its
    /// same-keyed successor, and no events fire for it.
    pub fn on_handler_disposed(&self, handler: &Arc<ResponderHandler>) {
        let removed = {
            let mut dir = self.directory.write();
            let registered = dir
                .by_uuid
                .get(handler.uuid())
                .map(|current| Arc::ptr_eq(current, handler))
                .unwrap_or(false);
            if registered {
                dir.by_uuid.remove(handler.uuid());
                if dir
                    .by_connection
                    .get(&handler.id())
                    .map(|current| Arc::ptr_eq(current, handler))
                    .unwrap_or(false)
                {
                    dir.by_connection.remove(&handler.id());
                }
                if let Some(replicas) = dir.by_name.get_mut(handler.app_name()) {
                    replicas.retain(|current| !Arc::ptr_eq(current, handler));
                    if replicas.is_empty() {
                        dir.by_name.remove(handler.app_name());
                    }
                }
            }
            registered
        };
        if !removed {
            debug!(uuid = %handler.uuid(), "disposal for unregistered handler ignored");
            return;
        }
        self.selector.unregister_instance(handler.id());
        info!("{}", BrokerCode::Disposed.message(&[]));
        self.bus
            .publish(AppStatusEvent::envelope(handler.uuid(), AppStatus::Stopped));
        self.bus
            .notify(BrokerCode::AppStoppedNote.message(&[handler.app_name(), handler.ip()]));
    }

    /// All live handlers (the value set of the uuid index).
    pub fn find_all(&self) -> Vec<Arc<ResponderHandler>> {
        self.directory.read().by_uuid.values().cloned().collect()
    }

    pub fn find_by_uuid(&self, uuid: &str) -> Option<Arc<ResponderHandler>> {
        self.directory.read().by_uuid.get(uuid).cloned()
    }

    pub fn find_by_id(&self, instance_id: i32) -> Option<Arc<ResponderHandler>> {
        self.directory
            .read()
            .by_connection
            .get(&instance_id)
            .cloned()
    }

    /// Snapshot of the replicas registered under an app name; the set
    /// may change immediately after the call returns.
    pub fn find_by_app_name(&self, name: &str) -> Vec<Arc<ResponderHandler>> {
        self.directory
            .read()
            .by_name
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn find_all_app_names(&self) -> Vec<String> {
        self.directory.read().by_name.keys().cloned().collect()
    }

    pub fn handler_count(&self) -> usize {
        self.directory.read().by_uuid.len()
    }

    /// Deliver an event to every handler under `app_name`, or to every
    /// live handler for `"*"`. Unknown names are a no-op. Returns the
    /// number of sockets that took the event; per-handler failures are
    /// logged by the handler and never abort the fan-out.
    pub fn broadcast(&self, app_name: &str, event: &EventEnvelope) -> usize {
        let targets = {
            let named = self.find_by_app_name(app_name);
            if !named.is_empty() {
                named
            } else if app_name == "*" {
                self.find_all()
            } else {
                Vec::new()
            }
        };
        let mut delivered = 0;
        for target in targets {
            if target.fire_event_to_peer(event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Reap handlers whose transport reports closed but whose disposal
    /// callback never fired. Runs until the task is aborted.
    pub fn spawn_stale_handler_sweep(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let period = self.sweep.interval();
        let grace = self.sweep.grace();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut suspects: HashMap<i32, Instant> = HashMap::new();
            loop {
                ticker.tick().await;
                registry.sweep_stale_handlers(&mut suspects, grace);
            }
        })
    }

    fn sweep_stale_handlers(&self, suspects: &mut HashMap<i32, Instant>, grace: Duration) {
        let now = Instant::now();
        let handlers = self.find_all();
        suspects.retain(|id, _| handlers.iter().any(|h| h.id() == *id));
        for stale in handlers {
            if !stale.socket_disposed() {
                suspects.remove(&stale.id());
                continue;
            }
            let first_seen = *suspects.entry(stale.id()).or_insert(now);
            if now.duration_since(first_seen) >= grace {
                warn!(
                    uuid = %stale.uuid(),
                    "reaping stale handler: transport closed but disposal never fired"
                );
                suspects.remove(&stale.id());
                stale.dispose();
                self.on_handler_disposed(&stale);
            }
        }
    }
}
