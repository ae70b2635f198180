//! Per-connection responder handler: the broker-side object servicing
//! one connected app, owning its requester socket from successful
//! admission until socket disposal.

use crate::events::{AppStatus, AppStatusEvent, EventBus, EventEnvelope};
use crate::metadata::{AppDescriptor, CompositeMetadata, SetupPayload};
use crate::routing::{
    FilterChain, LocalServiceCaller, ServiceMapping, ServiceMeshInspector, ServiceRoutingSelector,
};
use crate::security::Principal;
use bitflags::bitflags;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

bitflags! {
    /// Role surface a connected app exposes to the broker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AppRoles: u8 {
        const CONSUMER = 0b01;
        const PUBLISHER = 0b10;
    }
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("peer connection closed")]
    Closed,
}

/// Transport seam for the requester side of one RSocket session. Event
/// pushes are fire-and-forget; delivery order per peer is the socket's
/// own send queue.
pub trait RequesterSocket: Send + Sync + 'static {
    fn fire_event(&self, event: EventEnvelope) -> Result<(), SocketError>;
    fn dispose(&self);
    fn is_disposed(&self) -> bool;
}

/// Everything the admission pipeline hands a [`ResponderFactory`] for
/// one accepted connection.
pub struct ResponderContext {
    pub setup: SetupPayload,
    pub composite: CompositeMetadata,
    pub descriptor: AppDescriptor,
    pub principal: Principal,
    pub socket: Arc<dyn RequesterSocket>,
}

/// Shared collaborators injected into every responder.
#[derive(Clone)]
pub struct ResponderDeps {
    pub selector: Arc<dyn ServiceRoutingSelector>,
    pub mesh: Arc<dyn ServiceMeshInspector>,
    pub filters: FilterChain,
    pub local: Arc<dyn LocalServiceCaller>,
    pub bus: EventBus,
}

/// Builds responder handlers for admitted connections. Construction
/// failures reject the setup with `RST-500406`.
pub trait ResponderFactory: Send + Sync + 'static {
    fn create(
        &self,
        ctx: ResponderContext,
        deps: ResponderDeps,
    ) -> anyhow::Result<Arc<ResponderHandler>>;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultResponderFactory;

impl ResponderFactory for DefaultResponderFactory {
    fn create(
        &self,
        ctx: ResponderContext,
        deps: ResponderDeps,
    ) -> anyhow::Result<Arc<ResponderHandler>> {
        anyhow::ensure!(
            !ctx.socket.is_disposed(),
            "requester socket disposed before responder construction"
        );
        Ok(ResponderHandler::new(
            ctx.descriptor,
            ctx.principal,
            ctx.socket,
            deps,
        ))
    }
}

/// Broker-side handler for one live session. Owned exclusively by the
/// directory; everything else observes through the directory indices.
pub struct ResponderHandler {
    descriptor: AppDescriptor,
    principal: Principal,
    socket: Arc<dyn RequesterSocket>,
    published: RwLock<HashSet<ServiceMapping>>,
    consumed: RwLock<HashSet<String>>,
    roles: AtomicU8,
    disposed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    selector: Arc<dyn ServiceRoutingSelector>,
    mesh: Arc<dyn ServiceMeshInspector>,
    filters: FilterChain,
    local: Arc<dyn LocalServiceCaller>,
    bus: EventBus,
}

impl std::fmt::Debug for ResponderHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponderHandler")
            .field("descriptor", &self.descriptor)
            .field("principal", &self.principal)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl ResponderHandler {
    pub fn new(
        descriptor: AppDescriptor,
        principal: Principal,
        socket: Arc<dyn RequesterSocket>,
        deps: ResponderDeps,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            descriptor,
            principal,
            socket,
            published: RwLock::new(HashSet::new()),
            consumed: RwLock::new(HashSet::new()),
            roles: AtomicU8::new(0),
            disposed: AtomicBool::new(false),
            closed_tx,
            selector: deps.selector,
            mesh: deps.mesh,
            filters: deps.filters,
            local: deps.local,
            bus: deps.bus,
        })
    }

    /// Instance id derived at admission; the routing-layer key.
    pub fn id(&self) -> i32 {
        self.descriptor.id
    }

    /// Canonical uuid for directory keying on both the registration and
    /// disposal paths.
    pub fn uuid(&self) -> &str {
        &self.descriptor.uuid
    }

    pub fn app_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn ip(&self) -> &str {
        &self.descriptor.ip
    }

    pub fn descriptor(&self) -> &AppDescriptor {
        &self.descriptor
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn roles(&self) -> AppRoles {
        AppRoles::from_bits_truncate(self.roles.load(Ordering::Acquire))
    }

    pub fn published_services(&self) -> Vec<ServiceMapping> {
        self.published.read().iter().cloned().collect()
    }

    pub fn consumed_services(&self) -> Vec<String> {
        self.consumed.read().iter().cloned().collect()
    }

    /// Fire-and-forget event push; failures are logged, never
    /// propagated. Returns whether the socket took the event.
    pub fn fire_event_to_peer(&self, event: EventEnvelope) -> bool {
        match self.socket.fire_event(event) {
            Ok(()) => true,
            Err(err) => {
                debug!(uuid = %self.uuid(), error = %err, "event push to peer failed");
                false
            }
        }
    }

    /// Record services this app now publishes: updates the routing
    /// selector's view and announces SERVING.
    pub fn register_published_services(
        &self,
        services: impl IntoIterator<Item = ServiceMapping>,
    ) {
        if self.is_disposed() {
            return;
        }
        let snapshot = {
            let mut published = self.published.write();
            published.extend(services);
            published.iter().cloned().collect::<Vec<_>>()
        };
        self.roles
            .fetch_or(AppRoles::PUBLISHER.bits(), Ordering::AcqRel);
        self.selector.register_instance(self.id(), snapshot);
        self.bus
            .publish(AppStatusEvent::envelope(self.uuid(), AppStatus::Serving));
    }

    /// Withdraw all published services; the instance stays occupied in
    /// the selector so its routing slot cannot be reused while live.
    pub fn unregister_published_services(&self) {
        if self.is_disposed() {
            return;
        }
        self.published.write().clear();
        self.roles
            .fetch_and(!AppRoles::PUBLISHER.bits(), Ordering::AcqRel);
        self.selector.register_instance(self.id(), Vec::new());
        self.bus.publish(AppStatusEvent::envelope(
            self.uuid(),
            AppStatus::OutOfService,
        ));
    }

    /// Record services this app consumes.
    pub fn register_consumed_services(&self, services: impl IntoIterator<Item = String>) {
        self.consumed.write().extend(services);
        self.roles
            .fetch_or(AppRoles::CONSUMER.bits(), Ordering::AcqRel);
    }

    /// Filter chain plus mesh policy over the authenticated principals.
    pub fn peer_request_allowed(&self, service: &str, requester: &Principal) -> bool {
        self.filters.allow(service, requester)
            && self
                .mesh
                .is_request_allowed(requester, service, &self.principal)
    }

    /// Whether the broker process answers this service itself.
    pub fn serves_locally(&self, service: &str) -> bool {
        self.local.contains_service(service)
    }

    /// Resolves once the handler is disposed. Disposal callbacks must
    /// run off the accept path; the registry spawns the watcher.
    pub fn on_close(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.closed_tx.subscribe();
        async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Idempotent: disposes the owned socket and signals close.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.socket.is_disposed() {
            self.socket.dispose();
        }
        // send_replace stores the close signal even with no watcher yet
        self.closed_tx.send_replace(true);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Transport-level liveness, read by the stale-handler sweep.
    pub fn socket_disposed(&self) -> bool {
        self.socket.is_disposed()
    }
}
