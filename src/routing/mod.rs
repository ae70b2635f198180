//! Routing-facing identity and the collaborator seams injected into
//! responder handlers.
//!
//! The registry core never routes requests itself; it derives the
//! instance identity the routing subsystem keys on, keeps selector
//! occupancy in sync with directory membership, and hands the opaque
//! collaborators (mesh inspector, filter chain, local caller) to each
//! responder.

use crate::security::Principal;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Derive the 32-bit instance id for a session.
///
/// The salt keeps a replayed app uuid under different credentials on a
/// different routing slot, while identical (credentials, uuid) pairs
/// land on the same slot across broker restarts.
pub fn instance_hash32(credentials: &str, uuid: &str) -> i32 {
    murmur3_x86_32(format!("{credentials}:{uuid}").as_bytes(), 0)
}

/// MurmurHash3 x86 32-bit.
fn murmur3_x86_32(data: &[u8], seed: u32) -> i32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut i = 0;
    while i + 4 <= data.len() {
        let mut k = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
        i += 4;
    }

    let mut k: u32 = 0;
    let remaining = data.len() - i;
    if remaining >= 3 {
        k ^= (data[i + 2] as u32) << 16;
    }
    if remaining >= 2 {
        k ^= (data[i + 1] as u32) << 8;
    }
    if remaining >= 1 {
        k ^= data[i] as u32;
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;

    h as i32
}

/// Declarative record attached to each exported service method:
/// service name plus the group/version/encoding/endpoint coordinates
/// the routing layer selects on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceMapping {
    pub service: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub endpoint: String,
}

impl ServiceMapping {
    pub fn named(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            group: String::new(),
            version: String::new(),
            encoding: String::new(),
            endpoint: String::new(),
        }
    }
}

/// Occupancy view the admission pipeline consults for the uniqueness
/// gate, kept in sync with directory membership by the registry.
pub trait ServiceRoutingSelector: Send + Sync + 'static {
    fn contains_instance(&self, instance_id: i32) -> bool;
    fn register_instance(&self, instance_id: i32, services: Vec<ServiceMapping>);
    fn unregister_instance(&self, instance_id: i32);
    fn instance_count(&self) -> usize;
}

/// In-memory selector: one map from instance id to its published
/// services.
#[derive(Default)]
pub struct MemoryRoutingSelector {
    instances: RwLock<HashMap<i32, HashSet<ServiceMapping>>>,
}

impl MemoryRoutingSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instances currently publishing the named service.
    pub fn find_instances(&self, service: &str) -> Vec<i32> {
        self.instances
            .read()
            .iter()
            .filter(|(_, services)| services.iter().any(|m| m.service == service))
            .map(|(id, _)| *id)
            .collect()
    }
}

impl ServiceRoutingSelector for MemoryRoutingSelector {
    fn contains_instance(&self, instance_id: i32) -> bool {
        self.instances.read().contains_key(&instance_id)
    }

    fn register_instance(&self, instance_id: i32, services: Vec<ServiceMapping>) {
        self.instances
            .write()
            .insert(instance_id, services.into_iter().collect());
    }

    fn unregister_instance(&self, instance_id: i32) {
        self.instances.write().remove(&instance_id);
    }

    fn instance_count(&self) -> usize {
        self.instances.read().len()
    }
}

/// Service-mesh policy seam consulted before peer-to-peer requests are
/// routed through a handler.
pub trait ServiceMeshInspector: Send + Sync + 'static {
    fn is_request_allowed(
        &self,
        requester: &Principal,
        service: &str,
        responder: &Principal,
    ) -> bool;
}

/// Permissive inspector for deployments without mesh policy.
#[derive(Debug, Clone, Default)]
pub struct OpenServiceMesh;

impl ServiceMeshInspector for OpenServiceMesh {
    fn is_request_allowed(&self, _: &Principal, _: &str, _: &Principal) -> bool {
        true
    }
}

/// One link of the request filter chain.
pub trait RequestFilter: Send + Sync + 'static {
    fn allow(&self, service: &str, requester: &Principal) -> bool;
}

/// Ordered filter chain applied by responders on routed calls. An empty
/// chain allows everything.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn RequestFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn RequestFilter>>) -> Self {
        Self { filters }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn allow(&self, service: &str, requester: &Principal) -> bool {
        self.filters
            .iter()
            .all(|filter| filter.allow(service, requester))
    }
}

/// Services the broker process itself can answer without routing to a
/// connected app.
pub trait LocalServiceCaller: Send + Sync + 'static {
    fn contains_service(&self, service: &str) -> bool;
}

/// Broker with no locally exported services.
#[derive(Debug, Clone, Default)]
pub struct NoLocalServices;

impl LocalServiceCaller for NoLocalServices {
    fn contains_service(&self, _: &str) -> bool {
        false
    }
}
