//! Cluster topology announcement.
//!
//! A non-standalone broker watches the membership source and pushes the
//! active broker set to every connected app, staggered by role:
//! publishers must learn of peer brokers before consumers start routing
//! to them.

use crate::events::{
    EventEnvelope, UpstreamClusterChanged, CLUSTER_TOPOLOGY_SCHEMA, CLUSTER_TOPOLOGY_TYPE,
};
use crate::registry::handler::AppRoles;
use crate::registry::HandlerRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Delay before publish+consume handlers hear of a topology change.
pub const PUBLISH_CONSUME_DELAY: Duration = Duration::from_secs(15);
/// Delay before consume-only handlers hear of a topology change.
pub const CONSUME_ONLY_DELAY: Duration = Duration::from_secs(30);

/// One peer broker as reported by the membership source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broker {
    pub url: String,
    pub active: bool,
}

impl Broker {
    pub fn active(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            active: true,
        }
    }
}

/// Membership collaborator. The watch stream emits the full active set
/// on every change.
pub trait BrokerManager: Send + Sync + 'static {
    fn is_standalone(&self) -> bool;
    fn current_brokers(&self) -> Vec<Broker>;
    fn membership(&self) -> watch::Receiver<Vec<Broker>>;
}

/// Single-broker deployment: no peers, no announcements.
pub struct StandaloneBrokerManager {
    members: watch::Sender<Vec<Broker>>,
}

impl StandaloneBrokerManager {
    pub fn new(self_url: impl Into<String>) -> Self {
        let (members, _) = watch::channel(vec![Broker::active(self_url)]);
        Self { members }
    }
}

impl BrokerManager for StandaloneBrokerManager {
    fn is_standalone(&self) -> bool {
        true
    }

    fn current_brokers(&self) -> Vec<Broker> {
        self.members.borrow().clone()
    }

    fn membership(&self) -> watch::Receiver<Vec<Broker>> {
        self.members.subscribe()
    }
}

/// Clustered membership fed by an external discovery adapter pushing
/// snapshots through [`WatchBrokerManager::update`].
pub struct WatchBrokerManager {
    members: watch::Sender<Vec<Broker>>,
}

impl WatchBrokerManager {
    pub fn new(initial: Vec<Broker>) -> Self {
        let (members, _) = watch::channel(initial);
        Self { members }
    }

    pub fn update(&self, brokers: Vec<Broker>) {
        // send_replace stores the snapshot even before anyone subscribes
        self.members.send_replace(brokers);
    }
}

impl BrokerManager for WatchBrokerManager {
    fn is_standalone(&self) -> bool {
        false
    }

    fn current_brokers(&self) -> Vec<Broker> {
        self.members.borrow().clone()
    }

    fn membership(&self) -> watch::Receiver<Vec<Broker>> {
        self.members.subscribe()
    }
}

/// Build the topology-change envelope: active broker URLs in membership
/// order, sourced from `broker://<id>`.
pub fn topology_changed_event(broker_id: &str, brokers: &[Broker]) -> EventEnvelope {
    let uris = brokers
        .iter()
        .filter(|broker| broker.active)
        .map(|broker| broker.url.clone())
        .collect();
    let payload = UpstreamClusterChanged {
        group: String::new(),
        interface_name: "*".to_string(),
        version: String::new(),
        uris,
    };
    EventEnvelope::new(
        CLUSTER_TOPOLOGY_TYPE,
        format!("broker://{broker_id}"),
        serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
    )
    .with_schema(CLUSTER_TOPOLOGY_SCHEMA)
}

/// Stagger for one handler's topology delivery.
pub fn announce_delay(roles: AppRoles) -> Duration {
    if roles == AppRoles::PUBLISHER {
        Duration::ZERO
    } else if roles.contains(AppRoles::PUBLISHER) {
        PUBLISH_CONSUME_DELAY
    } else {
        CONSUME_ONLY_DELAY
    }
}

/// Watches the membership stream and fans topology changes out to the
/// directory with role-staggered delays.
pub struct ClusterAnnouncer {
    registry: HandlerRegistry,
    brokers: Arc<dyn BrokerManager>,
}

impl ClusterAnnouncer {
    pub fn new(registry: HandlerRegistry, brokers: Arc<dyn BrokerManager>) -> Self {
        Self { registry, brokers }
    }

    /// Subscribe to membership changes until the source closes.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut membership = self.brokers.membership();
            while membership.changed().await.is_ok() {
                let snapshot = membership.borrow_and_update().clone();
                debug!(brokers = snapshot.len(), "cluster membership changed");
                self.announce(&snapshot);
            }
        })
    }

    /// Fan one topology snapshot out to every live handler. Deliveries
    /// to different handlers interleave freely; per-handler ordering is
    /// the socket's own send queue. Staggered sends run on their own
    /// tasks so one snapshot's delays never serialize.
    pub fn announce(&self, brokers: &[Broker]) {
        let event = topology_changed_event(self.registry.broker_id(), brokers);
        for target in self.registry.find_all() {
            let delay = announce_delay(target.roles());
            if delay.is_zero() {
                target.fire_event_to_peer(event.clone());
            } else {
                let event = event.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    target.fire_event_to_peer(event);
                });
            }
        }
    }
}
