//! Structured event envelopes carried on the lifecycle topic and pushed
//! to connected apps.
//!
//! Two instantiations matter to the registry core: per-app status
//! transitions and cluster-topology changes.

pub mod bus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use self::bus::EventBus;

/// Event type for per-app status transitions.
pub const APP_STATUS_TYPE: &str = "app.status";
/// Event type for upstream-cluster topology changes.
pub const CLUSTER_TOPOLOGY_TYPE: &str = "cluster.topology.changed";
/// Schema URI attached to topology-change envelopes.
pub const CLUSTER_TOPOLOGY_SCHEMA: &str = "event:cluster.topology.changed";

/// Envelope wrapping every structured event published by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    #[serde(rename = "dataContentType")]
    pub data_content_type: String,
    #[serde(rename = "dataSchema", default, skip_serializing_if = "Option::is_none")]
    pub data_schema: Option<String>,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            time: Utc::now(),
            event_type: event_type.into(),
            source: source.into(),
            data_content_type: "application/json".to_string(),
            data_schema: None,
            data,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.data_schema = Some(schema.into());
        self
    }

    pub fn decode_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Status of a connected app instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    Connected,
    Serving,
    OutOfService,
    Stopped,
}

/// Payload of an [`APP_STATUS_TYPE`] envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStatusEvent {
    pub uuid: String,
    pub status: AppStatus,
}

impl AppStatusEvent {
    /// Build the status envelope; source is `app://<uuid>`.
    pub fn envelope(uuid: &str, status: AppStatus) -> EventEnvelope {
        let payload = Self {
            uuid: uuid.to_string(),
            status,
        };
        EventEnvelope::new(
            APP_STATUS_TYPE,
            format!("app://{uuid}"),
            serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        )
    }
}

/// Payload of a [`CLUSTER_TOPOLOGY_TYPE`] envelope: the active broker
/// URL set in the order supplied by the membership source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamClusterChanged {
    pub group: String,
    pub interface_name: String,
    pub version: String,
    pub uris: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_envelope_sources_from_app_uuid() {
        let envelope = AppStatusEvent::envelope("abc", AppStatus::Connected);
        assert_eq!(envelope.event_type, APP_STATUS_TYPE);
        assert_eq!(envelope.source, "app://abc");
        assert_eq!(envelope.data_content_type, "application/json");
        assert!(envelope.data_schema.is_none());
        let payload: AppStatusEvent = envelope.decode_data().unwrap();
        assert_eq!(payload.status, AppStatus::Connected);
    }

    #[test]
    fn status_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&AppStatus::OutOfService).unwrap();
        assert_eq!(json, "\"OUT_OF_SERVICE\"");
    }

    #[test]
    fn topology_payload_round_trips_camel_case() {
        let payload = UpstreamClusterChanged {
            group: String::new(),
            interface_name: "*".into(),
            version: String::new(),
            uris: vec!["tcp://broker-1:9999".into()],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("interfaceName").is_some());
        let back: UpstreamClusterChanged = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn envelope_ids_are_unique() {
        let a = AppStatusEvent::envelope("x", AppStatus::Stopped);
        let b = AppStatusEvent::envelope("x", AppStatus::Stopped);
        assert_ne!(a.id, b.id);
    }
}
