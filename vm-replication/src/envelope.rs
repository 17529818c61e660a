//! Typed replication messages.
//!
//! Every feed carries the same envelope shape,
//! `{schema_version, action, timestamp, data}`, with an entity-specific
//! `data` payload. Only `data.id` is required; every other field is
//! optional so that partial updates merge into the local row.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, Result};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// `create` and `update` both resolve to an upsert.
    pub fn is_upsert(&self) -> bool {
        !matches!(self, Action::Delete)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub action: Action,
    #[serde(default)]
    pub timestamp: String,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(action: Action, data: T) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            action,
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfferData {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_size_mib: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_per_hour: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// The three replicated entity feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feed {
    Offers,
    Images,
    Users,
}

impl Feed {
    pub const ALL: [Feed; 3] = [Feed::Offers, Feed::Images, Feed::Users];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feed::Offers => "offers",
            Feed::Images => "images",
            Feed::Users => "users",
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange name of each feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchanges {
    pub offers: String,
    pub images: String,
    pub users: String,
}

impl Default for Exchanges {
    fn default() -> Self {
        Self {
            offers: "vm-offer-exchange".to_string(),
            images: "system-image-exchange".to_string(),
            users: "user-exchange".to_string(),
        }
    }
}

impl Exchanges {
    pub fn name(&self, feed: Feed) -> &str {
        match feed {
            Feed::Offers => &self.offers,
            Feed::Images => &self.images,
            Feed::Users => &self.users,
        }
    }

    /// Durable queue owned by `service` on the feed's exchange.
    pub fn queue(&self, feed: Feed, service: &str) -> String {
        format!("{}-{}-queue", self.name(feed), service)
    }
}

/// A decoded message from any feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    Offer(Envelope<OfferData>),
    Image(Envelope<ImageData>),
    User(Envelope<UserData>),
}

impl ReplicaEvent {
    /// Decode a payload received on `feed`.
    pub fn decode(feed: Feed, payload: &[u8]) -> Result<Self> {
        Ok(match feed {
            Feed::Offers => ReplicaEvent::Offer(decode_envelope(payload)?),
            Feed::Images => ReplicaEvent::Image(decode_envelope(payload)?),
            Feed::Users => ReplicaEvent::User(decode_envelope(payload)?),
        })
    }

    pub fn feed(&self) -> Feed {
        match self {
            ReplicaEvent::Offer(_) => Feed::Offers,
            ReplicaEvent::Image(_) => Feed::Images,
            ReplicaEvent::User(_) => Feed::Users,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            ReplicaEvent::Offer(e) => e.action,
            ReplicaEvent::Image(e) => e.action,
            ReplicaEvent::User(e) => e.action,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            ReplicaEvent::Offer(e) => e.data.id,
            ReplicaEvent::Image(e) => e.data.id,
            ReplicaEvent::User(e) => e.data.id,
        }
    }
}

fn decode_envelope<T: DeserializeOwned>(payload: &[u8]) -> Result<Envelope<T>> {
    let envelope: Envelope<T> = serde_json::from_slice(payload)
        .map_err(|e| ReplicationError::Malformed(e.to_string()))?;

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(ReplicationError::UnsupportedSchema {
            found: envelope.schema_version,
            current: CURRENT_SCHEMA_VERSION,
        });
    }

    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_envelope_without_version_decodes() {
        let payload = br#"{
            "action": "create",
            "timestamp": "2025-03-01 12:00:00.123456",
            "data": {"id": 4, "name": "small", "cpu_count": 1, "price_per_hour": 0.02}
        }"#;

        let event = ReplicaEvent::decode(Feed::Offers, payload).unwrap();
        match event {
            ReplicaEvent::Offer(envelope) => {
                assert_eq!(envelope.schema_version, 1);
                assert_eq!(envelope.action, Action::Create);
                assert_eq!(envelope.data.id, 4);
                assert_eq!(envelope.data.name.as_deref(), Some("small"));
                assert_eq!(envelope.data.memory_size_mib, None);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_missing_id_is_malformed() {
        let payload = br#"{"action": "update", "data": {"name": "x"}}"#;
        let err = ReplicaEvent::decode(Feed::Users, payload).unwrap_err();
        assert!(matches!(err, ReplicationError::Malformed(_)));
    }

    #[test]
    fn test_unknown_action_is_malformed() {
        let payload = br#"{"action": "upsert", "data": {"id": 1}}"#;
        assert!(ReplicaEvent::decode(Feed::Images, payload).is_err());
    }

    #[test]
    fn test_future_schema_is_rejected() {
        let payload = br#"{"schema_version": 2, "action": "delete", "data": {"id": 1}}"#;
        let err = ReplicaEvent::decode(Feed::Images, payload).unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::UnsupportedSchema { found: 2, current: 1 }
        ));
    }

    #[test]
    fn test_serialised_envelope_omits_absent_fields() {
        let envelope = Envelope::new(
            Action::Update,
            UserData {
                id: 9,
                role: Some("admin".to_string()),
                ..UserData::default()
            },
        );
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["schema_version"], 1);
        assert_eq!(json["action"], "update");
        assert_eq!(json["data"], serde_json::json!({"id": 9, "role": "admin"}));
    }

    #[test]
    fn test_queue_names() {
        let exchanges = Exchanges::default();
        assert_eq!(
            exchanges.queue(Feed::Offers, "vm-host"),
            "vm-offer-exchange-vm-host-queue"
        );
        assert_eq!(exchanges.name(Feed::Users), "user-exchange");
    }
}
