//! Replicated reference data for the host agent.
//!
//! Offers, boot images and users are owned by other services and arrive on
//! three independent fanout feeds. This crate decodes them, applies them to
//! local replica tables and keeps one supervised consumer task per feed.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod broker;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod publisher;
pub mod store;

pub use broker::{Broker, Delivery, MemoryBroker, Subscription};
pub use consumer::{spawn_all, spawn_feed, FeedConsumer, RestartPolicy};
pub use envelope::{
    Action, Envelope, Exchanges, Feed, ImageData, OfferData, ReplicaEvent, UserData,
    CURRENT_SCHEMA_VERSION,
};
pub use error::{ReplicationError, Result};
pub use publisher::Publisher;
pub use store::{Applied, ImageRecord, OfferRecord, ReplicaStore, UserRecord};
