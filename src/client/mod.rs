//! Resilient MQTT client: state machine, registry, and I/O drivers

pub mod connection;
pub mod driver;
pub mod link;
pub mod registry;

pub use connection::{ConnectionState, LastWill, QosLevel, ReconnectConfig};
pub use driver::EventRoute;
pub use link::MqttLink;
pub use registry::{topic_matches_filter, MessageCallback, SubscriptionRegistry};
