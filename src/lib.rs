//! mqttlink: a resilient MQTT publish/subscribe layer
//!
//! Wraps a single logical broker connection behind a small, thread-safe
//! surface: publish with per-message delivery guarantees, subscribe
//! callbacks keyed by topic filter, and a graceful shutdown that drains
//! in-flight publishes before disconnecting. Connection loss after startup
//! is absorbed by an automatic reconnect policy that re-issues every
//! subscription once the broker acknowledges the new connection.
//!
//! The transport event loop can be driven from the caller's own loop
//! ([`MqttLink::poll_once`], [`MqttLink::run`], [`MqttLink::run_forever`])
//! or handed to a dedicated background task ([`MqttLink::spawn`]).
//!
//! ```no_run
//! use mqttlink::{LinkConfig, MqttLink, QosLevel};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut link = MqttLink::new(LinkConfig::for_broker("mqtt://localhost:1883"));
//!
//!     link.subscribe("status/#", QosLevel::BestEffort, |topic, payload| {
//!         println!("{topic}: {}", String::from_utf8_lossy(payload));
//!     })
//!     .await?;
//!
//!     link.connect()?;
//!     link.spawn().await?;
//!
//!     link.publish("status/42", QosLevel::Acknowledged, false, "ok")
//!         .await?;
//!
//!     link.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod sync;

pub use client::{
    topic_matches_filter, ConnectionState, EventRoute, LastWill, MqttLink, QosLevel,
    ReconnectConfig,
};
pub use config::{ConfigError, LinkConfig};
pub use error::{LinkError, LinkResult};
pub use observability::logging::{init_default_logging, init_logging, LogFormat};
pub use sync::{lock_timeout, set_lock_timeout, Signal, TimedMutex};
