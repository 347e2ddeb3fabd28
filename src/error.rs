//! Error taxonomy for the link layer
//!
//! Failures fall into two classes. The fatal class (API misuse, initial
//! connect refusal, failures during the mandatory part of shutdown) means
//! the link is unusable; it is returned as an error rather than aborting
//! the process so embedding callers decide whether to terminate. The
//! transient class (unsolicited disconnects, reconnect and publish/subscribe
//! issue failures) is logged and self-heals through the reconnect policy;
//! it never crosses the public API as a hard failure.

use thiserror::Error;

/// Errors surfaced by [`MqttLink`](crate::MqttLink) operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("link is not initialized")]
    NotInitialized,

    #[error("link is already initialized")]
    AlreadyInitialized,

    #[error("shutdown failed")]
    ShutdownFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("publish failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl LinkError {
    /// Whether this error leaves the link unusable.
    ///
    /// Fatal errors are the fail-fast class: a supervisor should treat them
    /// as terminal rather than retrying. Non-fatal errors are transient and
    /// expected to self-heal through the reconnect policy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::InvalidBrokerUrl(_)
                | LinkError::ConnectionFailed(_)
                | LinkError::NotInitialized
                | LinkError::AlreadyInitialized
                | LinkError::ShutdownFailed(_)
                | LinkError::Config(_)
        )
    }
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;
