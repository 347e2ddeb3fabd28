//! Connection state, reconnect policy, and transport options
//!
//! Pure types and functions behind the connection state machine: the state
//! enum published over the watch channel, the quality-of-service and
//! last-will configuration, the reconnect backoff policy, and construction
//! of rumqttc options from a [`LinkConfig`].

use crate::config::LinkConfig;
use crate::error::LinkError;
use rumqttc::v5::mqttbytes::v5::LastWill as MqttLastWill;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Connection state of a link, observable via
/// [`MqttLink::connection_state`](crate::MqttLink::connection_state).
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No transport exists; `connect` has not run (or shutdown completed).
    Uninitialized,
    /// Transport constructed, awaiting broker acknowledgement.
    Connecting,
    /// Broker acknowledged the connection; operations flow.
    Connected,
    /// Connection lost, with reason.
    Disconnected(String),
    /// Reconnect in progress (attempt count).
    Reconnecting(u32),
    /// Shutdown initiated; callbacks are suppressed.
    ShuttingDown,
    /// Reconnect policy exhausted; the link will not recover on its own.
    PermanentlyDisconnected(String),
}

/// Delivery guarantee for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QosLevel {
    /// Fire and forget; the broker never acknowledges (MQTT QoS 0).
    BestEffort,
    /// Delivered at least once, broker acks each message (MQTT QoS 1).
    Acknowledged,
    /// Delivered exactly once via the two-phase handshake (MQTT QoS 2).
    ExactlyOnce,
}

impl QosLevel {
    pub(crate) fn to_mqtt(self) -> QoS {
        match self {
            QosLevel::BestEffort => QoS::AtMostOnce,
            QosLevel::Acknowledged => QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Message the broker delivers on the client's behalf if the connection
/// drops unexpectedly. Fixed at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
    pub retain: bool,
}

impl LastWill {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QosLevel,
        retain: bool,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }
}

/// Reconnection policy.
///
/// Disconnects after a successful startup are expected and self-healing:
/// the driver retries on this schedule until the connection comes back or
/// `max_attempts` is exhausted.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds, walked once per attempt
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,                       // retry forever by default
            backoff_pattern: vec![100, 250, 500, 1000],
            sustained_delay: 1000,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given attempt (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> u64 {
        if self.backoff_pattern.is_empty() {
            self.sustained_delay
        } else {
            let index = (attempt.saturating_sub(1)) as usize;
            *self
                .backoff_pattern
                .get(index)
                .unwrap_or(&self.sustained_delay)
        }
    }

    /// Total worst-case reconnect time; None for unlimited retries.
    pub fn max_total_time(&self) -> Option<u64> {
        self.max_attempts
            .map(|max| (1..=max).map(|a| self.backoff_delay(a)).sum())
    }

    /// How long to wait for the broker's initial acknowledgement before
    /// treating startup as failed.
    pub fn startup_timeout(&self) -> Duration {
        match self.max_total_time() {
            Some(total) => Duration::from_millis(total + 30_000),
            None => Duration::from_secs(60),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }
        if self.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Decide whether another reconnect attempt should run.
pub fn should_attempt_reconnection(
    current_attempts: u32,
    config: &ReconnectConfig,
    shutdown_requested: bool,
) -> ReconnectionDecision {
    if shutdown_requested {
        return ReconnectionDecision::AbortShutdownRequested;
    }

    if let Some(max_attempts) = config.max_attempts {
        if current_attempts >= max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }
    }

    ReconnectionDecision::Proceed {
        attempt: current_attempts + 1,
        delay_ms: config.backoff_delay(current_attempts + 1),
    }
}

/// Build rumqttc options from the link configuration.
///
/// Parses the broker URL, wires TLS for `mqtts://`, resolves credentials
/// from the environment, and applies the last will if one is configured.
pub fn configure_mqtt_options(
    config: &LinkConfig,
    last_will: Option<&LastWill>,
) -> Result<MqttOptions, LinkError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| LinkError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| LinkError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    // Unique client id per transport incarnation so a stale session on the
    // broker never collides with a reconnecting one.
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let client_id = format!("mqttlink-{timestamp}");
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = config.username() {
        mqtt_options.set_credentials(&username, &config.password().unwrap_or_default());
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    if let Some(will) = last_will {
        let lwt = MqttLastWill::new(
            &will.topic,
            will.payload.clone(),
            will.qos.to_mqtt(),
            will.retain,
            None,
        );
        mqtt_options.set_last_will(lwt);
    }

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None); // unlimited by default
        assert_eq!(config.backoff_pattern, vec![100, 250, 500, 1000]);
        assert_eq!(config.sustained_delay, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_delay_walks_pattern_then_sustains() {
        let config = ReconnectConfig::default();

        assert_eq!(config.backoff_delay(1), 100);
        assert_eq!(config.backoff_delay(2), 250);
        assert_eq!(config.backoff_delay(3), 500);
        assert_eq!(config.backoff_delay(4), 1000);

        // Pattern exhausted: sustained delay from here on
        assert_eq!(config.backoff_delay(5), 1000);
        assert_eq!(config.backoff_delay(100), 1000);
    }

    #[test]
    fn test_backoff_delay_empty_pattern_uses_sustained() {
        let config = ReconnectConfig {
            max_attempts: None,
            backoff_pattern: vec![],
            sustained_delay: 400,
        };
        assert_eq!(config.backoff_delay(1), 400);
        assert_eq!(config.backoff_delay(9), 400);
    }

    #[test]
    fn test_max_total_time() {
        let limited = ReconnectConfig {
            max_attempts: Some(4),
            ..Default::default()
        };
        assert_eq!(limited.max_total_time(), Some(100 + 250 + 500 + 1000));
        assert_eq!(ReconnectConfig::default().max_total_time(), None);
    }

    #[test]
    fn test_startup_timeout() {
        assert_eq!(
            ReconnectConfig::default().startup_timeout(),
            Duration::from_secs(60)
        );

        let limited = ReconnectConfig {
            max_attempts: Some(4),
            ..Default::default()
        };
        assert_eq!(
            limited.startup_timeout(),
            Duration::from_millis(100 + 250 + 500 + 1000 + 30_000)
        );
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig::default();

        assert_eq!(
            should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 100
            }
        );
        assert_eq!(
            should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );
        assert_eq!(
            should_attempt_reconnection(6, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 7,
                delay_ms: 1000
            }
        );

        let limited = ReconnectConfig {
            max_attempts: Some(5),
            ..Default::default()
        };
        assert_eq!(
            should_attempt_reconnection(5, &limited, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_validate_rejects_degenerate_configs() {
        let zero_attempts = ReconnectConfig {
            max_attempts: Some(0),
            ..Default::default()
        };
        assert!(zero_attempts.validate().is_err());

        let zero_delay = ReconnectConfig {
            sustained_delay: 0,
            ..Default::default()
        };
        assert!(zero_delay.validate().is_err());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(QosLevel::BestEffort.to_mqtt(), QoS::AtMostOnce);
        assert_eq!(QosLevel::Acknowledged.to_mqtt(), QoS::AtLeastOnce);
        assert_eq!(QosLevel::ExactlyOnce.to_mqtt(), QoS::ExactlyOnce);
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = LinkConfig::for_broker("mqtt://localhost:1883");
        assert!(configure_mqtt_options(&config, None).is_ok());

        let tls = LinkConfig::for_broker("mqtts://broker.example.net");
        assert!(configure_mqtt_options(&tls, None).is_ok());
    }

    #[test]
    fn test_configure_mqtt_options_with_last_will() {
        let config = LinkConfig::for_broker("mqtt://localhost:1883");
        let will = LastWill::new("status/client", "offline", QosLevel::Acknowledged, true);
        assert!(configure_mqtt_options(&config, Some(&will)).is_ok());
    }

    #[test]
    fn test_configure_rejects_invalid_url() {
        let config = LinkConfig::for_broker("not-a-url");
        assert!(matches!(
            configure_mqtt_options(&config, None),
            Err(LinkError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_connection_state_equality() {
        assert_eq!(ConnectionState::Connected, ConnectionState::Connected);
        assert_eq!(
            ConnectionState::Disconnected("reason".to_string()),
            ConnectionState::Disconnected("reason".to_string())
        );
        assert_ne!(
            ConnectionState::Connected,
            ConnectionState::Reconnecting(1)
        );
    }
}
