//! Pure MQTT event routing for the I/O driver
//!
//! Both execution models (caller-driven polling and the background task)
//! funnel rumqttc events through [`route_event`] and hand the resulting
//! [`EventRoute`] to the state machine. Keeping the routing pure makes the
//! state machine drivable from tests without a broker.

use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;

/// Routing decision for one transport event.
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Broker acknowledged the connection - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// Broker acknowledged delivery of a published message
    PublishAcknowledged { packet_id: u16 },
    /// Subscription confirmed with return codes
    SubscriptionConfirmed {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    /// Broker initiated a disconnect
    Disconnected,
    /// Housekeeping event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled by the transport)
    OutgoingEvent,
}

/// Map a transport event to its route.
pub fn route_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.to_vec(),
                retain: publish.retain,
            },
            // QoS 1 completes on PubAck, QoS 2 on PubComp; each counts one
            // delivery acknowledgement.
            Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                packet_id: puback.pkid,
            },
            Packet::PubComp(pubcomp) => EventRoute::PublishAcknowledged {
                packet_id: pubcomp.pkid,
            },
            Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                packet_id: suback.pkid,
                return_codes: suback
                    .return_codes
                    .iter()
                    .map(subscription_reason_byte)
                    .collect(),
            },
            Packet::Disconnect(_) => EventRoute::Disconnected,
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}

/// Reduce a SubAck reason code to its wire byte: granted QoS below 0x80,
/// refusals at or above it.
fn subscription_reason_byte(code: &SubscribeReasonCode) -> u8 {
    match code {
        SubscribeReasonCode::Success(qos) => *qos as u8,
        SubscribeReasonCode::NotAuthorized => 0x87,
        SubscribeReasonCode::TopicFilterInvalid => 0x8f,
        SubscribeReasonCode::QuotaExceeded => 0x97,
        _ => 0x80,
    }
}

/// Validate subscription success from SubAck return codes.
pub fn validate_subscription_codes(return_codes: &[u8]) -> Result<(), String> {
    if return_codes.iter().any(|&code| code >= 0x80) {
        Err(format!(
            "subscription failed with return codes: {return_codes:?}"
        ))
    } else {
        Ok(())
    }
}
