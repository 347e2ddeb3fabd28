//! Integration tests for the link lifecycle over the public API
//!
//! Exercises initialization, subscription registration, event routing,
//! delivery accounting, and graceful shutdown without a live broker:
//! transport events are pushed through `MqttLink::apply_route`, the same
//! seam both I/O drivers feed.

use mqttlink::{
    ConnectionState, EventRoute, LastWill, LinkConfig, LinkError, MqttLink, QosLevel,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn test_config() -> LinkConfig {
    LinkConfig::for_broker("mqtt://localhost:1883")
}

#[tokio::test]
async fn lifecycle_connect_ack_shutdown() {
    let mut link = MqttLink::new(test_config());
    assert_eq!(link.connection_state(), ConnectionState::Uninitialized);

    link.connect().expect("connect should succeed");
    assert_eq!(link.connection_state(), ConnectionState::Connecting);
    assert!(!link.is_connected());

    link.apply_route(EventRoute::ConnectionAcknowledged).await;
    assert_eq!(link.connection_state(), ConnectionState::Connected);

    link.shutdown().await.expect("shutdown should succeed");
    assert_eq!(link.connection_state(), ConnectionState::Uninitialized);
    assert!(!link.is_initialized());
}

#[tokio::test]
async fn subscriptions_survive_shutdown_and_reinit() {
    let mut link = MqttLink::new(test_config());
    link.subscribe("sensors/+/temp", QosLevel::Acknowledged, |_, _| {})
        .await
        .unwrap();
    link.subscribe("alerts", QosLevel::ExactlyOnce, |_, _| {})
        .await
        .unwrap();

    link.connect().unwrap();
    link.apply_route(EventRoute::ConnectionAcknowledged).await;
    link.shutdown().await.unwrap();

    // Registrations are permanent for the life of the link; a second
    // connection re-issues them on its acknowledgement.
    assert_eq!(
        link.subscription_topics().await,
        vec!["alerts", "sensors/+/temp"]
    );
    link.connect().unwrap();
    link.apply_route(EventRoute::ConnectionAcknowledged).await;
    assert!(link.is_connected());
}

#[tokio::test]
async fn wildcard_filter_dispatches_concrete_topic() {
    let mut link = MqttLink::new(test_config());
    link.connect().unwrap();

    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    link.subscribe("status/#", QosLevel::BestEffort, move |topic, payload| {
        sink.lock()
            .unwrap()
            .push(format!("{topic}={}", String::from_utf8_lossy(payload)));
    })
    .await
    .unwrap();

    link.apply_route(EventRoute::ConnectionAcknowledged).await;
    link.apply_route(EventRoute::MessageReceived {
        topic: "status/42".to_string(),
        payload: b"ok".to_vec(),
        retain: false,
    })
    .await;
    link.apply_route(EventRoute::MessageReceived {
        topic: "telemetry/42".to_string(),
        payload: b"ignored".to_vec(),
        retain: false,
    })
    .await;

    assert_eq!(*received.lock().unwrap(), vec!["status/42=ok"]);
}

#[tokio::test]
async fn duplicate_filters_both_fire_most_recent_first() {
    let mut link = MqttLink::new(test_config());
    link.connect().unwrap();

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let first = order.clone();
    let second = order.clone();
    link.subscribe("dup", QosLevel::BestEffort, move |_, _| {
        first.lock().unwrap().push("first");
    })
    .await
    .unwrap();
    link.subscribe("dup", QosLevel::BestEffort, move |_, _| {
        second.lock().unwrap().push("second");
    })
    .await
    .unwrap();

    link.apply_route(EventRoute::ConnectionAcknowledged).await;
    link.apply_route(EventRoute::MessageReceived {
        topic: "dup".to_string(),
        payload: b"x".to_vec(),
        retain: false,
    })
    .await;

    assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
}

#[tokio::test]
async fn best_effort_publishes_never_block_shutdown() {
    let mut link = MqttLink::new(test_config());
    link.connect().unwrap();

    for i in 0..5 {
        link.publish_formatted("metrics", QosLevel::BestEffort, false, format_args!("{i}"))
            .await
            .unwrap();
    }
    assert_eq!(link.enqueued_count(), 5);
    assert_eq!(link.in_flight(), 0);

    let start = Instant::now();
    link.shutdown().await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn shutdown_waits_out_drain_bound_for_unacked_publishes() {
    let mut config = test_config();
    config.drain_timeout_ms = 200;
    let mut link = MqttLink::new(config);
    link.connect().unwrap();

    link.publish("jobs", QosLevel::Acknowledged, false, "pending")
        .await
        .unwrap();
    assert_eq!(link.in_flight(), 1);

    let start = Instant::now();
    link.shutdown().await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "took {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn operations_on_uninitialized_link() {
    let mut link = MqttLink::new(test_config());

    let error = link
        .publish("t", QosLevel::Acknowledged, false, "m")
        .await
        .unwrap_err();
    assert!(matches!(error, LinkError::NotInitialized));

    // Subscribe is allowed before connect; shutdown is a no-op.
    link.subscribe("early", QosLevel::BestEffort, |_, _| {})
        .await
        .unwrap();
    link.shutdown().await.unwrap();
    assert_eq!(link.subscription_topics().await, vec!["early"]);
}

#[tokio::test]
async fn last_will_is_fixed_once_connected() {
    let mut link = MqttLink::new(test_config());
    link.set_last_will(LastWill::new(
        "status/link",
        "offline",
        QosLevel::Acknowledged,
        true,
    ))
    .unwrap();

    link.connect().unwrap();
    let error = link
        .set_last_will(LastWill::new("too", "late", QosLevel::BestEffort, false))
        .unwrap_err();
    assert!(matches!(error, LinkError::AlreadyInitialized));
}

#[tokio::test]
async fn retained_messages_dispatch_like_live_ones() {
    let mut link = MqttLink::new(test_config());
    link.connect().unwrap();

    let seen = Arc::new(Mutex::new(0usize));
    let sink = seen.clone();
    link.subscribe("retained/topic", QosLevel::BestEffort, move |_, _| {
        *sink.lock().unwrap() += 1;
    })
    .await
    .unwrap();

    link.apply_route(EventRoute::ConnectionAcknowledged).await;
    link.apply_route(EventRoute::MessageReceived {
        topic: "retained/topic".to_string(),
        payload: b"state".to_vec(),
        retain: true,
    })
    .await;
    assert_eq!(*seen.lock().unwrap(), 1);
}
