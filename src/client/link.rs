//! The link: connection state machine, publish/subscribe surface, and the
//! two I/O execution models
//!
//! A [`MqttLink`] owns one logical broker connection. Application threads
//! publish and subscribe concurrently with the I/O driver delivering
//! transport events; shared state (subscription registry and connected
//! flag) lives under a single [`TimedMutex`], while the delivery counters
//! and the shutting-down flag are atomics written from the event path.
//!
//! The transport event loop can be driven two ways, mutually exclusive:
//! caller-driven ([`poll_once`](MqttLink::poll_once), [`run`](MqttLink::run),
//! [`run_forever`](MqttLink::run_forever)) for applications with their own
//! loop, or a dedicated background task ([`spawn`](MqttLink::spawn)) that
//! also supervises reconnection.

use crate::client::connection::{
    configure_mqtt_options, should_attempt_reconnection, ConnectionState, LastWill, QosLevel,
    ReconnectConfig, ReconnectionDecision,
};
use crate::client::driver::{route_event, validate_subscription_codes, EventRoute};
use crate::client::registry::{MessageCallback, SubscriptionRegistry};
use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::sync::{Signal, TimedMutex};
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use rumqttc::Outgoing;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 10;

/// How long to keep driving the event loop for a queued DISCONNECT to
/// reach the wire during shutdown.
const DISCONNECT_FLUSH_BOUND: Duration = Duration::from_millis(500);

/// State protected by the link's mutex.
struct LinkState {
    connected: bool,
    registry: SubscriptionRegistry,
}

/// State shared between the link handle and the I/O driver.
struct LinkShared {
    state: TimedMutex<LinkState>,
    shutting_down: AtomicBool,
    enqueued: AtomicU64,
    acknowledged: AtomicU64,
    ack_signal: Signal,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl LinkShared {
    fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Uninitialized);
        Self {
            state: TimedMutex::new(LinkState {
                connected: false,
                registry: SubscriptionRegistry::new(),
            }),
            shutting_down: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            ack_signal: Signal::new(),
            state_tx,
            state_rx,
        }
    }
}

/// What the driver loop should do after applying a route.
enum RouteOutcome {
    Continue,
    Connected,
    Reconnect(String),
}

/// Resilient pub/sub client over one logical broker connection.
pub struct MqttLink {
    config: LinkConfig,
    reconnect: ReconnectConfig,
    last_will: Option<LastWill>,
    client: Option<Arc<Mutex<AsyncClient>>>,
    event_loop: Option<EventLoop>,
    driver_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    threaded: bool,
    foreground_attempts: u32,
    shared: Arc<LinkShared>,
}

impl MqttLink {
    /// Create an uninitialized link with the default reconnect policy.
    pub fn new(config: LinkConfig) -> Self {
        Self::with_reconnect(config, ReconnectConfig::default())
    }

    /// Create an uninitialized link with an explicit reconnect policy.
    pub fn with_reconnect(config: LinkConfig, reconnect: ReconnectConfig) -> Self {
        Self {
            config,
            reconnect,
            last_will: None,
            client: None,
            event_loop: None,
            driver_handle: None,
            shutdown_tx: None,
            threaded: false,
            foreground_attempts: 0,
            shared: Arc::new(LinkShared::new()),
        }
    }

    /// Configure the last will. Must precede [`connect`](Self::connect);
    /// the will is fixed in the broker handshake and cannot change once
    /// the transport exists.
    pub fn set_last_will(&mut self, will: LastWill) -> LinkResult<()> {
        if self.client.is_some() {
            return Err(LinkError::AlreadyInitialized);
        }
        self.last_will = Some(will);
        Ok(())
    }

    /// Remove a previously configured last will. Must precede
    /// [`connect`](Self::connect).
    pub fn clear_last_will(&mut self) -> LinkResult<()> {
        if self.client.is_some() {
            return Err(LinkError::AlreadyInitialized);
        }
        self.last_will = None;
        Ok(())
    }

    /// Construct the transport and issue the initial connect request.
    ///
    /// The link moves to [`ConnectionState::Connecting`]; the broker's
    /// acknowledgement arrives once an I/O driver runs. Construction
    /// failures are fatal-kind. Not reentrant: a second `connect` without
    /// an intervening [`shutdown`](Self::shutdown) is rejected.
    pub fn connect(&mut self) -> LinkResult<()> {
        if self.client.is_some() {
            return Err(LinkError::AlreadyInitialized);
        }
        let options = configure_mqtt_options(&self.config, self.last_will.as_ref())?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        self.client = Some(Arc::new(Mutex::new(client)));
        self.event_loop = Some(event_loop);
        self.foreground_attempts = 0;
        self.shared.shutting_down.store(false, Ordering::Release);
        let _ = self.shared.state_tx.send(ConnectionState::Connecting);
        info!(broker = %self.config.broker_url, "link initialized");
        Ok(())
    }

    /// Register a callback for a topic filter.
    ///
    /// Entries are never removed and duplicates coexist; dispatch runs
    /// most-recently-subscribed first. May be called before `connect`;
    /// registrations are (re-)issued to the broker on every connection
    /// acknowledgement. While connected, the subscribe request is issued
    /// under the state lock so no message for the topic can be dispatched
    /// before the entry exists.
    ///
    /// The callback runs on the I/O driver with the state lock held: it
    /// must not block and must not call back into `subscribe` or other
    /// state-lock paths.
    pub async fn subscribe<F>(
        &self,
        topic: impl Into<String>,
        qos: QosLevel,
        callback: F,
    ) -> LinkResult<()>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let mut state = self.shared.state.lock().await;
        if state.connected {
            if let Some(client) = &self.client {
                // Non-waiting issue: the event path needs the state lock
                // held here, so this must never sit on the request channel.
                // A refused request is re-issued on the next connection ack.
                let client = client.lock().await;
                if let Err(e) = client.try_subscribe(&topic, qos.to_mqtt()) {
                    warn!(topic = %topic, "subscribe request failed: {e}");
                }
            }
        }
        state.registry.add(topic, qos, Box::new(callback) as MessageCallback);
        Ok(())
    }

    /// Publish a message.
    ///
    /// Counts the message as enqueued, then issues the publish. Transport
    /// refusals are logged and not propagated; the reconnect policy and the
    /// broker's retransmission rules are expected to recover, and this
    /// layer never retries. Requires an initialized link.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        payload: impl Into<Vec<u8>>,
    ) -> LinkResult<()> {
        let client = match &self.client {
            Some(client) => client.clone(),
            None => return Err(LinkError::NotInitialized),
        };
        let payload = payload.into();
        debug!(topic = %topic, len = payload.len(), "outbound message");
        self.shared.enqueued.fetch_add(1, Ordering::Release);

        let result = {
            let client = client.lock().await;
            client
                .publish_with_properties(
                    topic,
                    qos.to_mqtt(),
                    retain,
                    payload,
                    PublishProperties::default(),
                )
                .await
        };
        match result {
            Ok(()) => {
                if qos == QosLevel::BestEffort {
                    // No broker acknowledgement exists at this level; count
                    // it settled so the shutdown drain only waits on
                    // acknowledged QoS.
                    self.shared.acknowledged.fetch_add(1, Ordering::Release);
                    self.shared.ack_signal.raise();
                }
            }
            Err(e) => warn!(topic = %topic, "publish request failed: {e}"),
        }
        Ok(())
    }

    /// Publish a message whose payload is produced by `format_args!`.
    pub async fn publish_formatted(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        args: fmt::Arguments<'_>,
    ) -> LinkResult<()> {
        let payload = args.to_string();
        self.publish(topic, qos, retain, payload.into_bytes()).await
    }

    /// Move the event loop into a dedicated background task that drives
    /// the transport and supervises reconnection, then wait for the
    /// broker's initial acknowledgement.
    ///
    /// A refused or absent acknowledgement within the startup timeout is a
    /// fatal-kind error: startup is fail-fast, while later disconnects
    /// self-heal. Mutually exclusive with the caller-driven methods.
    pub async fn spawn(&mut self) -> LinkResult<()> {
        let client = match &self.client {
            Some(client) => client.clone(),
            None => return Err(LinkError::NotInitialized),
        };
        let event_loop = self
            .event_loop
            .take()
            .ok_or_else(|| LinkError::ConnectionFailed("event loop already driven".to_string()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::supervisor_loop(
            self.shared.clone(),
            client,
            event_loop,
            self.config.clone(),
            self.last_will.clone(),
            self.reconnect.clone(),
            shutdown_rx,
        ));
        self.driver_handle = Some(handle);
        self.shutdown_tx = Some(shutdown_tx);
        self.threaded = true;

        Self::wait_for_connection_confirmation(
            self.shared.state_rx.clone(),
            self.reconnect.startup_timeout(),
        )
        .await
    }

    /// Drive one event-loop iteration from the caller's own loop.
    ///
    /// Applies at most one transport event to the state machine, handling
    /// reconnection inline. Errors are fatal-kind only (uninitialized link,
    /// reconnect policy exhausted); transient transport trouble is logged
    /// and absorbed.
    pub async fn poll_once(&mut self) -> LinkResult<()> {
        let client = match &self.client {
            Some(client) => client.clone(),
            None => return Err(LinkError::NotInitialized),
        };
        let shared = self.shared.clone();
        let event_loop = self.event_loop.as_mut().ok_or_else(|| {
            LinkError::ConnectionFailed("event loop is owned by the background driver".to_string())
        })?;

        match event_loop.poll().await {
            Ok(event) => match Self::handle_route(&shared, &client, route_event(&event)).await {
                RouteOutcome::Connected => {
                    self.foreground_attempts = 0;
                    Ok(())
                }
                RouteOutcome::Continue => Ok(()),
                RouteOutcome::Reconnect(reason) => self.reestablish_foreground(&reason).await,
            },
            Err(e) => {
                if shared.shutting_down.load(Ordering::Acquire) {
                    return Ok(());
                }
                warn!("transport error: {e}");
                self.reestablish_foreground(&e.to_string()).await
            }
        }
    }

    /// Drive the event loop for a bounded window, then return.
    pub async fn run(&mut self, window: Duration) -> LinkResult<()> {
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match tokio::time::timeout(remaining, self.poll_once()).await {
                Ok(result) => result?,
                Err(_) => return Ok(()),
            }
        }
    }

    /// Drive the event loop until a fatal error occurs. Does not return
    /// under normal operation.
    pub async fn run_forever(&mut self) -> LinkError {
        loop {
            if let Err(e) = self.poll_once().await {
                return e;
            }
        }
    }

    /// Tear the link down without losing in-flight publishes.
    ///
    /// Suppresses further callback side effects, waits (bounded by the
    /// configured drain timeout) for outstanding publish acknowledgements,
    /// then disconnects, stops the background driver if one is running, and
    /// resets the link so it can be re-initialized. The drain is
    /// best-effort: shutdown proceeds once the bound elapses. A transport
    /// failure during the disconnect itself is fatal-kind. Calling
    /// `shutdown` on an uninitialized link is a no-op.
    pub async fn shutdown(&mut self) -> LinkResult<()> {
        if self.client.is_none() {
            return Ok(());
        }
        info!("link shutting down");
        self.shared.shutting_down.store(true, Ordering::Release);
        let _ = self.shared.state_tx.send(ConnectionState::ShuttingDown);

        // Bounded drain: woken by the acknowledgement path, re-checking the
        // counters each wake.
        let deadline = Instant::now() + self.config.drain_timeout();
        loop {
            let enqueued = self.shared.enqueued.load(Ordering::Acquire);
            let acknowledged = self.shared.acknowledged.load(Ordering::Acquire);
            if acknowledged >= enqueued {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    in_flight = enqueued - acknowledged,
                    "drain bound elapsed with publishes still in flight"
                );
                break;
            }
            self.shared.ack_signal.wait_timeout(remaining).await;
        }

        // The disconnect goes out before the driver is told to stop, so the
        // stop signal cannot win the race while the DISCONNECT request is
        // still sitting in the channel. The driver (or, in caller-driven
        // mode, this call) flushes it to the wire; otherwise the broker
        // would see a bare TCP drop and fire the last will on a graceful
        // shutdown.
        let connected = self.shared.state.lock().await.connected;
        if connected {
            if let Some(client) = &self.client {
                let client = client.lock().await;
                // Bounded: with a full request channel and no driver
                // polling, an unbounded send would never return.
                match tokio::time::timeout(DISCONNECT_FLUSH_BOUND, client.disconnect()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(LinkError::ShutdownFailed(Box::new(e))),
                    Err(_) => warn!("disconnect request could not be queued, dropping transport"),
                }
            }
            if let Some(event_loop) = self.event_loop.as_mut() {
                Self::flush_disconnect(event_loop).await;
            }
        }

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        if let Some(mut handle) = self.driver_handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), &mut handle).await {
                Ok(Ok(())) => debug!("link driver stopped cleanly"),
                Ok(Err(e)) if e.is_panic() => warn!("link driver panicked: {e}"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("link driver did not stop in time, aborting");
                    handle.abort();
                    // Collect the join result so a panic inside the driver
                    // is reported instead of silently dropped.
                    if let Err(e) = handle.await {
                        if e.is_panic() {
                            warn!("link driver panicked: {e}");
                        }
                    }
                }
            }
        }

        self.shared.state.lock().await.connected = false;
        self.threaded = false;
        self.client = None;
        self.event_loop = None;
        self.shutdown_tx = None;
        self.shared.shutting_down.store(false, Ordering::Release);
        let _ = self.shared.state_tx.send(ConnectionState::Uninitialized);
        info!("link shut down");
        Ok(())
    }

    /// Whether `connect` has run without a matching `shutdown`.
    pub fn is_initialized(&self) -> bool {
        self.client.is_some()
    }

    /// Whether the broker has acknowledged the current connection.
    pub fn is_connected(&self) -> bool {
        matches!(*self.shared.state_rx.borrow(), ConnectionState::Connected)
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state_rx.borrow().clone()
    }

    /// Whether a background task owns the event loop.
    pub fn runs_in_background(&self) -> bool {
        self.threaded
    }

    /// Messages handed to the transport since the link was created.
    pub fn enqueued_count(&self) -> u64 {
        self.shared.enqueued.load(Ordering::Acquire)
    }

    /// Delivery acknowledgements received since the link was created.
    pub fn acknowledged_count(&self) -> u64 {
        self.shared.acknowledged.load(Ordering::Acquire)
    }

    /// Publishes not yet acknowledged. Zero means nothing is in flight.
    pub fn in_flight(&self) -> u64 {
        self.enqueued_count()
            .saturating_sub(self.acknowledged_count())
    }

    /// Registered topic filters in dispatch order (most recent first).
    pub async fn subscription_topics(&self) -> Vec<String> {
        self.shared.state.lock().await.registry.topics()
    }

    /// Apply one routed transport event to the state machine.
    ///
    /// This is the seam both I/O drivers feed. It is public so a custom
    /// driver loop (or a test) can push events through the same path.
    /// No-op before `connect`.
    pub async fn apply_route(&self, route: EventRoute) {
        let client = match &self.client {
            Some(client) => client.clone(),
            None => return,
        };
        Self::handle_route(&self.shared, &client, route).await;
    }

    /// State-machine core shared by both drivers.
    async fn handle_route(
        shared: &LinkShared,
        client: &Mutex<AsyncClient>,
        route: EventRoute,
    ) -> RouteOutcome {
        match route {
            EventRoute::ConnectionAcknowledged => {
                if shared.shutting_down.load(Ordering::Acquire) {
                    return RouteOutcome::Continue;
                }
                info!("broker connection established");
                let mut state = shared.state.lock().await;
                state.connected = true;
                // Re-issue every registration, most recent first, before any
                // message for those topics can be dispatched. Must not wait
                // on the request channel: this runs inside the event driver,
                // so nothing is draining that channel until we return.
                {
                    let client = client.lock().await;
                    for sub in state.registry.iter() {
                        match client.try_subscribe(sub.topic(), sub.qos().to_mqtt()) {
                            Ok(()) => debug!(topic = sub.topic(), "subscribed"),
                            Err(e) => warn!(topic = sub.topic(), "subscribe failed: {e}"),
                        }
                    }
                }
                drop(state);
                let _ = shared.state_tx.send(ConnectionState::Connected);
                RouteOutcome::Connected
            }
            EventRoute::MessageReceived { topic, payload, .. } => {
                if shared.shutting_down.load(Ordering::Acquire) {
                    return RouteOutcome::Continue;
                }
                debug!(topic = %topic, len = payload.len(), "inbound message");
                let state = shared.state.lock().await;
                if state.registry.dispatch(&topic, &payload) == 0 {
                    trace!(topic = %topic, "no matching subscription");
                }
                RouteOutcome::Continue
            }
            EventRoute::PublishAcknowledged { packet_id } => {
                trace!(packet_id, "publish acknowledged");
                shared.acknowledged.fetch_add(1, Ordering::Release);
                shared.ack_signal.raise();
                RouteOutcome::Continue
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                match validate_subscription_codes(&return_codes) {
                    Ok(()) => trace!(packet_id, "subscription confirmed"),
                    Err(reason) => warn!(packet_id, "{reason}"),
                }
                RouteOutcome::Continue
            }
            EventRoute::Disconnected => {
                if shared.shutting_down.load(Ordering::Acquire) {
                    return RouteOutcome::Continue;
                }
                RouteOutcome::Reconnect("broker disconnected".to_string())
            }
            EventRoute::InfrastructureEvent(event) => {
                trace!("transport event: {event}");
                RouteOutcome::Continue
            }
            EventRoute::OutgoingEvent => RouteOutcome::Continue,
        }
    }

    async fn mark_disconnected(shared: &LinkShared, reason: &str) {
        shared.state.lock().await.connected = false;
        let _ = shared
            .state_tx
            .send(ConnectionState::Disconnected(reason.to_string()));
    }

    /// Background driver: polls the event loop, applies routes, and
    /// supervises reconnection until the shutdown channel fires.
    async fn supervisor_loop(
        shared: Arc<LinkShared>,
        client: Arc<Mutex<AsyncClient>>,
        mut event_loop: EventLoop,
        config: LinkConfig,
        last_will: Option<LastWill>,
        reconnect: ReconnectConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("link driver started");
        let mut attempts = 0u32;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("shutdown signal received, stopping link driver");
                        if shared.state.lock().await.connected {
                            Self::flush_disconnect(&mut event_loop).await;
                        }
                        break;
                    }
                }
                event = event_loop.poll() => {
                    let reason = match event {
                        Ok(event) => {
                            match Self::handle_route(&shared, &client, route_event(&event)).await {
                                RouteOutcome::Connected => {
                                    attempts = 0;
                                    continue;
                                }
                                RouteOutcome::Continue => continue,
                                RouteOutcome::Reconnect(reason) => reason,
                            }
                        }
                        Err(e) => {
                            if shared.shutting_down.load(Ordering::Acquire) {
                                break;
                            }
                            warn!("transport error: {e}");
                            e.to_string()
                        }
                    };
                    if !Self::reestablish(
                        &shared,
                        &client,
                        &mut event_loop,
                        &mut attempts,
                        &config,
                        last_will.as_ref(),
                        &reconnect,
                        &mut shutdown_rx,
                        &reason,
                    )
                    .await
                    {
                        break;
                    }
                }
            }
        }
        info!("link driver stopped");
    }

    /// Run one pass of the reconnect policy in the background driver.
    /// Returns false when the driver should stop.
    #[allow(clippy::too_many_arguments)]
    async fn reestablish(
        shared: &LinkShared,
        client: &Mutex<AsyncClient>,
        event_loop: &mut EventLoop,
        attempts: &mut u32,
        config: &LinkConfig,
        last_will: Option<&LastWill>,
        reconnect: &ReconnectConfig,
        shutdown_rx: &mut watch::Receiver<bool>,
        reason: &str,
    ) -> bool {
        Self::mark_disconnected(shared, reason).await;

        let shutdown_requested =
            *shutdown_rx.borrow() || shared.shutting_down.load(Ordering::Acquire);
        match should_attempt_reconnection(*attempts, reconnect, shutdown_requested) {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *attempts = attempt;
                let _ = shared.state_tx.send(ConnectionState::Reconnecting(attempt));
                let max_display = reconnect
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                warn!("reconnecting ({attempt}/{max_display}) after {delay_ms} ms: {reason}");

                if !Self::interruptible_sleep(shutdown_rx, delay_ms).await {
                    return false;
                }
                if *shutdown_rx.borrow() {
                    return false;
                }

                // Fresh transport incarnation; a stale session on the broker
                // must not collide with the new one.
                match configure_mqtt_options(config, last_will) {
                    Ok(options) => {
                        let (new_client, new_event_loop) =
                            AsyncClient::new(options, REQUEST_CAPACITY);
                        *event_loop = new_event_loop;
                        *client.lock().await = new_client;
                        true
                    }
                    Err(e) => {
                        error!("failed to rebuild transport: {e}");
                        true // keep retrying on the next pass
                    }
                }
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("shutdown requested, abandoning reconnect");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "max reconnection attempts ({}) exceeded",
                    reconnect.max_attempts.unwrap_or(0)
                );
                error!("{reason}");
                let _ = shared
                    .state_tx
                    .send(ConnectionState::PermanentlyDisconnected(reason));
                false
            }
        }
    }

    /// Reconnect pass for the caller-driven mode.
    async fn reestablish_foreground(&mut self, reason: &str) -> LinkResult<()> {
        Self::mark_disconnected(&self.shared, reason).await;

        let shutdown_requested = self.shared.shutting_down.load(Ordering::Acquire);
        match should_attempt_reconnection(
            self.foreground_attempts,
            &self.reconnect,
            shutdown_requested,
        ) {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.foreground_attempts = attempt;
                let _ = self
                    .shared
                    .state_tx
                    .send(ConnectionState::Reconnecting(attempt));
                warn!("reconnecting ({attempt}) after {delay_ms} ms: {reason}");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                let options = configure_mqtt_options(&self.config, self.last_will.as_ref())?;
                let (new_client, new_event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
                if let Some(client) = &self.client {
                    *client.lock().await = new_client;
                }
                self.event_loop = Some(new_event_loop);
                Ok(())
            }
            ReconnectionDecision::AbortShutdownRequested => Ok(()),
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "max reconnection attempts ({}) exceeded",
                    self.reconnect.max_attempts.unwrap_or(0)
                );
                let _ = self
                    .shared
                    .state_tx
                    .send(ConnectionState::PermanentlyDisconnected(reason.clone()));
                Err(LinkError::ConnectionFailed(reason))
            }
        }
    }

    /// Drive the event loop briefly so a queued DISCONNECT reaches the
    /// wire before the transport is dropped. Bounded; gives up on any
    /// transport error.
    async fn flush_disconnect(event_loop: &mut EventLoop) {
        let deadline = Instant::now() + DISCONNECT_FLUSH_BOUND;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("disconnect was not flushed before the stop deadline");
                return;
            }
            match tokio::time::timeout(remaining, event_loop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => {
                    debug!("disconnect flushed to the broker");
                    return;
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => return,
            }
        }
    }

    /// Sleep that aborts early on the shutdown signal. Returns false when
    /// shutdown was requested.
    async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Wait for the broker to acknowledge the initial connect.
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> LinkResult<()> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                {
                    let state = state_rx.borrow();
                    match &*state {
                        ConnectionState::Connected => return Ok(()),
                        ConnectionState::Disconnected(reason) => {
                            return Err(LinkError::ConnectionFailed(reason.clone()));
                        }
                        ConnectionState::PermanentlyDisconnected(reason) => {
                            return Err(LinkError::ConnectionFailed(format!(
                                "permanently disconnected: {reason}"
                            )));
                        }
                        _ => {}
                    }
                }
                if state_rx.changed().await.is_err() {
                    return Err(LinkError::ConnectionFailed(
                        "state channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(LinkError::ConnectionFailed(
                "no connection acknowledgement before startup timeout".to_string(),
            )),
        }
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        // Stop the background driver; graceful teardown needs an explicit
        // shutdown() call, which cannot happen in Drop.
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.driver_handle.take() {
            handle.abort();
        }
    }
}
