//! Connection session: one logical realtime connection with automatic
//! reconnection.
//!
//! The session owns a background worker task per connection attempt chain.
//! The worker opens a transport through the configured [`Connector`],
//! dispatches inbound frames to the [`EventRegistry`] and, when the transport
//! closes, schedules the next attempt according to the [`ReconnectPolicy`].
//! Every transport open starts a new epoch; work and outbound channels from a
//! retired epoch are discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialStore;
use crate::realtime::proto::{
    InboundMessage, OutboundMessage, CONNECTED, DISCONNECTED, ERROR, MESSAGE, RECONNECTING,
};
use crate::realtime::registry::EventRegistry;
use crate::realtime::transport::{Connector, TransportEvent, TransportLink};
use crate::retry::{ReconnectPolicy, ReconnectState};

/// Production realtime endpoint.
pub const REALTIME_ENDPOINT: &str = "wss://api.colabtrack.io/ws";
/// Local development realtime endpoint.
pub const LOCAL_REALTIME_ENDPOINT: &str = "ws://localhost:3000/ws";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Realtime connection settings.
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    /// `REAL_TIME_UPDATES` feature flag. When false, `connect` never opens a
    /// transport.
    pub real_time_updates: bool,
    /// Backoff schedule applied after the transport closes.
    pub reconnect: ReconnectPolicy,
    /// Upper bound for the websocket handshake.
    pub connect_timeout: Duration,
    local: bool,
    endpoint_override: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            real_time_updates: true,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            local: false,
            endpoint_override: None,
        }
    }
}

impl RealtimeConfig {
    /// Enables or disables local mode endpoint routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit endpoint. The override takes precedence over local
    /// mode.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    /// Toggles the realtime updates feature flag.
    pub fn with_real_time_updates(mut self, enabled: bool) -> Self {
        self.real_time_updates = enabled;
        self
    }

    /// Overrides the reconnect backoff schedule.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Overrides the websocket handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Endpoint used for new connections, without the token query.
    pub fn endpoint(&self) -> &str {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint;
        }
        if self.local {
            LOCAL_REALTIME_ENDPOINT
        } else {
            REALTIME_ENDPOINT
        }
    }
}

/// Appends the bearer token to `endpoint` as the `token` query parameter.
pub fn build_connection_url(endpoint: &str, token: &str) -> String {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{endpoint}{separator}token={}", urlencoding::encode(token))
}

/// Lifecycle of a [`ConnectionSession`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    /// `connect` has never opened anything.
    #[default]
    Idle,
    /// A transport open is in flight.
    Connecting,
    /// Frames flow in both directions.
    Open,
    /// The last transport closed; a retry may be pending.
    Closed,
}

/// Owns the realtime transport and its reconnection policy.
///
/// Methods are synchronous and never block on the network; `connect` must be
/// called from within a Tokio runtime. Dropping the session disconnects it.
pub struct ConnectionSession {
    shared: Arc<Shared>,
}

struct Shared {
    config: RealtimeConfig,
    credentials: Arc<dyn CredentialStore>,
    connector: Arc<dyn Connector>,
    registry: EventRegistry,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    status: ConnectionState,
    epoch: u64,
    reconnect: ReconnectState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    worker: Option<JoinHandle<()>>,
}

impl SessionState {
    fn begin_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.status = ConnectionState::Connecting;
        self.outbound = None;
        self.epoch
    }
}

enum LinkOutcome {
    Closed,
    Superseded,
}

impl ConnectionSession {
    /// Creates an idle session. Nothing is opened until [`ConnectionSession::connect`].
    pub fn new(
        config: RealtimeConfig,
        credentials: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
        registry: EventRegistry,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                credentials,
                connector,
                registry,
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Returns the session configuration.
    pub fn config(&self) -> &RealtimeConfig {
        &self.shared.config
    }

    /// Returns the registry events are dispatched to.
    pub fn registry(&self) -> &EventRegistry {
        &self.shared.registry
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.lock_state().status
    }

    /// Returns true while the transport is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Current connection epoch. Incremented for every transport open and
    /// when `disconnect` retires the active one.
    pub fn epoch(&self) -> u64 {
        self.shared.lock_state().epoch
    }

    /// Consecutive reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock_state().reconnect.attempts()
    }

    /// Opens the realtime connection in the background.
    ///
    /// No-op when realtime updates are disabled, when no token is available,
    /// or when a connection is already open or in flight.
    pub fn connect(&self) {
        if !self.shared.config.real_time_updates {
            debug!(event = "realtime_disabled");
            return;
        }

        let mut state = self.shared.lock_state();
        if matches!(
            state.status,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            debug!(event = "realtime_connect_ignored", status = ?state.status);
            return;
        }

        let Some(url) = self.shared.connection_url() else {
            warn!(
                event = "realtime_missing_token",
                "no auth token available for realtime connection"
            );
            return;
        };

        let epoch = state.begin_epoch();
        if let Some(previous) = state.worker.take() {
            previous.abort();
        }
        let shared = Arc::clone(&self.shared);
        state.worker = Some(tokio::spawn(run_worker(shared, epoch, url)));
    }

    /// Sends `{event, data}` when the connection is open. Otherwise the
    /// message is dropped with a warning.
    pub fn send(&self, event: &str, data: Value) {
        let state = self.shared.lock_state();
        let outbound = match (state.status, state.outbound.as_ref()) {
            (ConnectionState::Open, Some(outbound)) => outbound,
            _ => {
                warn!(
                    event = "realtime_send_dropped",
                    name = event,
                    "realtime connection not open, message not sent"
                );
                return;
            }
        };

        let text = match OutboundMessage::new(event, data).to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "realtime_send_dropped", name = event, error = %err);
                return;
            }
        };

        if outbound.send(text).is_err() {
            warn!(
                event = "realtime_send_dropped",
                name = event,
                "transport already closed"
            );
        }
    }

    /// Tears the connection down and suppresses automatic reconnection.
    ///
    /// Safe to call repeatedly. Emits `disconnected` when a connection was
    /// open or in flight.
    pub fn disconnect(&self) {
        let (was_live, worker) = {
            let mut state = self.shared.lock_state();
            let was_live = matches!(
                state.status,
                ConnectionState::Connecting | ConnectionState::Open
            );
            state.epoch += 1;
            state.outbound = None;
            if state.status != ConnectionState::Idle {
                state.status = ConnectionState::Closed;
            }
            (was_live, state.worker.take())
        };

        if let Some(worker) = worker {
            worker.abort();
        }

        if was_live {
            info!(event = "realtime_disconnected", reason = "requested");
            self.shared.registry.emit(DISCONNECTED, &Value::Null);
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("ConnectionSession")
            .field("endpoint", &self.shared.config.endpoint())
            .field("status", &state.status)
            .field("epoch", &state.epoch)
            .field("reconnect_attempts", &state.reconnect.attempts())
            .finish()
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock_state().epoch == epoch
    }

    fn connection_url(&self) -> Option<String> {
        let token = self.credentials.token()?;
        let token = token.expose_secret();
        if token.is_empty() {
            return None;
        }
        Some(build_connection_url(self.config.endpoint(), token))
    }

    async fn drive_link(&self, epoch: u64, link: TransportLink) -> LinkOutcome {
        let TransportLink {
            outbound,
            mut inbound,
        } = link;

        {
            let mut state = self.lock_state();
            if state.epoch != epoch {
                return LinkOutcome::Superseded;
            }
            state.status = ConnectionState::Open;
            state.reconnect.reset();
            state.outbound = Some(outbound);
        }

        info!(event = "realtime_connected", epoch);
        self.registry.emit(CONNECTED, &Value::Null);

        loop {
            let next = inbound.recv().await;
            if !self.is_current(epoch) {
                return LinkOutcome::Superseded;
            }
            match next {
                Some(TransportEvent::Text(text)) => self.dispatch_frame(&text),
                Some(TransportEvent::Error(detail)) => {
                    error!(event = "realtime_transport_error", epoch, error = %detail);
                    self.registry.emit(ERROR, &json!({ "message": detail }));
                }
                Some(TransportEvent::Closed) | None => return LinkOutcome::Closed,
            }
        }
    }

    fn dispatch_frame(&self, text: &str) {
        let message = match InboundMessage::from_text(text) {
            Ok(message) => message,
            Err(err) => {
                error!(
                    event = "realtime_frame_dropped",
                    len = text.len(),
                    error = %err
                );
                return;
            }
        };

        match message.event.as_deref() {
            Some(event) => self.registry.emit(event, &message.data),
            None => debug!(event = "realtime_frame_unnamed", len = text.len()),
        }
        self.registry.emit(MESSAGE, &message.envelope());
    }

    /// Moves the epoch to `Closed`. Returns false when the epoch is stale.
    fn mark_closed(&self, epoch: u64) -> bool {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            return false;
        }
        state.status = ConnectionState::Closed;
        state.outbound = None;
        true
    }

    fn schedule_reconnect(&self, epoch: u64) -> Option<(u32, Duration)> {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            return None;
        }

        let Some(delay) = state.reconnect.next_delay(&self.config.reconnect) else {
            error!(
                event = "realtime_reconnect_exhausted",
                max_attempts = self.config.reconnect.max_attempts,
                "max reconnection attempts reached"
            );
            return None;
        };

        let attempt = state.reconnect.attempts();
        info!(
            event = "realtime_reconnect_scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64
        );
        Some((attempt, delay))
    }

    fn begin_reconnect(&self, epoch: u64) -> Option<(u64, String)> {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            return None;
        }
        let Some(url) = self.connection_url() else {
            warn!(
                event = "realtime_missing_token",
                "auth token gone, reconnection stopped"
            );
            return None;
        };
        Some((state.begin_epoch(), url))
    }
}

async fn run_worker(shared: Arc<Shared>, mut epoch: u64, mut url: String) {
    loop {
        let outcome = match shared.connector.open(url).await {
            Ok(link) => shared.drive_link(epoch, link).await,
            Err(err) => {
                if !shared.is_current(epoch) {
                    return;
                }
                warn!(event = "realtime_connect_failed", epoch, error = %err);
                shared
                    .registry
                    .emit(ERROR, &json!({ "message": err.to_string() }));
                LinkOutcome::Closed
            }
        };

        if matches!(outcome, LinkOutcome::Superseded) || !shared.mark_closed(epoch) {
            return;
        }
        info!(event = "realtime_disconnected", epoch);
        shared.registry.emit(DISCONNECTED, &Value::Null);

        let Some((attempt, delay)) = shared.schedule_reconnect(epoch) else {
            return;
        };
        shared.registry.emit(
            RECONNECTING,
            &json!({ "attempt": attempt, "delay_ms": delay.as_millis() as u64 }),
        );

        tokio::time::sleep(delay).await;

        match shared.begin_reconnect(epoch) {
            Some((next_epoch, next_url)) => {
                epoch = next_epoch;
                url = next_url;
            }
            None => return,
        }
    }
}
