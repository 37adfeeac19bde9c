//! Broker session ownership and connectivity tracking.
//!
//! [`ConnectionManager`] owns the only mutable copy of [`ConnectionState`].
//! The transport's event loop reports lifecycle events through
//! [`ConnectionManager::on_connect_result`] and
//! [`ConnectionManager::on_disconnect`]; everything else only observes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConfigError;

/// Capacity of the request channel between the client handle and the event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Pause before polling the event loop again after a transport error.
/// The next poll performs rumqttc's implicit reconnect.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connectivity of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// Why an established (or establishing) session went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The publisher sent DISCONNECT itself.
    Requested,
    /// The broker closed the session.
    Broker,
    /// The transport failed (I/O error, keepalive timeout, ...).
    Transport(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "requested by client"),
            DisconnectReason::Broker => write!(f, "closed by broker"),
            DisconnectReason::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// Last transport-level failure, retained for diagnostics.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportFailure {
    #[error("connection refused by broker: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("session dropped: {0}")]
    Dropped(String),
}

/// What the network loop should do after handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopAction {
    Continue,
    /// Wait [`RECONNECT_DELAY`] before polling again.
    Backoff,
    Stop,
}

struct Inner {
    client_id: String,
    state: watch::Sender<ConnectionState>,
    last_failure: Mutex<Option<TransportFailure>>,
}

/// Owner of the broker session state.
///
/// Cloning yields another handle to the same state; the network loop and the
/// publish loop each hold one.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use telemetry_tools::connection::ConnectionManager;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let manager = ConnectionManager::new("telemetry-publisher");
///     let (client, event_loop) = manager
///         .connect("localhost", 1884, 60)
///         .expect("valid broker settings");
///     let _network = manager.run_network_loop(event_loop, CancellationToken::new());
///
///     if manager.await_ready(Duration::from_secs(10)).await {
///         // publish with `client`
///     }
///     # drop(client);
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    pub fn new(client_id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                client_id: client_id.into(),
                state,
                last_failure: Mutex::new(None),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Prepare a session with the broker at `host:port`.
    ///
    /// Nothing touches the network here: the returned [`EventLoop`] opens the
    /// connection once it is driven by [`run_network_loop`](Self::run_network_loop).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an empty host, a host containing whitespace,
    /// port 0, or a keepalive shorter than one second.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        keepalive_secs: u64,
    ) -> Result<(AsyncClient, EventLoop), ConfigError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(ConfigError::new("broker host must not be empty"));
        }
        if host.chars().any(char::is_whitespace) {
            return Err(ConfigError::new(format!(
                "broker host '{}' contains whitespace",
                host
            )));
        }
        if port == 0 {
            return Err(ConfigError::new("broker port must be between 1 and 65535"));
        }
        if keepalive_secs == 0 {
            return Err(ConfigError::new("keepalive must be at least 1 second"));
        }

        let mut options = MqttOptions::new(self.inner.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(keepalive_secs));

        info!(
            host = %host,
            port = port,
            keepalive_secs = keepalive_secs,
            client_id = %self.inner.client_id,
            "Connecting to broker"
        );

        Ok(AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY))
    }

    /// Record the outcome of a connection attempt (CONNACK or refusal).
    pub fn on_connect_result(&self, code: ConnectReturnCode) {
        if code == ConnectReturnCode::Success {
            if self.transition(ConnectionState::Connected) {
                info!(client_id = %self.inner.client_id, "Broker connection established");
            }
        } else {
            error!(code = ?code, "Broker refused connection");
            self.record_failure(TransportFailure::Refused(code));
        }
    }

    /// Record that the session is gone, whatever the reason.
    pub fn on_disconnect(&self, reason: DisconnectReason) {
        let was_connected = self.transition(ConnectionState::Disconnected);

        match &reason {
            DisconnectReason::Requested => {
                info!("Broker session closed");
            }
            DisconnectReason::Broker => {
                warn!(was_connected = was_connected, "Broker closed the session");
                self.record_failure(TransportFailure::Dropped(reason.to_string()));
            }
            DisconnectReason::Transport(e) => {
                if was_connected {
                    warn!(error = %e, "Broker connection lost");
                } else {
                    warn!(error = %e, "Broker connection attempt failed");
                }
                self.record_failure(TransportFailure::Dropped(e.clone()));
            }
        }
    }

    /// Current connectivity.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Most recent transport failure, if any occurred.
    pub fn last_failure(&self) -> Option<TransportFailure> {
        self.inner
            .last_failure
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the session is `Connected` or `timeout` elapses.
    ///
    /// Returns `true` if the session is connected when this returns.
    pub async fn await_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let ready = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await;

        matches!(ready, Ok(Ok(_)))
    }

    /// Wait without a deadline until the session is `Connected`.
    pub async fn wait_connected(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx
            .wait_for(|state| *state == ConnectionState::Connected)
            .await;
    }

    /// Close the session and wait up to `timeout` for the network loop to end.
    ///
    /// DISCONNECT is only requested on a live session. While reconnecting the
    /// event loop never reads requests, so the loop is cancelled instead.
    /// Returns `true` if the loop finished within `timeout`.
    pub async fn shutdown(
        &self,
        client: &AsyncClient,
        network: JoinHandle<()>,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> bool {
        if self.is_connected() {
            if let Err(e) = client.try_disconnect() {
                warn!(error = %e, "Failed to request broker disconnect");
                cancel.cancel();
            }
        } else {
            debug!("No broker session, stopping network loop without DISCONNECT");
            cancel.cancel();
        }

        match tokio::time::timeout(timeout, network).await {
            Ok(Ok(())) => {
                info!("Network loop shut down gracefully");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Network loop panicked during shutdown");
                true
            }
            Err(_) => {
                warn!("Network loop shutdown timed out after {:?}", timeout);
                cancel.cancel();
                false
            }
        }
    }

    /// Spawn the task that drives the transport for the rest of the process.
    ///
    /// The task ends after the client sends DISCONNECT or when `cancel` fires.
    pub fn run_network_loop(
        &self,
        event_loop: EventLoop,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            debug!("Network loop started");
            manager.drive(event_loop, cancel).await;
            debug!("Network loop stopped");
        })
    }

    async fn drive(&self, mut event_loop: EventLoop, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_loop.poll() => event,
            };

            match self.handle_event(event) {
                LoopAction::Continue => {}
                LoopAction::Backoff => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
                LoopAction::Stop => break,
            }
        }
    }

    /// Translate one transport event into the lifecycle callbacks.
    pub(crate) fn handle_event(&self, event: Result<Event, ConnectionError>) -> LoopAction {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                self.on_connect_result(ack.code);
                LoopAction::Continue
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                self.on_disconnect(DisconnectReason::Broker);
                LoopAction::Continue
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                self.on_disconnect(DisconnectReason::Requested);
                LoopAction::Stop
            }
            Ok(event) => {
                trace!(event = ?event, "Transport event");
                LoopAction::Continue
            }
            Err(ConnectionError::ConnectionRefused(code)) => {
                self.on_connect_result(code);
                LoopAction::Backoff
            }
            Err(e) => {
                self.on_disconnect(DisconnectReason::Transport(e.to_string()));
                LoopAction::Backoff
            }
        }
    }

    /// Move to `next`, returning whether the state actually changed.
    fn transition(&self, next: ConnectionState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    fn record_failure(&self, failure: TransportFailure) {
        if let Ok(mut last) = self.inner.last_failure.lock() {
            *last = Some(failure);
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("client_id", &self.inner.client_id)
            .field("state", &self.state())
            .field("last_failure", &self.last_failure())
            .finish()
    }
}
