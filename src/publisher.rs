//! Publish loop for synthetic telemetry.
//!
//! Each cycle builds the next [`TelemetryMessage`], hands its JSON payload to
//! a [`TelemetrySink`] without waiting for broker acknowledgement, advances
//! the sample cursor and sleeps for the publish interval. Cycles that fall in
//! a disconnected period follow the configured [`DisconnectedPolicy`].

use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, ClientError, QoS};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backlog::Backlog;
use crate::config::{Config, DisconnectedPolicy};
use crate::connection::{ConnectionManager, TransportFailure};
use crate::telemetry::{GeneratorConfig, SampleCursor, WindowGenerator};

/// How often the loop logs a progress summary.
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Errors returned by a [`TelemetrySink`].
#[derive(Debug, Error)]
pub enum PublishError {
    /// The request queue towards the network loop is full; try again later.
    #[error("transport request queue full")]
    Busy,

    #[error("transport rejected publish: {0}")]
    Rejected(String),
}

/// Errors that end the publish loop.
#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("broker not ready after {timeout:?} (last failure: {last_failure:?})")]
    NotReady {
        timeout: Duration,
        last_failure: Option<TransportFailure>,
    },
}

/// Fire-and-forget delivery of one payload to a topic.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

impl TelemetrySink for AsyncClient {
    /// Queue the payload at QoS 0 without retain, the transport defaults.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| match e {
                ClientError::TryRequest(_) => PublishError::Busy,
                other => PublishError::Rejected(other.to_string()),
            })
    }
}

/// What happened to the message built in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Handed to the transport.
    Published,
    /// Discarded because the session was down.
    Dropped,
    /// Queued in the backlog until the session returns.
    Buffered,
    /// The transport refused the payload.
    Failed,
}

/// Statistics about publisher operations.
#[derive(Debug, Clone, Default)]
pub struct PublisherStats {
    /// Messages handed to the transport, backlog flushes included
    pub messages_published: u64,

    /// Messages discarded while disconnected, backlog overflow included
    pub messages_dropped: u64,

    /// Messages queued in the backlog while disconnected
    pub messages_buffered: u64,

    /// Samples per channel generated so far
    pub samples_generated: u64,

    /// Publish attempts the transport refused
    pub publish_errors: u64,
}

/// Generates windows and publishes them at a fixed cadence.
///
/// # Example
///
/// ```no_run
/// use telemetry_tools::config::Config;
/// use telemetry_tools::connection::ConnectionManager;
/// use telemetry_tools::publisher::TelemetryPublisher;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let manager = ConnectionManager::new(config.client_id.clone());
///     let (client, event_loop) = manager
///         .connect(&config.broker_host, config.broker_port, config.keepalive_secs)
///         .expect("valid broker settings");
///     manager.run_network_loop(event_loop, CancellationToken::new());
///
///     let mut publisher = TelemetryPublisher::new(&config, manager, client);
///     let stats = publisher.run(CancellationToken::new()).await;
///     println!("{:?}", stats);
/// }
/// ```
pub struct TelemetryPublisher<S> {
    sink: S,
    connection: ConnectionManager,
    generator: WindowGenerator,
    topic: String,
    publish_interval: Duration,
    ready_timeout: Duration,
    policy: DisconnectedPolicy,
    backlog: Backlog,
    stats: PublisherStats,
    degraded: bool,
}

impl<S: TelemetrySink> TelemetryPublisher<S> {
    /// Create a publisher with its cursor at zero.
    pub fn new(config: &Config, connection: ConnectionManager, sink: S) -> Self {
        Self {
            sink,
            connection,
            generator: WindowGenerator::new(GeneratorConfig::from(config)),
            topic: config.topic(),
            publish_interval: config.publish_interval,
            ready_timeout: config.ready_timeout,
            policy: config.disconnected_policy,
            backlog: Backlog::new(config.backlog_capacity),
            stats: PublisherStats::default(),
            degraded: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn cursor(&self) -> SampleCursor {
        self.generator.cursor()
    }

    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    /// Wait for the broker, then publish until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`PublisherError::NotReady`] if the session is not connected
    /// within the ready timeout; nothing is published in that case.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<PublisherStats, PublisherError> {
        info!(
            timeout_secs = self.ready_timeout.as_secs(),
            "Waiting for broker connection"
        );

        let ready = tokio::select! {
            _ = cancel.cancelled() => return Ok(self.stats.clone()),
            ready = self.connection.await_ready(self.ready_timeout) => ready,
        };

        if !ready {
            let last_failure = self.connection.last_failure();
            error!(
                timeout_secs = self.ready_timeout.as_secs(),
                last_failure = ?last_failure,
                "Broker not ready, nothing published"
            );
            return Err(PublisherError::NotReady {
                timeout: self.ready_timeout,
                last_failure,
            });
        }

        info!(
            topic = %self.topic,
            interval_ms = self.publish_interval.as_millis() as u64,
            policy = %self.policy,
            "Publishing telemetry"
        );

        let mut last_report_time = Instant::now();
        let mut published_at_report = self.stats.messages_published;

        loop {
            if self.run_cycle(&cancel).await.is_none() {
                break;
            }

            // Periodic progress report
            if last_report_time.elapsed() >= REPORT_INTERVAL {
                let published = self.stats.messages_published - published_at_report;
                info!(
                    messages_published = published,
                    samples_sent = self.cursor().position(),
                    dropped = self.stats.messages_dropped,
                    backlog = self.backlog.len(),
                    rate = format!("{:.1}/s", published as f64 / last_report_time.elapsed().as_secs_f64()),
                    "Publisher progress"
                );
                published_at_report = self.stats.messages_published;
                last_report_time = Instant::now();
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.publish_interval) => {}
            }
        }

        info!(
            messages_published = self.stats.messages_published,
            messages_dropped = self.stats.messages_dropped,
            samples_sent = self.cursor().position(),
            backlog_received = self.backlog.stats().payloads_received,
            "Publisher stopped"
        );

        Ok(self.stats.clone())
    }

    /// Build and deliver one message.
    ///
    /// Returns `None` only if `cancel` fired while the `block` policy was
    /// waiting for the session to come back.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Option<CycleOutcome> {
        if self.policy == DisconnectedPolicy::Block && !self.connection.is_connected() {
            self.enter_degraded();
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.connection.wait_connected() => {}
            }
        }

        let message = self.generator.next_message();
        self.stats.samples_generated += message.window_len() as u64;

        let payload = match message.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode telemetry message");
                self.stats.publish_errors += 1;
                return Some(CycleOutcome::Failed);
            }
        };

        if !self.connection.is_connected() {
            self.enter_degraded();
            return Some(self.hold(payload));
        }

        if self.degraded {
            self.degraded = false;
            info!(backlog = self.backlog.len(), "Broker available again, resuming publishing");
        }

        if !self.flush_backlog() {
            self.buffer(payload);
            return Some(CycleOutcome::Buffered);
        }

        Some(self.send(payload))
    }

    /// Apply the disconnected policy to a payload that cannot be sent now.
    fn hold(&mut self, payload: Vec<u8>) -> CycleOutcome {
        match self.policy {
            DisconnectedPolicy::Drop => {
                self.stats.messages_dropped += 1;
                debug!(
                    cursor = self.cursor().position(),
                    "Broker disconnected, dropping message"
                );
                CycleOutcome::Dropped
            }
            // `Block` lands here only if the session dropped again after waking.
            DisconnectedPolicy::Buffer | DisconnectedPolicy::Block => {
                self.buffer(payload);
                debug!(backlog = self.backlog.len(), "Broker disconnected, buffering message");
                CycleOutcome::Buffered
            }
        }
    }

    /// Publish queued payloads oldest first.
    ///
    /// Returns `false` if the backlog could not be emptied this cycle. A full
    /// transport queue pauses the flush until the next cycle without counting
    /// as an error.
    fn flush_backlog(&mut self) -> bool {
        if self.backlog.is_empty() {
            return true;
        }

        let mut flushed = 0usize;
        while let Some(payload) = self.backlog.pop() {
            match self.sink.publish(&self.topic, payload.clone()) {
                Ok(()) => {
                    self.stats.messages_published += 1;
                    flushed += 1;
                }
                Err(PublishError::Busy) => {
                    self.backlog.requeue(payload);
                    debug!(
                        flushed = flushed,
                        remaining = self.backlog.len(),
                        "Transport queue full, resuming backlog flush next cycle"
                    );
                    return false;
                }
                Err(e) => {
                    warn!(error = %e, remaining = self.backlog.len() + 1, "Backlog flush interrupted");
                    self.stats.publish_errors += 1;
                    self.backlog.requeue(payload);
                    return false;
                }
            }
        }

        info!(flushed = flushed, "Backlog flushed");
        true
    }

    fn send(&mut self, payload: Vec<u8>) -> CycleOutcome {
        // Keep a copy when a full transport queue should divert to the backlog.
        let retained = (self.policy == DisconnectedPolicy::Buffer).then(|| payload.clone());

        match self.sink.publish(&self.topic, payload) {
            Ok(()) => {
                self.stats.messages_published += 1;
                CycleOutcome::Published
            }
            Err(PublishError::Busy) if retained.is_some() => {
                if let Some(payload) = retained {
                    self.buffer(payload);
                }
                debug!(backlog = self.backlog.len(), "Transport queue full, buffering message");
                CycleOutcome::Buffered
            }
            Err(e) => {
                warn!(error = %e, topic = %self.topic, "Publish failed");
                self.stats.publish_errors += 1;
                CycleOutcome::Failed
            }
        }
    }

    fn enter_degraded(&mut self) {
        if !self.degraded {
            self.degraded = true;
            warn!(
                policy = %self.policy,
                backlog_capacity = self.backlog.capacity(),
                last_failure = ?self.connection.last_failure(),
                "Broker disconnected, publisher degraded"
            );
        }
    }

    /// Queue a payload; overflow discards count as dropped messages.
    fn buffer(&mut self, payload: Vec<u8>) {
        let dropped_before = self.backlog.stats().payloads_dropped;
        self.backlog.push(payload);
        self.stats.messages_dropped += self.backlog.stats().payloads_dropped - dropped_before;
        self.stats.messages_buffered += 1;
    }
}
