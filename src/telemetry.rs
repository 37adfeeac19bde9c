//! Telemetry message model and synthetic window generation.
//!
//! A [`WindowGenerator`] produces one [`TelemetryMessage`] per publish cycle.
//! Every message carries the same window of consecutive integers on all eight
//! channels; the window start is the running [`SampleCursor`].

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One fixed-size run of sample values for a single channel.
pub type SampleWindow = Vec<u64>;

/// Measurement streams reported by the simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    AccX,
    AccY,
    AccZ,
    GyroX,
    GyroY,
    GyroZ,
    CurrV,
    Temp,
}

impl Channel {
    /// Get all channels, in wire order.
    pub fn all() -> &'static [Channel] {
        &[
            Channel::AccX,
            Channel::AccY,
            Channel::AccZ,
            Channel::GyroX,
            Channel::GyroY,
            Channel::GyroZ,
            Channel::CurrV,
            Channel::Temp,
        ]
    }

    /// Get the channel key used in the JSON payload.
    pub fn name(&self) -> &'static str {
        match self {
            Channel::AccX => "acc_x",
            Channel::AccY => "acc_y",
            Channel::AccZ => "acc_z",
            Channel::GyroX => "gyro_x",
            Channel::GyroY => "gyro_y",
            Channel::GyroZ => "gyro_z",
            Channel::CurrV => "curr_v",
            Channel::Temp => "temp",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised while encoding or decoding a telemetry payload.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid telemetry JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel {0} is missing from the payload")]
    MissingChannel(Channel),

    #[error("channel {channel} has {found} samples, expected {expected}")]
    WindowLengthMismatch {
        channel: Channel,
        expected: usize,
        found: usize,
    },
}

/// The unit of publication.
///
/// Serializes to the payload consumed by the gateway:
/// `{"scenario_id": .., "device_id": .., "timestamp": "YYYY-MM-DD HH:MM:SS.mmm", "data": {..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub scenario_id: i64,

    pub device_id: i64,

    /// Capture time, UTC, millisecond precision
    #[serde(with = "wire_timestamp")]
    pub timestamp: DateTime<Utc>,

    /// Sample window per channel
    pub data: BTreeMap<Channel, SampleWindow>,
}

impl TelemetryMessage {
    /// Build a message carrying `window` on every channel.
    pub fn new(
        scenario_id: i64,
        device_id: i64,
        timestamp: DateTime<Utc>,
        window: SampleWindow,
    ) -> Self {
        let data = Channel::all()
            .iter()
            .map(|channel| (*channel, window.clone()))
            .collect();

        Self {
            scenario_id,
            device_id,
            timestamp: timestamp.trunc_subsecs(3),
            data,
        }
    }

    /// Samples per channel, or 0 for a message without data.
    pub fn window_len(&self) -> usize {
        self.data.values().next().map(Vec::len).unwrap_or(0)
    }

    /// Check that every channel is present and all windows share one length.
    pub fn validate(&self) -> Result<(), MessageError> {
        let expected = self.window_len();
        for channel in Channel::all() {
            let window = self
                .data
                .get(channel)
                .ok_or(MessageError::MissingChannel(*channel))?;
            if window.len() != expected {
                return Err(MessageError::WindowLengthMismatch {
                    channel: *channel,
                    expected,
                    found: window.len(),
                });
            }
        }
        Ok(())
    }

    /// Serialize to the JSON wire payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a wire payload, rejecting messages that break the channel invariants.
    pub fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let message: TelemetryMessage = serde_json::from_slice(payload)?;
        message.validate()?;
        Ok(message)
    }
}

/// `YYYY-MM-DD HH:MM:SS.mmm` in UTC, the format downstream consumers parse.
mod wire_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&timestamp.format(FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

/// Running offset of the next sample to emit.
///
/// Starts at zero and only ever moves forward, so every emitted sample has a
/// unique index a consumer can use to spot gaps or duplicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleCursor(u64);

impl SampleCursor {
    pub fn starting_at(position: u64) -> Self {
        Self(position)
    }

    pub fn position(&self) -> u64 {
        self.0
    }

    fn advance(&mut self, samples: usize) {
        self.0 += samples as u64;
    }
}

/// Configuration for the window generator.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub scenario_id: i64,

    pub device_id: i64,

    /// Samples per channel per window
    pub window_size: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            scenario_id: 19,
            device_id: 1,
            window_size: 50,
        }
    }
}

impl From<&crate::config::Config> for GeneratorConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            scenario_id: config.scenario_id,
            device_id: config.device_id,
            window_size: config.window_size,
        }
    }
}

/// Produces successive sample windows and wraps them into messages.
pub struct WindowGenerator {
    config: GeneratorConfig,
    cursor: SampleCursor,
}

impl WindowGenerator {
    /// Create a new generator with its cursor at zero.
    pub fn new(config: GeneratorConfig) -> Self {
        Self::with_cursor(config, SampleCursor::default())
    }

    /// Create a generator resuming from an explicit cursor.
    pub fn with_cursor(config: GeneratorConfig, cursor: SampleCursor) -> Self {
        Self { config, cursor }
    }

    /// Create a new generator with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(GeneratorConfig::default())
    }

    pub fn cursor(&self) -> SampleCursor {
        self.cursor
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Build the next window `[cursor, cursor + N)` and advance the cursor by N.
    pub fn next_window(&mut self) -> SampleWindow {
        let start = self.cursor.position();
        let window: SampleWindow = (start..start + self.config.window_size as u64).collect();
        self.cursor.advance(self.config.window_size);
        window
    }

    /// Build the next message stamped with `timestamp`.
    pub fn next_message_at(&mut self, timestamp: DateTime<Utc>) -> TelemetryMessage {
        let window = self.next_window();
        TelemetryMessage::new(
            self.config.scenario_id,
            self.config.device_id,
            timestamp,
            window,
        )
    }

    /// Build the next message stamped with the current time.
    pub fn next_message(&mut self) -> TelemetryMessage {
        self.next_message_at(Utc::now())
    }
}

impl Default for WindowGenerator {
    fn default() -> Self {
        Self::with_defaults()
    }
}
