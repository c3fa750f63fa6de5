//! Driver configuration using Figment.
//!
//! Values are layered: built-in defaults, then a TOML file, then environment
//! variables prefixed `OV7251_` (nested keys separated by `__`, e.g.
//! `OV7251_TIMING__POLL_ATTEMPTS=20`).
//!
//! The selected mode is part of the per-instance configuration; there is no
//! process-wide mode setting.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::companion;
use crate::modes;
use crate::traits::{DriverError, Result};

/// Default configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "ov7251.toml";

/// Default sensor bus address.
pub const DEFAULT_SENSOR_ADDRESS: u8 = 0x60;

/// What attach does when no companion controller answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanionPolicy {
    /// Attach fails: the sensor is only reachable through the companion.
    Required,
    /// Attach continues and talks to the sensor directly.
    Optional,
}

/// When control writes reach the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPolicy {
    /// Cache while stopped, push on stream start.
    GateOnStreaming,
    /// Write immediately whatever the stream state.
    Immediate,
}

/// Which companion status bytes count as ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyPolicy {
    /// Ready bit set and error bit clear.
    Strict,
    /// Ready bit set; the error bit is only logged.
    ReadyBitOnly,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable, coloured.
    Pretty,
    /// Single line per event.
    Compact,
    /// JSON objects.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level filter (trace, debug, info, warn, error). `RUST_LOG` overrides it.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Pretty,
        }
    }
}

/// Bus and companion timing, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Wait after every register write.
    pub settle_ms: u64,
    /// Wait for companion firmware boot before probing.
    pub boot_delay_ms: u64,
    /// Wait after the attach-time power-down command.
    pub reset_settle_ms: u64,
    /// Wait after writing the mode index.
    pub mode_settle_ms: u64,
    /// Wait before each status poll.
    pub poll_interval_ms: u64,
    /// Status polls before giving up.
    pub poll_attempts: u32,
    /// Wait after writing the external trigger register.
    pub trigger_settle_ms: u64,
    /// Wait after the stream-stop power-down command.
    pub powerdown_settle_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle_ms: 2,
            boot_delay_ms: 200,
            reset_settle_ms: 100,
            mode_settle_ms: 20,
            poll_interval_ms: 100,
            poll_attempts: 15,
            trigger_settle_ms: 10,
            powerdown_settle_ms: 50,
        }
    }
}

impl Timing {
    /// Minimum post-write settle time the sensor latches need.
    pub const MIN_SETTLE_MS: u64 = 2;

    /// Post-write settle delay.
    #[must_use]
    pub const fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Companion boot delay.
    #[must_use]
    pub const fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }

    /// Delay after attach-time power-down.
    #[must_use]
    pub const fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    /// Delay after the mode index write.
    #[must_use]
    pub const fn mode_settle(&self) -> Duration {
        Duration::from_millis(self.mode_settle_ms)
    }

    /// Delay before each status poll.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay after the trigger write.
    #[must_use]
    pub const fn trigger_settle(&self) -> Duration {
        Duration::from_millis(self.trigger_settle_ms)
    }

    /// Delay after the stream-stop power-down.
    #[must_use]
    pub const fn powerdown_settle(&self) -> Duration {
        Duration::from_millis(self.powerdown_settle_ms)
    }
}

/// Per-instance driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// I2C character device used by the bring-up binary.
    pub bus: String,
    /// Sensor bus address.
    pub sensor_address: u8,
    /// Companion controller bus address.
    pub companion_address: u8,
    /// Mode index, fixed for the life of the attachment.
    pub mode: u8,
    /// Behaviour when the companion is missing.
    pub companion_policy: CompanionPolicy,
    /// Control write gating.
    pub control_policy: ControlPolicy,
    /// Companion readiness test.
    pub ready_policy: ReadyPolicy,
    /// Delays and retry budget.
    pub timing: Timing,
    /// Logging settings.
    pub logging: LoggingConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            bus: "/dev/i2c-10".to_owned(),
            sensor_address: DEFAULT_SENSOR_ADDRESS,
            companion_address: companion::DEFAULT_ADDRESS,
            mode: modes::DEFAULT_MODE,
            companion_policy: CompanionPolicy::Required,
            control_policy: ControlPolicy::GateOnStreaming,
            ready_policy: ReadyPolicy::Strict,
            timing: Timing::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Policies of the earlier driver generation: controls always written,
    /// missing companion tolerated, ready bit alone ends the status poll.
    #[must_use]
    pub fn legacy() -> Self {
        Self {
            companion_policy: CompanionPolicy::Optional,
            control_policy: ControlPolicy::Immediate,
            ready_policy: ReadyPolicy::ReadyBitOnly,
            ..Self::default()
        }
    }

    /// Load from [`DEFAULT_CONFIG_FILE`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file and the environment. A missing file is not
    /// an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("OV7251_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Select a different mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: u8) -> Self {
        self.mode = mode;
        self
    }

    /// Replace the timing block.
    #[must_use]
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Check values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        modes::mode(self.mode)?;
        if self.timing.settle_ms < Timing::MIN_SETTLE_MS {
            return Err(DriverError::Config(format!(
                "settle_ms must be at least {} (got {})",
                Timing::MIN_SETTLE_MS,
                self.timing.settle_ms
            )));
        }
        if self.timing.poll_attempts == 0 {
            return Err(DriverError::Config("poll_attempts must be non-zero".to_owned()));
        }
        if self.sensor_address == self.companion_address {
            return Err(DriverError::Config(format!(
                "sensor and companion share address 0x{:02x}",
                self.sensor_address
            )));
        }
        Ok(())
    }
}
