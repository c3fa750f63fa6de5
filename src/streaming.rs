//! Per-instance device state and the stream start/stop sequencing.
//!
//! ```text
//! Stopped -> Starting -> Streaming -> Stopping -> Stopped
//! ```
//!
//! Start programs the companion (if present), applies the mode table, pushes
//! cached controls and finally enables sensor output. Stop silences the sensor
//! before the companion powers it down. Only the sensor-side writes decide the
//! outcome; companion trouble is logged.

use embedded_hal::i2c::I2c;
use tracing::{info, warn};

use crate::companion::{Companion, CompanionState};
use crate::config::ControlPolicy;
use crate::controls::{clamp_exposure, clamp_gain, EXPOSURE_DEFAULT, GAIN_DEFAULT};
use crate::modes::Mode;
use crate::table;
use crate::traits::{ClockResource, Result};
use crate::transport::{BusDevice, Transport};

/// Stream-select register.
pub const REG_MODE_SELECT: u16 = 0x0100;
/// `REG_MODE_SELECT`: software standby.
pub const MODE_SELECT_STANDBY: u8 = 0x00;
/// `REG_MODE_SELECT`: streaming.
pub const MODE_SELECT_STREAMING: u8 = 0x01;

/// Stream state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Sensor in standby.
    Stopped,
    /// Start sequence in progress.
    Starting,
    /// Sensor output enabled.
    Streaming,
    /// Stop sequence in progress.
    Stopping,
}

impl StreamState {
    /// Whether gated control writes may go to the sensor.
    #[must_use]
    pub const fn accepts_sensor_writes(self) -> bool {
        matches!(self, Self::Starting | Self::Streaming)
    }
}

/// Mutable state of one attached sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    /// Clock resource enabled.
    pub power: bool,
    /// Stream state.
    pub stream: StreamState,
    /// Mode selected at attach.
    pub mode: &'static Mode,
    /// Gain, `[0, 1023]`.
    pub gain: u16,
    /// Exposure in lines, `[1, 496]`.
    pub exposure: u16,
    /// Vertical blanking in lines.
    pub vblank: u16,
    /// Horizontal mirror.
    pub hflip: bool,
    /// Vertical flip.
    pub vflip: bool,
}

impl DeviceState {
    /// Power-on defaults for `mode`.
    #[must_use]
    pub fn new(mode: &'static Mode) -> Self {
        Self {
            power: false,
            stream: StreamState::Stopped,
            mode,
            gain: clamp_gain(i64::from(GAIN_DEFAULT)),
            exposure: clamp_exposure(i64::from(EXPOSURE_DEFAULT)),
            vblank: u16::try_from(mode.default_vblank()).unwrap_or(u16::MAX),
            hflip: false,
            vflip: false,
        }
    }

    /// Sensor output enabled.
    #[must_use]
    pub const fn streaming(&self) -> bool {
        matches!(self.stream, StreamState::Streaming)
    }
}

/// Everything one instance owns; always accessed under the instance lock.
pub struct DriverCore<B, C> {
    pub(crate) transport: Transport<B>,
    pub(crate) sensor: BusDevice,
    pub(crate) companion: Option<Companion>,
    pub(crate) clock: C,
    pub(crate) state: DeviceState,
    pub(crate) control_policy: ControlPolicy,
}

impl<B: I2c, C: ClockResource> DriverCore<B, C> {
    pub(crate) fn new(
        transport: Transport<B>,
        sensor: BusDevice,
        companion: Option<Companion>,
        clock: C,
        mode: &'static Mode,
        control_policy: ControlPolicy,
    ) -> Self {
        Self {
            transport,
            sensor,
            companion,
            clock,
            state: DeviceState::new(mode),
            control_policy,
        }
    }

    /// Companion state, `Absent` when there is none.
    pub(crate) fn companion_state(&self) -> CompanionState {
        self.companion
            .as_ref()
            .map_or(CompanionState::Absent, Companion::state)
    }

    /// Enable or disable the sensor clock.
    pub(crate) fn set_power(&mut self, on: bool) -> Result<()> {
        if on == self.state.power {
            return Ok(());
        }
        if on {
            self.clock.enable()?;
            self.state.power = true;
            info!("ov7251 power on");
        } else {
            self.power_off();
        }
        Ok(())
    }

    /// Disable the sensor clock if it is running.
    pub(crate) fn power_off(&mut self) {
        if self.state.power {
            self.clock.disable();
            self.state.power = false;
            info!("ov7251 power off");
        }
    }

    /// Start or stop streaming.
    pub(crate) async fn set_stream(&mut self, enable: bool) -> Result<()> {
        if enable {
            self.start().await
        } else {
            self.stop().await
        }
    }

    /// Enter `Streaming`. A no-op when already streaming.
    ///
    /// If the returned future is dropped before it completes, the instance
    /// falls back to `Stopped` and the companion to `Failed`.
    pub(crate) async fn start(&mut self) -> Result<()> {
        if self.state.stream == StreamState::Streaming {
            return Ok(());
        }
        let mut transition = Transition::begin(self, StreamState::Starting);
        let outcome = transition.core.start_sequence().await;
        transition.finish();
        outcome
    }

    async fn start_sequence(&mut self) -> Result<()> {
        let mode = self.state.mode;
        info!(mode = mode.index, "stream on");

        if let Some(companion) = self.companion.as_mut() {
            if let Err(err) = companion.program(&mut self.transport, mode).await {
                warn!(mode = mode.index, error = %err, "camera controller not ready, starting anyway");
            }
        }

        match self.enable_sensor(mode).await {
            Ok(()) => {
                self.state.stream = StreamState::Streaming;
                info!(mode = mode.index, "sensor streaming");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "sensor stream-on failed");
                self.power_down_companion().await;
                self.state.stream = StreamState::Stopped;
                Err(err)
            }
        }
    }

    async fn enable_sensor(&mut self, mode: &Mode) -> Result<()> {
        table::apply(&mut self.transport, self.sensor, mode.registers).await?;
        self.push_controls().await;
        self.transport
            .write(self.sensor, REG_MODE_SELECT, MODE_SELECT_STREAMING)
            .await
    }

    /// Enter `Stopped`. A no-op when already stopped.
    ///
    /// The companion is powered down even if the sensor standby write fails;
    /// that failure is still returned.
    pub(crate) async fn stop(&mut self) -> Result<()> {
        if self.state.stream == StreamState::Stopped {
            return Ok(());
        }
        let mut transition = Transition::begin(self, StreamState::Stopping);
        let outcome = transition.core.stop_sequence().await;
        transition.finish();
        outcome
    }

    async fn stop_sequence(&mut self) -> Result<()> {
        info!("stream off");

        let standby = self
            .transport
            .write(self.sensor, REG_MODE_SELECT, MODE_SELECT_STANDBY)
            .await;
        if let Err(err) = &standby {
            warn!(error = %err, "sensor standby write failed");
        }

        self.power_down_companion().await;
        self.state.stream = StreamState::Stopped;
        standby
    }

    async fn power_down_companion(&mut self) {
        if let Some(companion) = self.companion.as_mut() {
            if let Err(err) = companion.power_down(&mut self.transport).await {
                warn!(error = %err, "camera controller power-down failed");
            }
        }
    }
}

/// An in-progress start or stop sequence.
///
/// Dropping it unfinished (the caller's future was cancelled) puts the
/// instance back in `Stopped`, so gated controls stop reaching the sensor.
struct Transition<'a, B, C> {
    core: &'a mut DriverCore<B, C>,
    finished: bool,
}

impl<'a, B, C> Transition<'a, B, C> {
    fn begin(core: &'a mut DriverCore<B, C>, state: StreamState) -> Self {
        core.state.stream = state;
        Self {
            core,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl<B, C> Drop for Transition<'_, B, C> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(state = ?self.core.state.stream, "stream transition interrupted");
        self.core.state.stream = StreamState::Stopped;
        if let Some(companion) = self.core.companion.as_mut() {
            companion.interrupt();
        }
    }
}
