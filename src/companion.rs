//! Companion microcontroller bring-up protocol.
//!
//! The companion sits at its own bus address and reprograms the sensor on
//! command. Its progress is only observable through the status register, so
//! every mode change ends with a bounded poll:
//!
//! ```text
//! Absent -> Detected -> Resetting -> ModeSet -> Polling -> Ready | Failed
//! ```
//!
//! A poll that runs out of attempts moves to `Failed` and returns
//! [`DriverError::CompanionTimeout`]; callers log it and carry on.

use embedded_hal::i2c::I2c;
use tracing::{debug, info, warn};

use crate::config::{ReadyPolicy, Timing};
use crate::modes::Mode;
use crate::traits::{DriverError, Result};
use crate::transport::{BusDevice, Transport};

/// Default companion bus address.
pub const DEFAULT_ADDRESS: u8 = 0x10;

/// Power/reset command register.
pub const REG_COMMAND: u8 = 200;
/// Status register.
pub const REG_STATUS: u8 = 201;
/// Mode index register.
pub const REG_MODE: u8 = 202;
/// External trigger enable register.
pub const REG_TRIGGER: u8 = 208;

/// `REG_COMMAND`: start sensor programming.
pub const CMD_START: u8 = 1;
/// `REG_COMMAND`: power the sensor down.
pub const CMD_POWER_DOWN: u8 = 2;

const STATUS_READY: u8 = 0x80;
const STATUS_ERROR: u8 = 0x01;

/// Size of the identity block at the start of the register space.
pub const IDENTITY_LEN: usize = 166;

/// Bring-up state of the companion controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionState {
    /// Nothing answered at the companion address.
    Absent,
    /// Present, sensor not programmed.
    Detected,
    /// Power-down issued.
    Resetting,
    /// Mode index written.
    ModeSet,
    /// Start issued, waiting for the status register.
    Polling,
    /// Sensor programmed for the current mode.
    Ready,
    /// Poll budget exhausted or a command write failed.
    Failed,
}

/// Decoded status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompanionStatus {
    /// Bit 7.
    pub ready: bool,
    /// Bit 0.
    pub error: bool,
}

impl CompanionStatus {
    /// Ready with no error flagged.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        self.ready && !self.error
    }

    /// Whether this status ends the poll under `policy`.
    #[must_use]
    pub const fn is_ready_under(self, policy: ReadyPolicy) -> bool {
        match policy {
            ReadyPolicy::Strict => self.is_ready(),
            ReadyPolicy::ReadyBitOnly => self.ready,
        }
    }
}

impl From<u8> for CompanionStatus {
    fn from(byte: u8) -> Self {
        Self {
            ready: byte & STATUS_READY != 0,
            error: byte & STATUS_ERROR != 0,
        }
    }
}

/// Module description stored in the companion's identity block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompanionIdentity {
    /// Magic string.
    pub magic: String,
    /// Module manufacturer.
    pub manufacturer: String,
    /// Manufacturer id.
    pub manufacturer_id: u16,
    /// Sensor manufacturer.
    pub sensor_manufacturer: String,
    /// Sensor part.
    pub sensor_type: String,
    /// Module id.
    pub module_id: u16,
    /// Module revision.
    pub module_revision: u16,
    /// Number of modes the firmware knows.
    pub mode_count: u16,
    /// Bytes per mode descriptor.
    pub bytes_per_mode: u16,
}

impl CompanionIdentity {
    /// Decode the identity block.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        Self {
            magic: text(raw, 0, 12),
            manufacturer: text(raw, 12, 32),
            manufacturer_id: le16(raw, 44),
            sensor_manufacturer: text(raw, 46, 8),
            sensor_type: text(raw, 54, 16),
            module_id: le16(raw, 70),
            module_revision: le16(raw, 72),
            mode_count: le16(raw, 130),
            bytes_per_mode: le16(raw, 132),
        }
    }
}

fn text(raw: &[u8], offset: usize, len: usize) -> String {
    raw.get(offset..offset + len)
        .and_then(|field| field.split(|&byte| byte == 0).next())
        .map(|field| String::from_utf8_lossy(field).into_owned())
        .unwrap_or_default()
}

fn le16(raw: &[u8], offset: usize) -> u16 {
    raw.get(offset..offset + 2)
        .and_then(|field| field.try_into().ok())
        .map_or(0, u16::from_le_bytes)
}

/// Handle on the companion controller.
#[derive(Debug)]
pub struct Companion {
    device: BusDevice,
    state: CompanionState,
    timing: Timing,
    ready_policy: ReadyPolicy,
}

impl Companion {
    /// Handle for a controller at `address`; starts `Absent` until detected.
    #[must_use]
    pub const fn new(address: u8, timing: Timing) -> Self {
        Self {
            device: BusDevice::companion(address),
            state: CompanionState::Absent,
            timing,
            ready_policy: ReadyPolicy::Strict,
        }
    }

    /// Use a different readiness test.
    #[must_use]
    pub const fn with_ready_policy(mut self, policy: ReadyPolicy) -> Self {
        self.ready_policy = policy;
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> CompanionState {
        self.state
    }

    /// Bus address.
    #[must_use]
    pub const fn address(&self) -> u8 {
        self.device.address
    }

    /// Probe the first identity byte. Returns whether the controller answered.
    pub async fn detect<B: I2c>(&mut self, transport: &mut Transport<B>) -> bool {
        match transport.read(self.device, 0).await {
            Ok(_) => {
                info!(address = self.device.address, "camera controller found");
                self.state = CompanionState::Detected;
                true
            }
            Err(_) => {
                self.state = CompanionState::Absent;
                false
            }
        }
    }

    /// Read and decode the identity block.
    pub async fn read_identity<B: I2c>(
        &self,
        transport: &mut Transport<B>,
    ) -> Result<CompanionIdentity> {
        let mut raw = Vec::with_capacity(IDENTITY_LEN);
        for offset in 0..IDENTITY_LEN {
            #[allow(clippy::cast_possible_truncation)]
            let reg = offset as u16;
            let byte = transport.read(self.device, reg).await?;
            debug!(reg, byte, "identity byte");
            raw.push(byte);
        }
        Ok(CompanionIdentity::parse(&raw))
    }

    /// Attach-time bring-up: power the sensor down, select `mode`, start
    /// programming and wait for ready.
    pub async fn bring_up<B: I2c>(
        &mut self,
        transport: &mut Transport<B>,
        mode: &Mode,
    ) -> Result<CompanionStatus> {
        self.state = CompanionState::Resetting;
        self.command(transport, REG_COMMAND, CMD_POWER_DOWN).await?;
        tokio::time::sleep(self.timing.reset_settle()).await;

        self.select_mode(transport, mode).await?;
        self.start_and_poll(transport).await
    }

    /// Stream-start programming: select `mode`, start, wait for ready, then
    /// set the external trigger input for the mode.
    ///
    /// The controller forgets its mode across power-down, so this always
    /// re-sends the index. The trigger register is written even when the
    /// poll timed out.
    pub async fn program<B: I2c>(
        &mut self,
        transport: &mut Transport<B>,
        mode: &Mode,
    ) -> Result<CompanionStatus> {
        self.select_mode(transport, mode).await?;
        let polled = self.start_and_poll(transport).await;

        let trigger = transport
            .write(self.device, u16::from(REG_TRIGGER), u8::from(mode.external_trigger))
            .await;
        tokio::time::sleep(self.timing.trigger_settle()).await;

        match (polled, trigger) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => {
                self.state = CompanionState::Failed;
                Err(err)
            }
            (Ok(status), Ok(())) => Ok(status),
        }
    }

    /// Power the sensor down; the controller returns to `Detected`.
    pub async fn power_down<B: I2c>(&mut self, transport: &mut Transport<B>) -> Result<()> {
        self.command(transport, REG_COMMAND, CMD_POWER_DOWN).await?;
        tokio::time::sleep(self.timing.powerdown_settle()).await;
        self.state = CompanionState::Detected;
        info!(address = self.device.address, "camera controller powered down");
        Ok(())
    }

    /// Forget progress after an unfinished command sequence. Anything past
    /// `Detected` is no longer known to match the hardware.
    pub(crate) fn interrupt(&mut self) {
        if !matches!(self.state, CompanionState::Absent | CompanionState::Detected) {
            self.state = CompanionState::Failed;
        }
    }

    async fn select_mode<B: I2c>(&mut self, transport: &mut Transport<B>, mode: &Mode) -> Result<()> {
        self.command(transport, REG_MODE, mode.index).await?;
        self.state = CompanionState::ModeSet;
        info!(mode = mode.index, "camera controller mode set");
        tokio::time::sleep(self.timing.mode_settle()).await;
        Ok(())
    }

    async fn start_and_poll<B: I2c>(
        &mut self,
        transport: &mut Transport<B>,
    ) -> Result<CompanionStatus> {
        self.command(transport, REG_COMMAND, CMD_START).await?;
        self.poll(transport).await
    }

    async fn command<B: I2c>(
        &mut self,
        transport: &mut Transport<B>,
        reg: u8,
        value: u8,
    ) -> Result<()> {
        let outcome = transport.write(self.device, u16::from(reg), value).await;
        if outcome.is_err() {
            self.state = CompanionState::Failed;
        }
        outcome
    }

    async fn poll<B: I2c>(&mut self, transport: &mut Transport<B>) -> Result<CompanionStatus> {
        self.state = CompanionState::Polling;
        let attempts = self.timing.poll_attempts;
        let mut last_status = None;

        for attempt in 1..=attempts {
            tokio::time::sleep(self.timing.poll_interval()).await;

            match transport.read(self.device, u16::from(REG_STATUS)).await {
                Ok(byte) => {
                    last_status = Some(byte);
                    let status = CompanionStatus::from(byte);
                    debug!(status = byte, attempt, "camera controller status");

                    let ready = status.is_ready_under(self.ready_policy);
                    if status.error {
                        if ready {
                            warn!(status = byte, attempt, "camera controller reported error");
                        } else {
                            warn!(status = byte, attempt, "camera controller reported error, retrying");
                        }
                    }
                    if ready {
                        self.state = CompanionState::Ready;
                        info!(status = byte, attempt, "camera controller ready");
                        return Ok(status);
                    }
                }
                Err(err) => {
                    warn!(attempt, error = %err, "camera controller status read failed");
                }
            }
        }

        self.state = CompanionState::Failed;
        Err(DriverError::CompanionTimeout {
            attempts,
            last_status,
        })
    }
}
