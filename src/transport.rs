//! Single-register access to the sensor and the companion controller.
//!
//! The sensor uses 16-bit register addresses (3-byte write transaction), the
//! companion controller 8-bit addresses (2-byte write transaction). Every write
//! is followed by a settle delay before the bus is used again. Reads are a
//! compound write-then-read without an intermediate stop. Failures are
//! returned as [`DriverError::Bus`] and never retried here.

use std::time::Duration;

use embedded_hal::i2c::{Error as _, I2c};
use tracing::{trace, warn};

use crate::traits::{DriverError, Result};

/// Width of a device's register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWidth {
    /// One address byte.
    Bits8,
    /// Two address bytes, big-endian.
    Bits16,
}

/// An addressable device on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusDevice {
    /// 7-bit bus address.
    pub address: u8,
    /// Register address width.
    pub width: RegisterWidth,
}

impl BusDevice {
    /// Sensor at `address` (16-bit register map).
    #[must_use]
    pub const fn sensor(address: u8) -> Self {
        Self {
            address,
            width: RegisterWidth::Bits16,
        }
    }

    /// Companion controller at `address` (8-bit register map).
    #[must_use]
    pub const fn companion(address: u8) -> Self {
        Self {
            address,
            width: RegisterWidth::Bits8,
        }
    }

    fn encode(self, reg: u16) -> Result<([u8; 2], usize)> {
        match self.width {
            RegisterWidth::Bits16 => Ok((reg.to_be_bytes(), 2)),
            RegisterWidth::Bits8 => {
                let byte = u8::try_from(reg).map_err(|_| DriverError::RegisterOutOfRange(reg))?;
                Ok(([byte, 0], 1))
            }
        }
    }
}

/// Register transport over a shared bus.
pub struct Transport<B> {
    bus: B,
    settle: Duration,
}

impl<B: I2c> Transport<B> {
    /// Wrap a bus with the given post-write settle delay.
    pub const fn new(bus: B, settle: Duration) -> Self {
        Self { bus, settle }
    }

    /// Write one register, then wait for the settle delay.
    pub async fn write(&mut self, device: BusDevice, reg: u16, value: u8) -> Result<()> {
        let (addr, len) = device.encode(reg)?;
        let mut frame = [0u8; 3];
        frame[..len].copy_from_slice(&addr[..len]);
        frame[len] = value;

        trace!(address = device.address, reg, value, "register write");
        let outcome = self
            .bus
            .write(device.address, &frame[..=len])
            .map_err(|err| DriverError::Bus {
                address: device.address,
                kind: err.kind(),
            });
        tokio::time::sleep(self.settle).await;
        outcome
    }

    /// Read one register.
    pub async fn read(&mut self, device: BusDevice, reg: u16) -> Result<u8> {
        let (addr, len) = device.encode(reg)?;
        let mut buf = [0u8; 1];

        match self.bus.write_read(device.address, &addr[..len], &mut buf) {
            Ok(()) => {
                let [value] = buf;
                trace!(address = device.address, reg, value, "register read");
                Ok(value)
            }
            Err(err) => {
                warn!(address = device.address, reg, "reading register failed");
                Err(DriverError::Bus {
                    address: device.address,
                    kind: err.kind(),
                })
            }
        }
    }

    /// Give the bus back.
    pub fn release(self) -> B {
        self.bus
    }
}
