//! Inno-OV7251: control-plane driver for the InnoMaker MIPI OV7251 camera module
//!
//! The module pairs an OmniVision OV7251 global-shutter sensor with a companion
//! microcontroller that programs it. This library handles the register bus
//! side: companion bring-up, mode selection, stream start/stop and the
//! exposure/gain/flip controls. It is generic over any `embedded-hal` I2C bus,
//! so it runs against real hardware and against the in-crate mock in tests.

pub mod companion;
pub mod config;
pub mod controls;
pub mod device;
pub mod logging;
pub mod modes;
pub mod streaming;
pub mod table;
pub mod traits;
pub mod transport;

#[cfg(test)]
pub mod mock;

pub use config::DriverConfig;
pub use controls::ControlId;
pub use device::Ov7251;
pub use traits::{
    ClockResource, DriverError, FixedClock, Format, FormatWhich, FourCC, PixelFormat,
    SensorSubdevice,
};
