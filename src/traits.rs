//! Core traits and types for the OV7251 subdevice abstraction.

use async_trait::async_trait;
use embedded_hal::i2c::ErrorKind;

use crate::controls::ControlId;

/// Pixel format representation (e.g., GREY, Y10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// 8-bit greyscale.
    pub const GREY: Self = Self::new(b"GREY");
    /// 10-bit greyscale, one sample per 16-bit word.
    pub const Y10: Self = Self::new(b"Y10 ");
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&v4l::FourCC::from(*self), f)
    }
}

/// Monochrome output formats the sensor can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8 bits per pixel.
    Y8,
    /// 10 bits per pixel.
    Y10,
}

impl PixelFormat {
    /// `MEDIA_BUS_FMT_Y8_1X8`.
    pub const MBUS_Y8_1X8: u32 = 0x2001;
    /// `MEDIA_BUS_FMT_Y10_1X10`.
    pub const MBUS_Y10_1X10: u32 = 0x200a;

    /// Media bus code reported on the source pad.
    #[must_use]
    pub const fn media_bus_code(self) -> u32 {
        match self {
            Self::Y8 => Self::MBUS_Y8_1X8,
            Self::Y10 => Self::MBUS_Y10_1X10,
        }
    }

    /// Look up the format for a media bus code.
    #[must_use]
    pub const fn from_media_bus_code(code: u32) -> Option<Self> {
        match code {
            Self::MBUS_Y8_1X8 => Some(Self::Y8),
            Self::MBUS_Y10_1X10 => Some(Self::Y10),
            _ => None,
        }
    }

    /// Memory format a capture node would deliver for this bus format.
    #[must_use]
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::Y8 => FourCC::GREY,
            Self::Y10 => FourCC::Y10,
        }
    }

    /// Bits per pixel.
    #[must_use]
    pub const fn bit_depth(self) -> u8 {
        match self {
            Self::Y8 => 8,
            Self::Y10 => 10,
        }
    }
}

/// Whether a format operation addresses the committed or the trial configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatWhich {
    /// Negotiation only; nothing is committed.
    Try,
    /// The configuration used for the next stream start.
    Active,
}

/// Format on the sensor's source pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub pixel_format: PixelFormat,
}

impl Format {
    /// Create a new format.
    #[must_use]
    pub const fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
        }
    }
}

/// Frame size range reported for one media bus code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSizeRange {
    /// Smallest supported width.
    pub min_width: u32,
    /// Largest supported width.
    pub max_width: u32,
    /// Smallest supported height.
    pub min_height: u32,
    /// Largest supported height.
    pub max_height: u32,
}

/// Rectangle on the pixel array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// Left edge.
    pub left: u32,
    /// Top edge.
    pub top: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Selection rectangle being queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionTarget {
    /// Current crop.
    Crop,
    /// Default crop.
    CropDefault,
    /// Crop bounds.
    CropBounds,
    /// Native pixel array size.
    NativeSize,
    /// Compose rectangle (not supported by this sensor).
    Compose,
}

/// Physical bus between sensor and receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbusType {
    /// MIPI CSI-2 over D-PHY.
    Csi2Dphy,
}

/// Media bus configuration reported to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbusConfig {
    /// Bus type.
    pub bus_type: MbusType,
    /// Number of data lanes.
    pub data_lanes: u8,
    /// Whether the clock lane runs continuously.
    pub continuous_clock: bool,
}

/// Error type for driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A bus transaction was not completed.
    #[error("bus transaction with device 0x{address:02x} failed: {kind:?}")]
    Bus {
        /// 7-bit device address.
        address: u8,
        /// Failure reported by the bus implementation.
        kind: ErrorKind,
    },
    /// The companion controller did not report ready within its poll budget.
    #[error("companion controller not ready after {attempts} status polls (last status {last_status:?})")]
    CompanionTimeout {
        /// Number of status reads issued.
        attempts: u32,
        /// Last status byte successfully read, if any.
        last_status: Option<u8>,
    },
    /// No companion controller answered at its address.
    #[error("companion controller not found at 0x{0:02x}")]
    CompanionNotFound(u8),
    /// Control identifier is not exposed by this driver.
    #[error("unknown control id 0x{0:08x}")]
    InvalidControl(u32),
    /// Control exists but cannot be written.
    #[error("control {0:?} is read-only")]
    ReadOnlyControl(ControlId),
    /// Register address does not fit the target's address space.
    #[error("register 0x{0:04x} does not fit an 8-bit register space")]
    RegisterOutOfRange(u16),
    /// Mode index is not in the catalog.
    #[error("mode {0} is not in the mode catalog")]
    UnknownMode(u8),
    /// Enumeration index or selection target not supported.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Clock or power resource failure.
    #[error("power resource error: {0}")]
    Power(String),
    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<figment::Error> for DriverError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Sensor input clock / supply, owned by the platform.
pub trait ClockResource {
    /// Prepare and enable the clock.
    fn enable(&mut self) -> Result<()>;

    /// Disable the clock.
    fn disable(&mut self);
}

/// Clock that is always running (on-board oscillator); enable/disable are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedClock;

impl ClockResource for FixedClock {
    fn enable(&mut self) -> Result<()> {
        Ok(())
    }

    fn disable(&mut self) {}
}

/// Operations the capture host invokes on an attached sensor.
///
/// Implementations must be safe to call from independent tasks; calls on one
/// instance are serialized internally.
#[async_trait]
pub trait SensorSubdevice: Send + Sync {
    /// Switch the sensor clock on or off.
    async fn power(&self, on: bool) -> Result<()>;

    /// Start or stop streaming.
    async fn stream_enable(&self, enable: bool) -> Result<()>;

    /// Get the pad format.
    fn format(&self, which: FormatWhich) -> Format;

    /// Negotiate a pad format. Returns the format the sensor will actually produce.
    fn set_format(&self, which: FormatWhich, requested: &Format) -> Format;

    /// Enumerate media bus codes.
    fn enum_mbus_code(&self, index: u32) -> Result<PixelFormat>;

    /// Enumerate frame sizes for a media bus code.
    fn enum_frame_size(&self, index: u32, code: u32) -> Result<FrameSizeRange>;

    /// Get a selection rectangle.
    fn selection(&self, target: SelectionTarget) -> Result<Rect>;

    /// Get the media bus configuration.
    fn mbus_config(&self) -> MbusConfig;

    /// Set a control value. Out-of-range values are clamped.
    async fn set_control(&self, id: ControlId, value: i64) -> Result<()>;

    /// Get the current value of a control.
    async fn control(&self, id: ControlId) -> i64;
}
