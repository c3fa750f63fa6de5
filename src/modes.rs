//! Catalog of supported sensor modes.
//!
//! All modes are full VGA. They differ in bit depth and in whether frames are
//! started by the external trigger input. The companion controller carries the
//! actual PLL/timing programming, so the per-mode sensor tables are empty.

use crate::table::RegisterOp;
use crate::traits::{DriverError, Format, PixelFormat, Result};

/// Active pixel array width.
pub const PIXEL_ARRAY_WIDTH: u32 = 640;
/// Active pixel array height.
pub const PIXEL_ARRAY_HEIGHT: u32 = 480;

/// Default mode: 8-bit free-running.
pub const DEFAULT_MODE: u8 = 1;

// Xclk 24 MHz, 800 Mbps per lane; the companion applies the timing.
static VGA_10BIT: [RegisterOp; 1] = [RegisterOp::END];
static VGA_8BIT: [RegisterOp; 1] = [RegisterOp::END];

/// A named sensor configuration.
#[derive(Debug, PartialEq, Eq)]
pub struct Mode {
    /// Index programmed into the companion controller.
    pub index: u8,
    /// Output pixel format (8 or 10 bit).
    pub pixel_format: PixelFormat,
    /// Frames are started by the external trigger input.
    pub external_trigger: bool,
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Maximum frame rate.
    pub max_fps: u32,
    /// Default line length (HTS) in pixel clocks.
    pub line_length: u32,
    /// Default frame length (VTS) in lines.
    pub frame_length: u32,
    /// Sensor registers written on stream start.
    pub registers: &'static [RegisterOp],
}

impl Mode {
    /// Bits per pixel.
    #[must_use]
    pub const fn bit_depth(&self) -> u8 {
        self.pixel_format.bit_depth()
    }

    /// Pixel rate derived from the timing defaults.
    #[must_use]
    pub const fn pixel_rate(&self) -> u64 {
        self.line_length as u64 * self.frame_length as u64 * self.max_fps as u64
    }

    /// Horizontal blanking in pixels.
    #[must_use]
    pub const fn hblank(&self) -> u32 {
        self.line_length - self.width
    }

    /// Default vertical blanking in lines.
    #[must_use]
    pub const fn default_vblank(&self) -> u32 {
        self.frame_length - self.height
    }

    /// Pad format produced in this mode.
    #[must_use]
    pub const fn format(&self) -> Format {
        Format::new(self.width, self.height, self.pixel_format)
    }
}

/// Supported modes, indexed by companion mode number.
pub static MODES: [Mode; 4] = [
    Mode {
        index: 0,
        pixel_format: PixelFormat::Y10,
        external_trigger: false,
        width: PIXEL_ARRAY_WIDTH,
        height: PIXEL_ARRAY_HEIGHT,
        max_fps: 120,
        line_length: 772,
        frame_length: 0x23c,
        registers: &VGA_10BIT,
    },
    Mode {
        index: 1,
        pixel_format: PixelFormat::Y8,
        external_trigger: false,
        width: PIXEL_ARRAY_WIDTH,
        height: PIXEL_ARRAY_HEIGHT,
        max_fps: 120,
        line_length: 772,
        frame_length: 0x23c,
        registers: &VGA_8BIT,
    },
    Mode {
        index: 2,
        pixel_format: PixelFormat::Y10,
        external_trigger: true,
        width: PIXEL_ARRAY_WIDTH,
        height: PIXEL_ARRAY_HEIGHT,
        max_fps: 120,
        line_length: 772,
        frame_length: 0x23c,
        registers: &VGA_10BIT,
    },
    Mode {
        index: 3,
        pixel_format: PixelFormat::Y8,
        external_trigger: true,
        width: PIXEL_ARRAY_WIDTH,
        height: PIXEL_ARRAY_HEIGHT,
        max_fps: 120,
        line_length: 772,
        frame_length: 0x23c,
        registers: &VGA_8BIT,
    },
];

/// Look up a mode by index.
pub fn mode(index: u8) -> Result<&'static Mode> {
    MODES
        .get(usize::from(index))
        .ok_or(DriverError::UnknownMode(index))
}
