//! Control identifiers, ranges and their sensor register layout.
//!
//! Every value is clamped into its range and cached in the device state. The
//! cached value only reaches the sensor while a stream is starting or running
//! (or always, under [`ControlPolicy::Immediate`]); otherwise it waits for the
//! next stream start. Multi-register values are written high part first and
//! are not atomic on the bus.

use embedded_hal::i2c::I2c;
use tracing::{debug, info, warn};

use crate::config::ControlPolicy;
use crate::modes::Mode;
use crate::streaming::DriverCore;
use crate::table::{self, RegisterOp};
use crate::traits::{ClockResource, DriverError, Result};

/// Exposure, bits 19:16 (only 15:12 used here).
pub const REG_EXPOSURE_HIGH: u16 = 0x3500;
/// Exposure, bits 11:4.
pub const REG_EXPOSURE_MID: u16 = 0x3501;
/// Exposure, bits 3:0 in the upper nibble.
pub const REG_EXPOSURE_LOW: u16 = 0x3502;
/// Gain, bits 9:8.
pub const REG_GAIN_HIGH: u16 = 0x350a;
/// Gain, bits 7:0.
pub const REG_GAIN_LOW: u16 = 0x350b;
/// Timing format 1 (vertical flip).
pub const REG_TIMING_FORMAT1: u16 = 0x3820;
/// Timing format 2 (horizontal mirror).
pub const REG_TIMING_FORMAT2: u16 = 0x3821;
/// Frame length (VTS) high byte.
pub const REG_VTS_HIGH: u16 = 0x380e;
/// Frame length (VTS) low byte.
pub const REG_VTS_LOW: u16 = 0x380f;

/// Gain range.
pub const GAIN_MIN: u16 = 0x000;
/// Gain range.
pub const GAIN_MAX: u16 = 0x3ff;
/// Gain default.
pub const GAIN_DEFAULT: u16 = 0x10;

/// Exposure range, in lines.
pub const EXPOSURE_MIN: u16 = 1;
/// Exposure range, in lines.
pub const EXPOSURE_MAX: u16 = 496;
/// Exposure default.
pub const EXPOSURE_DEFAULT: u16 = 400;

/// Smallest vertical blanking.
pub const VBLANK_MIN: u16 = 92;
/// Largest frame length.
pub const VTS_MAX: u16 = 0x7fff;

const FLIP_ON: u8 = 0x04;
const HFLIP_OFF: u8 = 0x00;
// Timing format 1 idles at 0x40 on this module.
const VFLIP_OFF: u8 = 0x40;

/// MIPI link frequencies offered in the link frequency menu.
pub const LINK_FREQUENCIES: [i64; 1] = [400_000_000];

/// Controls exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlId {
    /// Horizontal mirror.
    HFlip,
    /// Vertical flip.
    VFlip,
    /// Sensor gain.
    Gain,
    /// Exposure time in lines.
    Exposure,
    /// MIPI link frequency menu (read-only).
    LinkFrequency,
    /// Pixel rate (read-only, derived from the mode).
    PixelRate,
    /// Vertical blanking in lines.
    VBlank,
    /// Horizontal blanking (read-only).
    HBlank,
    /// Analogue gain; shares the gain registers.
    AnalogueGain,
}

impl ControlId {
    /// `V4L2_CID_EXPOSURE`.
    pub const CID_EXPOSURE: u32 = 0x0098_0911;
    /// `V4L2_CID_GAIN`.
    pub const CID_GAIN: u32 = 0x0098_0913;
    /// `V4L2_CID_HFLIP`.
    pub const CID_HFLIP: u32 = 0x0098_0914;
    /// `V4L2_CID_VFLIP`.
    pub const CID_VFLIP: u32 = 0x0098_0915;
    /// `V4L2_CID_VBLANK`.
    pub const CID_VBLANK: u32 = 0x009e_0901;
    /// `V4L2_CID_HBLANK`.
    pub const CID_HBLANK: u32 = 0x009e_0902;
    /// `V4L2_CID_ANALOGUE_GAIN`.
    pub const CID_ANALOGUE_GAIN: u32 = 0x009e_0903;
    /// `V4L2_CID_LINK_FREQ`.
    pub const CID_LINK_FREQ: u32 = 0x009f_0901;
    /// `V4L2_CID_PIXEL_RATE`.
    pub const CID_PIXEL_RATE: u32 = 0x009f_0902;

    /// All exposed controls.
    pub const ALL: [Self; 9] = [
        Self::HFlip,
        Self::VFlip,
        Self::Gain,
        Self::Exposure,
        Self::LinkFrequency,
        Self::PixelRate,
        Self::VBlank,
        Self::HBlank,
        Self::AnalogueGain,
    ];

    /// Map a V4L2 control id.
    #[must_use]
    pub const fn from_cid(cid: u32) -> Option<Self> {
        match cid {
            Self::CID_HFLIP => Some(Self::HFlip),
            Self::CID_VFLIP => Some(Self::VFlip),
            Self::CID_GAIN => Some(Self::Gain),
            Self::CID_EXPOSURE => Some(Self::Exposure),
            Self::CID_LINK_FREQ => Some(Self::LinkFrequency),
            Self::CID_PIXEL_RATE => Some(Self::PixelRate),
            Self::CID_VBLANK => Some(Self::VBlank),
            Self::CID_HBLANK => Some(Self::HBlank),
            Self::CID_ANALOGUE_GAIN => Some(Self::AnalogueGain),
            _ => None,
        }
    }

    /// V4L2 control id.
    #[must_use]
    pub const fn cid(self) -> u32 {
        match self {
            Self::HFlip => Self::CID_HFLIP,
            Self::VFlip => Self::CID_VFLIP,
            Self::Gain => Self::CID_GAIN,
            Self::Exposure => Self::CID_EXPOSURE,
            Self::LinkFrequency => Self::CID_LINK_FREQ,
            Self::PixelRate => Self::CID_PIXEL_RATE,
            Self::VBlank => Self::CID_VBLANK,
            Self::HBlank => Self::CID_HBLANK,
            Self::AnalogueGain => Self::CID_ANALOGUE_GAIN,
        }
    }

    /// Controls the host cannot set.
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::LinkFrequency | Self::PixelRate | Self::HBlank)
    }

    /// Range and default of this control in `mode`.
    #[must_use]
    pub fn info(self, mode: &Mode) -> ControlInfo {
        let pixel_rate = i64::try_from(mode.pixel_rate()).unwrap_or(i64::MAX);
        let hblank = i64::from(mode.hblank());
        let (min, max, default) = match self {
            Self::HFlip | Self::VFlip => (0, 1, 0),
            Self::Gain | Self::AnalogueGain => (
                i64::from(GAIN_MIN),
                i64::from(GAIN_MAX),
                i64::from(GAIN_DEFAULT),
            ),
            Self::Exposure => (
                i64::from(EXPOSURE_MIN),
                i64::from(EXPOSURE_MAX),
                i64::from(EXPOSURE_DEFAULT),
            ),
            Self::LinkFrequency => (0, 0, 0),
            Self::PixelRate => (0, pixel_rate, pixel_rate),
            Self::VBlank => (
                i64::from(VBLANK_MIN),
                i64::from(vblank_max(mode)),
                i64::from(mode.default_vblank()),
            ),
            Self::HBlank => (hblank, hblank, hblank),
        };

        ControlInfo {
            id: self,
            min,
            max,
            step: 1,
            default,
            read_only: self.is_read_only(),
        }
    }
}

/// Range description of one control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlInfo {
    /// Control.
    pub id: ControlId,
    /// Smallest value.
    pub min: i64,
    /// Largest value.
    pub max: i64,
    /// Step.
    pub step: i64,
    /// Value after attach.
    pub default: i64,
    /// Whether writes are rejected.
    pub read_only: bool,
}

fn clamp_to_u16(value: i64, min: u16, max: u16) -> u16 {
    let clamped = value.clamp(i64::from(min), i64::from(max));
    u16::try_from(clamped).unwrap_or(max)
}

/// Clamp a gain value into `[0, 1023]`.
#[must_use]
pub fn clamp_gain(value: i64) -> u16 {
    clamp_to_u16(value, GAIN_MIN, GAIN_MAX)
}

/// Clamp an exposure value into `[1, 496]`.
#[must_use]
pub fn clamp_exposure(value: i64) -> u16 {
    clamp_to_u16(value, EXPOSURE_MIN, EXPOSURE_MAX)
}

fn vblank_max(mode: &Mode) -> u16 {
    let height = u16::try_from(mode.height).unwrap_or(VTS_MAX);
    VTS_MAX.saturating_sub(height)
}

/// Clamp a vertical blanking value into `[92, 32767 - height]`.
#[must_use]
pub fn clamp_vblank(value: i64, mode: &Mode) -> u16 {
    clamp_to_u16(value, VBLANK_MIN, vblank_max(mode))
}

/// Gain register writes: bits 9:8, then bits 7:0.
#[must_use]
pub const fn gain_registers(gain: u16) -> [RegisterOp; 2] {
    let [high, low] = gain.to_be_bytes();
    [
        RegisterOp::new(REG_GAIN_HIGH, high & 0x03),
        RegisterOp::new(REG_GAIN_LOW, low),
    ]
}

/// Exposure register writes: nibble 3, nibbles 2-1, nibble 0 shifted up.
#[must_use]
pub const fn exposure_registers(exposure: u16) -> [RegisterOp; 3] {
    let [high, low] = exposure.to_be_bytes();
    [
        RegisterOp::new(REG_EXPOSURE_HIGH, high >> 4),
        RegisterOp::new(REG_EXPOSURE_MID, (high << 4) | (low >> 4)),
        RegisterOp::new(REG_EXPOSURE_LOW, low << 4),
    ]
}

/// Frame length register writes for `vblank` lines of blanking.
#[must_use]
pub fn vblank_registers(vblank: u16, mode: &Mode) -> [RegisterOp; 2] {
    let height = u16::try_from(mode.height).unwrap_or(0);
    let [high, low] = height.saturating_add(vblank).to_be_bytes();
    [
        RegisterOp::new(REG_VTS_HIGH, high),
        RegisterOp::new(REG_VTS_LOW, low),
    ]
}

/// Mirror register write.
#[must_use]
pub const fn hflip_register(on: bool) -> RegisterOp {
    RegisterOp::new(REG_TIMING_FORMAT2, if on { FLIP_ON } else { HFLIP_OFF })
}

/// Flip register write.
#[must_use]
pub const fn vflip_register(on: bool) -> RegisterOp {
    RegisterOp::new(REG_TIMING_FORMAT1, if on { FLIP_ON } else { VFLIP_OFF })
}

impl<B: I2c, C: ClockResource> DriverCore<B, C> {
    /// Whether control writes go to the sensor right now.
    pub(crate) const fn controls_live(&self) -> bool {
        match self.control_policy {
            ControlPolicy::Immediate => true,
            ControlPolicy::GateOnStreaming => self.state.stream.accepts_sensor_writes(),
        }
    }

    /// Clamp and cache `value`, then write it if controls are live.
    pub(crate) async fn set_control(&mut self, id: ControlId, value: i64) -> Result<()> {
        let mode = self.state.mode;
        let ops: Vec<RegisterOp> = match id {
            ControlId::Gain | ControlId::AnalogueGain => {
                let gain = clamp_gain(value);
                self.state.gain = gain;
                info!(gain, "gain");
                gain_registers(gain).to_vec()
            }
            ControlId::Exposure => {
                let exposure = clamp_exposure(value);
                self.state.exposure = exposure;
                info!(exposure, "exposure");
                exposure_registers(exposure).to_vec()
            }
            ControlId::HFlip => {
                self.state.hflip = value != 0;
                vec![hflip_register(self.state.hflip)]
            }
            ControlId::VFlip => {
                self.state.vflip = value != 0;
                vec![vflip_register(self.state.vflip)]
            }
            ControlId::VBlank => {
                let vblank = clamp_vblank(value, mode);
                self.state.vblank = vblank;
                vblank_registers(vblank, mode).to_vec()
            }
            ControlId::LinkFrequency | ControlId::PixelRate | ControlId::HBlank => {
                return Err(DriverError::ReadOnlyControl(id));
            }
        };

        if !self.controls_live() {
            debug!(control = ?id, "stream stopped, control cached");
            return Ok(());
        }
        table::apply(&mut self.transport, self.sensor, &ops).await
    }

    /// Current value of a control.
    pub(crate) fn control(&self, id: ControlId) -> i64 {
        let mode = self.state.mode;
        match id {
            ControlId::HFlip => i64::from(self.state.hflip),
            ControlId::VFlip => i64::from(self.state.vflip),
            ControlId::Gain | ControlId::AnalogueGain => i64::from(self.state.gain),
            ControlId::Exposure => i64::from(self.state.exposure),
            ControlId::VBlank => i64::from(self.state.vblank),
            ControlId::LinkFrequency | ControlId::PixelRate | ControlId::HBlank => {
                id.info(mode).default
            }
        }
    }

    /// Write every cached sensor control. Failures are logged and skipped.
    pub(crate) async fn push_controls(&mut self) {
        let mode = self.state.mode;
        let groups: [(ControlId, Vec<RegisterOp>); 5] = [
            (ControlId::Gain, gain_registers(self.state.gain).to_vec()),
            (ControlId::Exposure, exposure_registers(self.state.exposure).to_vec()),
            (ControlId::VBlank, vblank_registers(self.state.vblank, mode).to_vec()),
            (ControlId::HFlip, vec![hflip_register(self.state.hflip)]),
            (ControlId::VFlip, vec![vflip_register(self.state.vflip)]),
        ];

        for (id, ops) in groups {
            if let Err(err) = table::apply(&mut self.transport, self.sensor, &ops).await {
                warn!(control = ?id, error = %err, "applying cached control failed");
            }
        }
    }
}
