//! OV7251 driver instance built on an `embedded-hal` I2C bus.

use std::fmt;

use async_trait::async_trait;
use embedded_hal::i2c::I2c;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::companion::{Companion, CompanionIdentity, CompanionState};
use crate::config::{CompanionPolicy, DriverConfig};
use crate::controls::{ControlId, ControlInfo};
use crate::modes::{self, Mode, PIXEL_ARRAY_HEIGHT, PIXEL_ARRAY_WIDTH};
use crate::streaming::{DeviceState, DriverCore};
use crate::traits::{
    ClockResource, DriverError, Format, FormatWhich, FrameSizeRange, MbusConfig, MbusType,
    PixelFormat, Rect, Result, SelectionTarget, SensorSubdevice,
};
use crate::transport::{BusDevice, Transport};

/// Name the driver registers under.
pub const DRIVER_NAME: &str = "inno_mipi_ov7251";
/// Device-tree compatible string.
pub const COMPATIBLE: &str = "ovti,ov7251";
/// Expected value of the chip id registers.
pub const CHIP_ID: u16 = 0x7750;

const REG_CHIP_ID_HIGH: u16 = 0x300a;
const REG_CHIP_ID_LOW: u16 = 0x300b;
const REG_SC_GP_IO_IN1: u16 = 0x3029;

const PLL1_REGISTERS: [(u16, &str); 5] = [
    (0x30b4, "pre_div0"),
    (0x30b3, "multiplier"),
    (0x30b1, "div_sys"),
    (0x30b0, "div_pix"),
    (0x30b5, "mipi_div"),
];

const MIPI_DATA_LANES: u8 = 1;

/// Chip identification read from the sensor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorIdentity {
    /// Chip id, `0x7750` for an OV7251.
    pub chip_id: u16,
    /// Lot / GPIO input byte.
    pub lot: u8,
}

/// An attached OV7251.
///
/// All operations on one instance are serialized through an internal lock;
/// the instance can be shared between tasks behind an `Arc`.
pub struct Ov7251<B, C> {
    core: Mutex<DriverCore<B, C>>,
    mode: &'static Mode,
    identity: Option<CompanionIdentity>,
    sensor_identity: Option<SensorIdentity>,
}

impl<B, C> fmt::Debug for Ov7251<B, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ov7251")
            .field("mode", &self.mode.index)
            .field("identity", &self.identity)
            .field("sensor_identity", &self.sensor_identity)
            .finish_non_exhaustive()
    }
}

impl<B: I2c, C: ClockResource> Ov7251<B, C> {
    /// Attach to a sensor on `bus`.
    ///
    /// Waits for the companion firmware to boot, detects the companion, reads
    /// its identity block and brings it up in the configured mode. Companion
    /// identity and bring-up failures are logged; only a missing companion
    /// under [`CompanionPolicy::Required`] fails the attach. Without a
    /// companion the sensor's chip id is read directly.
    pub async fn attach(bus: B, clock: C, config: &DriverConfig) -> Result<Self> {
        config.validate()?;
        let mode = modes::mode(config.mode)?;
        let timing = config.timing.clone();
        let mut transport = Transport::new(bus, timing.settle());
        let sensor = BusDevice::sensor(config.sensor_address);

        info!(
            sensor = config.sensor_address,
            companion = config.companion_address,
            mode = mode.index,
            "attaching ov7251"
        );
        tokio::time::sleep(timing.boot_delay()).await;

        let mut companion = Companion::new(config.companion_address, timing)
            .with_ready_policy(config.ready_policy);
        let mut identity = None;
        let companion = if companion.detect(&mut transport).await {
            match companion.read_identity(&mut transport).await {
                Ok(id) => {
                    info!(
                        manufacturer = %id.manufacturer,
                        sensor = %id.sensor_type,
                        module_id = id.module_id,
                        revision = id.module_revision,
                        modes = id.mode_count,
                        "camera module identified"
                    );
                    identity = Some(id);
                }
                Err(err) => warn!(error = %err, "reading camera module identity failed"),
            }
            if let Err(err) = companion.bring_up(&mut transport, mode).await {
                warn!(mode = mode.index, error = %err, "camera controller bring-up incomplete");
            }
            Some(companion)
        } else {
            match config.companion_policy {
                CompanionPolicy::Required => {
                    warn!(address = config.companion_address, "camera controller not found");
                    return Err(DriverError::CompanionNotFound(config.companion_address));
                }
                CompanionPolicy::Optional => {
                    warn!(
                        address = config.companion_address,
                        "camera controller not found, using sensor directly"
                    );
                    None
                }
            }
        };

        let mut core = DriverCore::new(
            transport,
            sensor,
            companion,
            clock,
            mode,
            config.control_policy,
        );
        core.log_pll().await;
        let sensor_identity = if core.companion.is_none() {
            Some(core.identify_sensor().await?)
        } else {
            None
        };

        info!(mode = mode.index, format = ?mode.pixel_format, "ov7251 attached");
        Ok(Self {
            core: Mutex::new(core),
            mode,
            identity,
            sensor_identity,
        })
    }

    /// Stop streaming, switch the clock off and give the bus back.
    pub async fn detach(self) -> B {
        let mut core = self.core.into_inner();
        if let Err(err) = core.stop().await {
            warn!(error = %err, "stream-off during detach failed");
        }
        core.power_off();
        info!("ov7251 detached");
        core.transport.release()
    }

    /// Mode fixed at attach.
    #[must_use]
    pub const fn mode(&self) -> &'static Mode {
        self.mode
    }

    /// Companion identity block, when it could be read.
    #[must_use]
    pub const fn identity(&self) -> Option<&CompanionIdentity> {
        self.identity.as_ref()
    }

    /// Sensor chip id, read only when no companion is present.
    #[must_use]
    pub const fn sensor_identity(&self) -> Option<SensorIdentity> {
        self.sensor_identity
    }

    /// Snapshot of the device state.
    pub async fn state(&self) -> DeviceState {
        self.core.lock().await.state.clone()
    }

    /// Companion controller state.
    pub async fn companion_state(&self) -> CompanionState {
        self.core.lock().await.companion_state()
    }

    /// Pixel rate of the current mode.
    #[must_use]
    pub const fn pixel_rate(&self) -> u64 {
        self.mode.pixel_rate()
    }

    /// Range and default of a control in the current mode.
    #[must_use]
    pub fn control_info(&self, id: ControlId) -> ControlInfo {
        id.info(self.mode)
    }

    /// Set the sensor gain (clamped to `[0, 1023]`).
    pub async fn set_gain(&self, gain: i64) -> Result<()> {
        self.core.lock().await.set_control(ControlId::Gain, gain).await
    }

    /// Set the exposure in lines (clamped to `[1, 496]`).
    pub async fn set_exposure(&self, exposure: i64) -> Result<()> {
        self.core.lock().await.set_control(ControlId::Exposure, exposure).await
    }

    /// Mirror the image horizontally.
    pub async fn set_hflip(&self, on: bool) -> Result<()> {
        self.core.lock().await.set_control(ControlId::HFlip, i64::from(on)).await
    }

    /// Flip the image vertically.
    pub async fn set_vflip(&self, on: bool) -> Result<()> {
        self.core.lock().await.set_control(ControlId::VFlip, i64::from(on)).await
    }

    /// Set the vertical blanking in lines.
    pub async fn set_vblank(&self, vblank: i64) -> Result<()> {
        self.core.lock().await.set_control(ControlId::VBlank, vblank).await
    }

    /// Set a control by V4L2 control id. Unknown ids are rejected before any
    /// bus access.
    pub async fn set_control_cid(&self, cid: u32, value: i64) -> Result<()> {
        let id = ControlId::from_cid(cid).ok_or(DriverError::InvalidControl(cid))?;
        self.core.lock().await.set_control(id, value).await
    }

    /// Read a control by V4L2 control id.
    pub async fn control_cid(&self, cid: u32) -> Result<i64> {
        let id = ControlId::from_cid(cid).ok_or(DriverError::InvalidControl(cid))?;
        Ok(self.core.lock().await.control(id))
    }

    fn pixel_array() -> Rect {
        Rect {
            left: 0,
            top: 0,
            width: PIXEL_ARRAY_WIDTH,
            height: PIXEL_ARRAY_HEIGHT,
        }
    }
}

impl<B: I2c, C: ClockResource> DriverCore<B, C> {
    async fn log_pll(&mut self) {
        for (reg, name) in PLL1_REGISTERS {
            if let Ok(value) = self.transport.read(self.sensor, reg).await {
                debug!(reg, value, name, "pll1");
            }
        }
    }

    async fn identify_sensor(&mut self) -> Result<SensorIdentity> {
        self.set_power(true)?;
        let identity = self.read_sensor_identity().await;
        self.power_off();
        let identity = identity?;

        if identity.chip_id == CHIP_ID {
            info!(chip_id = identity.chip_id, lot = identity.lot, "ov7251 detected");
        } else {
            warn!(
                chip_id = identity.chip_id,
                expected = CHIP_ID,
                "unexpected chip id, continuing"
            );
        }
        Ok(identity)
    }

    async fn read_sensor_identity(&mut self) -> Result<SensorIdentity> {
        let high = self.transport.read(self.sensor, REG_CHIP_ID_HIGH).await?;
        let low = self.transport.read(self.sensor, REG_CHIP_ID_LOW).await?;
        let lot = self.transport.read(self.sensor, REG_SC_GP_IO_IN1).await?;
        Ok(SensorIdentity {
            chip_id: u16::from_be_bytes([high, low]),
            lot,
        })
    }
}

#[async_trait]
impl<B, C> SensorSubdevice for Ov7251<B, C>
where
    B: I2c + Send,
    C: ClockResource + Send,
{
    async fn power(&self, on: bool) -> Result<()> {
        self.core.lock().await.set_power(on)
    }

    async fn stream_enable(&self, enable: bool) -> Result<()> {
        self.core.lock().await.set_stream(enable).await
    }

    fn format(&self, _which: FormatWhich) -> Format {
        self.mode.format()
    }

    fn set_format(&self, which: FormatWhich, requested: &Format) -> Format {
        let format = self.mode.format();
        if *requested != format {
            debug!(?which, ?requested, ?format, "format fixed by mode");
        }
        format
    }

    fn enum_mbus_code(&self, index: u32) -> Result<PixelFormat> {
        match index {
            0 => Ok(self.mode.pixel_format),
            _ => Err(DriverError::InvalidArgument(format!(
                "media bus code index {index}"
            ))),
        }
    }

    fn enum_frame_size(&self, index: u32, code: u32) -> Result<FrameSizeRange> {
        if index != 0 {
            return Err(DriverError::InvalidArgument(format!(
                "frame size index {index}"
            )));
        }
        if PixelFormat::from_media_bus_code(code) != Some(self.mode.pixel_format) {
            return Err(DriverError::InvalidArgument(format!(
                "media bus code 0x{code:04x}"
            )));
        }
        Ok(FrameSizeRange {
            min_width: self.mode.width,
            max_width: self.mode.width,
            min_height: self.mode.height,
            max_height: self.mode.height,
        })
    }

    fn selection(&self, target: SelectionTarget) -> Result<Rect> {
        match target {
            SelectionTarget::Crop
            | SelectionTarget::CropDefault
            | SelectionTarget::CropBounds
            | SelectionTarget::NativeSize => Ok(Self::pixel_array()),
            SelectionTarget::Compose => Err(DriverError::InvalidArgument(
                "compose selection".to_owned(),
            )),
        }
    }

    fn mbus_config(&self) -> MbusConfig {
        MbusConfig {
            bus_type: MbusType::Csi2Dphy,
            data_lanes: MIPI_DATA_LANES,
            continuous_clock: false,
        }
    }

    async fn set_control(&self, id: ControlId, value: i64) -> Result<()> {
        self.core.lock().await.set_control(id, value).await
    }

    async fn control(&self, id: ControlId) -> i64 {
        self.core.lock().await.control(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion::{CMD_POWER_DOWN, CMD_START, IDENTITY_LEN, REG_COMMAND, REG_MODE};
    use crate::mock::{BusEvent, MockBus, MockClock};
    use crate::streaming::{StreamState, MODE_SELECT_STREAMING, REG_MODE_SELECT};
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    async fn attach(bus: &MockBus, config: &DriverConfig) -> Ov7251<MockBus, MockClock> {
        Ov7251::attach(bus.clone(), MockClock::new(), config)
            .await
            .expect("attach should succeed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_brings_up_companion() {
        let bus = MockBus::new();
        let started = tokio::time::Instant::now();

        let device = attach(&bus, &DriverConfig::default()).await;

        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(
            bus.companion_writes(),
            vec![(REG_COMMAND, CMD_POWER_DOWN), (REG_MODE, 1), (REG_COMMAND, CMD_START)]
        );
        assert_eq!(device.companion_state().await, CompanionState::Ready);
        assert_eq!(bus.status_reads(), 1);
        assert_eq!(device.sensor_identity(), None);
        assert_eq!(device.state().await.stream, StreamState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_reads_identity_block() {
        let mut rom = vec![0u8; IDENTITY_LEN];
        rom[12..21].copy_from_slice(b"InnoMaker");
        rom[54..60].copy_from_slice(b"OV7251");
        rom[130..132].copy_from_slice(&4u16.to_le_bytes());
        let bus = MockBus::new();
        bus.set_companion_rom(&rom);

        let device = attach(&bus, &DriverConfig::default()).await;

        let identity = device.identity().expect("identity should be read");
        assert_eq!(identity.manufacturer, "InnoMaker");
        assert_eq!(identity.sensor_type, "OV7251");
        assert_eq!(identity.mode_count, 4);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_attach_tolerates_companion_timeout() {
        let bus = MockBus::new();
        bus.set_idle_status(0x00);

        let device = attach(&bus, &DriverConfig::default()).await;

        assert_eq!(bus.status_reads(), 15);
        assert_eq!(device.companion_state().await, CompanionState::Failed);
        assert!(logs_contain("bring-up incomplete"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_attach_accepts_ready_bit_with_error() {
        let bus = MockBus::new();
        bus.push_status(&[0x00, 0x00, 0x81]);
        bus.set_idle_status(0x00);

        let device = attach(&bus, &DriverConfig::legacy()).await;

        assert_eq!(device.companion_state().await, CompanionState::Ready);
        assert_eq!(bus.status_reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_requires_companion_by_default() {
        let bus = MockBus::new().without_companion();

        let err = Ov7251::attach(bus, MockClock::new(), &DriverConfig::default())
            .await
            .expect_err("companion is required");

        assert!(matches!(err, DriverError::CompanionNotFound(0x10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_without_companion_reads_chip_id() {
        let bus = MockBus::new().without_companion();
        let clock = MockClock::new();

        let device = Ov7251::attach(bus.clone(), clock.clone(), &DriverConfig::legacy())
            .await
            .expect("optional companion");

        assert_eq!(
            device.sensor_identity(),
            Some(SensorIdentity {
                chip_id: CHIP_ID,
                lot: 0x01
            })
        );
        assert_eq!(clock.enable_count(), 1);
        assert!(!clock.is_enabled());
        assert!(!device.state().await.power);
        assert_eq!(device.companion_state().await, CompanionState::Absent);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_chip_id_mismatch_only_warns() {
        let bus = MockBus::new().without_companion();
        bus.set_sensor_register(0x300b, 0x51);

        let device = attach(&bus, &DriverConfig::legacy()).await;

        assert_eq!(device.sensor_identity().map(|id| id.chip_id), Some(0x7751));
        assert!(logs_contain("unexpected chip id"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_fails_when_nothing_answers() {
        let bus = MockBus::new().without_companion().without_sensor();
        let clock = MockClock::new();

        let err = Ov7251::attach(bus, clock.clone(), &DriverConfig::legacy())
            .await
            .expect_err("sensor unreachable");

        assert!(matches!(err, DriverError::Bus { address: 0x60, .. }));
        assert!(!clock.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_rejects_unknown_mode() {
        let err = Ov7251::attach(MockBus::new(), MockClock::new(), &DriverConfig::default().with_mode(4))
            .await
            .expect_err("mode 4 does not exist");

        assert!(matches!(err, DriverError::UnknownMode(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_reads_pll_registers() {
        let bus = MockBus::new();
        attach(&bus, &DriverConfig::default()).await;

        let pll_reads = bus
            .events()
            .iter()
            .filter(|event| matches!(event, BusEvent::Read { address: 0x60, reg } if reg[0] == 0x30))
            .count();
        assert_eq!(pll_reads, PLL1_REGISTERS.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_control_rejected_before_bus_access() {
        let bus = MockBus::new();
        let device = attach(&bus, &DriverConfig::legacy()).await;
        bus.clear_events();

        let err = device
            .set_control_cid(0x0098_0900, 5)
            .await
            .expect_err("brightness is not exposed");

        assert!(matches!(err, DriverError::InvalidControl(0x0098_0900)));
        assert!(bus.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_controls_by_cid() {
        let bus = MockBus::new();
        let device = attach(&bus, &DriverConfig::default()).await;

        device
            .set_control_cid(ControlId::CID_EXPOSURE, 1000)
            .await
            .expect("exposure accepted");

        assert_eq!(device.control_cid(ControlId::CID_EXPOSURE).await.expect("known"), 496);
        assert_eq!(
            device.control_cid(ControlId::CID_PIXEL_RATE).await.expect("known"),
            i64::try_from(device.pixel_rate()).expect("fits")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_cycle_through_subdevice() {
        let bus = MockBus::new();
        let device = attach(&bus, &DriverConfig::default()).await;

        device.power(true).await.expect("power on");
        device.set_gain(0x20).await.expect("cached");
        device.stream_enable(true).await.expect("stream on");
        assert!(device.state().await.streaming());
        assert_eq!(bus.sensor_register(0x350b), Some(0x20));

        device.set_hflip(true).await.expect("live write");
        assert_eq!(bus.sensor_register(0x3821), Some(0x04));

        device.stream_enable(false).await.expect("stream off");
        assert_eq!(bus.sensor_register(REG_MODE_SELECT), Some(0x00));
        assert_eq!(device.companion_state().await, CompanionState::Detected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_start_cancelled_by_timeout() {
        let bus = MockBus::new();
        bus.set_idle_status(0x00);
        let device = attach(&bus, &DriverConfig::default()).await;
        device.power(true).await.expect("power on");

        let elapsed =
            tokio::time::timeout(Duration::from_millis(300), device.stream_enable(true)).await;

        assert!(elapsed.is_err());
        assert_eq!(device.state().await.stream, StreamState::Stopped);
        assert_eq!(device.companion_state().await, CompanionState::Failed);

        bus.clear_events();
        device.set_gain(0x155).await.expect("cached while stopped");
        assert!(bus.sensor_writes().is_empty());
        assert_eq!(device.state().await.gain, 0x155);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_stops_stream_and_returns_bus() {
        let bus = MockBus::new();
        let clock = MockClock::new();
        let device = Ov7251::attach(bus.clone(), clock.clone(), &DriverConfig::default())
            .await
            .expect("attach");
        device.power(true).await.expect("power on");
        device.stream_enable(true).await.expect("stream on");

        let returned = device.detach().await;

        assert_eq!(returned.sensor_register(REG_MODE_SELECT), Some(0x00));
        assert_eq!(bus.companion_writes().last(), Some(&(REG_COMMAND, CMD_POWER_DOWN)));
        assert!(!clock.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_operations_do_not_interleave() {
        let bus = MockBus::new();
        let device = Arc::new(attach(&bus, &DriverConfig::legacy()).await);
        bus.clear_events();

        let streamer = {
            let device = Arc::clone(&device);
            tokio::spawn(async move { device.stream_enable(true).await })
        };
        let tuner = {
            let device = Arc::clone(&device);
            tokio::spawn(async move { device.set_gain(0x155).await })
        };
        streamer.await.expect("task").expect("stream on");
        tuner.await.expect("task").expect("gain");

        let events = bus.events();
        let mode_write = events
            .iter()
            .position(|event| *event == BusEvent::Write { address: 0x10, bytes: vec![REG_MODE, 1] })
            .expect("mode written");
        let stream_on = events
            .iter()
            .position(|event| {
                *event
                    == BusEvent::Write {
                        address: 0x60,
                        bytes: vec![0x01, 0x00, MODE_SELECT_STREAMING],
                    }
            })
            .expect("stream enabled");
        let sensor_writes_during_start = events[mode_write..stream_on]
            .iter()
            .filter(|event| matches!(event, BusEvent::Write { address: 0x60, .. }))
            .count();
        // Only the nine cached control writes belong to the start sequence.
        assert_eq!(sensor_writes_during_start, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_format_surface() {
        let bus = MockBus::new();
        let device = attach(&bus, &DriverConfig::default().with_mode(0)).await;

        let format = device.format(FormatWhich::Active);
        assert_eq!(format, Format::new(640, 480, PixelFormat::Y10));

        let requested = Format::new(320, 240, PixelFormat::Y8);
        assert_eq!(device.set_format(FormatWhich::Try, &requested), format);
        assert_eq!(device.set_format(FormatWhich::Active, &requested), format);

        assert_eq!(device.enum_mbus_code(0).expect("one code"), PixelFormat::Y10);
        assert!(device.enum_mbus_code(1).is_err());

        let sizes = device
            .enum_frame_size(0, PixelFormat::MBUS_Y10_1X10)
            .expect("vga");
        assert_eq!((sizes.max_width, sizes.max_height), (640, 480));
        assert!(device.enum_frame_size(0, PixelFormat::MBUS_Y8_1X8).is_err());
        assert!(device.enum_frame_size(1, PixelFormat::MBUS_Y10_1X10).is_err());

        let crop = device.selection(SelectionTarget::CropBounds).expect("bounds");
        assert_eq!((crop.width, crop.height), (640, 480));
        assert!(device.selection(SelectionTarget::Compose).is_err());

        let mbus = device.mbus_config();
        assert_eq!(mbus.data_lanes, 1);
        assert!(!mbus.continuous_clock);
    }
}
