//! Mock bus and clock for testing without hardware.
//!
//! [`MockBus`] simulates the sensor (16-bit register file) and the companion
//! controller (8-bit register file with a scripted status register) on one
//! shared bus. Handles are cheap clones of the same state, so a test keeps
//! one to inspect traffic after the driver has taken ownership of the other.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};

use crate::companion::{self, REG_STATUS};
use crate::config::DEFAULT_SENSOR_ADDRESS;
use crate::traits::{ClockResource, DriverError, Result};

/// One transaction seen on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Plain write.
    Write {
        /// Device address.
        address: u8,
        /// Bytes sent, register address first.
        bytes: Vec<u8>,
    },
    /// Register address write followed by a one byte read.
    Read {
        /// Device address.
        address: u8,
        /// Register address bytes.
        reg: Vec<u8>,
    },
}

#[derive(Debug)]
struct MockState {
    sensor_address: Option<u8>,
    companion_address: Option<u8>,
    sensor_regs: HashMap<u16, u8>,
    companion_regs: HashMap<u8, u8>,
    status_script: VecDeque<u8>,
    idle_status: u8,
    status_reads: usize,
    events: Vec<BusEvent>,
    writes: usize,
    fail_write_at: Option<usize>,
}

impl MockState {
    fn new() -> Self {
        let sensor_regs = HashMap::from([
            (0x300a, 0x77),
            (0x300b, 0x50),
            (0x3029, 0x01),
            (0x30b4, 0x01),
            (0x30b3, 0x64),
            (0x30b1, 0x04),
            (0x30b0, 0x0a),
            (0x30b5, 0x05),
        ]);

        Self {
            sensor_address: Some(DEFAULT_SENSOR_ADDRESS),
            companion_address: Some(companion::DEFAULT_ADDRESS),
            sensor_regs,
            companion_regs: HashMap::new(),
            status_script: VecDeque::new(),
            idle_status: 0x80,
            status_reads: 0,
            events: Vec::new(),
            writes: 0,
            fail_write_at: None,
        }
    }

    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> std::result::Result<(), ErrorKind> {
        if self.sensor_address != Some(address) && self.companion_address != Some(address) {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }

        match operations {
            [Operation::Write(bytes)] => self.write(address, bytes),
            [Operation::Write(reg), Operation::Read(buf)] => self.read(address, reg, buf),
            _ => Err(ErrorKind::Other),
        }
    }

    fn write(&mut self, address: u8, bytes: &[u8]) -> std::result::Result<(), ErrorKind> {
        self.writes += 1;
        self.events.push(BusEvent::Write {
            address,
            bytes: bytes.to_vec(),
        });

        if self.fail_write_at == Some(self.writes) {
            return Err(ErrorKind::ArbitrationLoss);
        }

        if self.sensor_address == Some(address) {
            let [hi, lo, value] = bytes else {
                return Err(ErrorKind::Other);
            };
            self.sensor_regs.insert(u16::from_be_bytes([*hi, *lo]), *value);
        } else {
            let [reg, value] = bytes else {
                return Err(ErrorKind::Other);
            };
            self.companion_regs.insert(*reg, *value);
        }
        Ok(())
    }

    fn read(&mut self, address: u8, reg: &[u8], buf: &mut [u8]) -> std::result::Result<(), ErrorKind> {
        self.events.push(BusEvent::Read {
            address,
            reg: reg.to_vec(),
        });

        let value = if self.sensor_address == Some(address) {
            let [hi, lo] = reg else {
                return Err(ErrorKind::Other);
            };
            self.sensor_regs
                .get(&u16::from_be_bytes([*hi, *lo]))
                .copied()
                .unwrap_or(0)
        } else {
            let [reg] = reg else {
                return Err(ErrorKind::Other);
            };
            if *reg == REG_STATUS {
                self.status_reads += 1;
                self.status_script.pop_front().unwrap_or(self.idle_status)
            } else {
                self.companion_regs.get(reg).copied().unwrap_or(0)
            }
        };

        if let Some(first) = buf.first_mut() {
            *first = value;
        }
        Ok(())
    }
}

/// Simulated bus with a sensor at 0x60 and a companion controller at 0x10.
#[derive(Debug, Clone)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    /// Create a bus with both devices present and the companion reporting ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new())),
        }
    }

    /// Remove the companion controller from the bus.
    #[must_use]
    pub fn without_companion(self) -> Self {
        self.with(|state| state.companion_address = None);
        self
    }

    /// Remove the sensor from the bus.
    #[must_use]
    pub fn without_sensor(self) -> Self {
        self.with(|state| state.sensor_address = None);
        self
    }

    fn with<R, F: FnOnce(&mut MockState) -> R>(&self, f: F) -> R {
        let mut state = self.state.lock().expect("mock bus lock poisoned");
        f(&mut state)
    }

    /// Queue status bytes returned by the next status reads.
    pub fn push_status(&self, statuses: &[u8]) {
        self.with(|state| state.status_script.extend(statuses.iter().copied()));
    }

    /// Status returned once the script is exhausted.
    pub fn set_idle_status(&self, status: u8) {
        self.with(|state| state.idle_status = status);
    }

    /// Number of status register reads so far.
    pub fn status_reads(&self) -> usize {
        self.with(|state| state.status_reads)
    }

    /// Load the companion identity block.
    pub fn set_companion_rom(&self, rom: &[u8]) {
        self.with(|state| {
            for (reg, byte) in (0..=u8::MAX).zip(rom) {
                state.companion_regs.insert(reg, *byte);
            }
        });
    }

    /// Preset a sensor register.
    pub fn set_sensor_register(&self, reg: u16, value: u8) {
        self.with(|state| state.sensor_regs.insert(reg, value));
    }

    /// Current value of a sensor register, if it was ever set.
    pub fn sensor_register(&self, reg: u16) -> Option<u8> {
        self.with(|state| state.sensor_regs.get(&reg).copied())
    }

    /// Current value of a companion register, if it was ever set.
    pub fn companion_register(&self, reg: u8) -> Option<u8> {
        self.with(|state| state.companion_regs.get(&reg).copied())
    }

    /// Make the `n`th write from now fail (1-based).
    pub fn fail_write_at(&self, n: usize) {
        self.with(|state| state.fail_write_at = Some(state.writes + n));
    }

    /// All transactions so far.
    pub fn events(&self) -> Vec<BusEvent> {
        self.with(|state| state.events.clone())
    }

    /// Forget recorded transactions.
    pub fn clear_events(&self) {
        self.with(|state| state.events.clear());
    }

    /// Number of write transactions attempted.
    pub fn write_count(&self) -> usize {
        self.with(|state| state.writes)
    }

    /// Sensor writes as `(register, value)`, in bus order.
    pub fn sensor_writes(&self) -> Vec<(u16, u8)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BusEvent::Write { address, bytes } if address == DEFAULT_SENSOR_ADDRESS => {
                    match bytes.as_slice() {
                        [hi, lo, value] => Some((u16::from_be_bytes([*hi, *lo]), *value)),
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect()
    }

    /// Companion writes as `(register, value)`, in bus order.
    pub fn companion_writes(&self) -> Vec<(u8, u8)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BusEvent::Write { address, bytes } if address == companion::DEFAULT_ADDRESS => {
                    match bytes.as_slice() {
                        [reg, value] => Some((*reg, *value)),
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect()
    }
}

impl ErrorType for MockBus {
    type Error = ErrorKind;
}

impl I2c for MockBus {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> std::result::Result<(), Self::Error> {
        self.with(|state| state.transaction(address, operations))
    }
}

#[derive(Debug, Default)]
struct ClockState {
    enabled: bool,
    enables: usize,
    fail_enable: bool,
}

/// Clock resource that records its use.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    state: Arc<Mutex<ClockState>>,
}

impl MockClock {
    /// Create a disabled clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every enable fail.
    pub fn fail_enable(&self) {
        self.state.lock().expect("mock clock lock poisoned").fail_enable = true;
    }

    /// Whether the clock is running.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().expect("mock clock lock poisoned").enabled
    }

    /// Number of successful enables.
    pub fn enable_count(&self) -> usize {
        self.state.lock().expect("mock clock lock poisoned").enables
    }
}

impl ClockResource for MockClock {
    fn enable(&mut self) -> Result<()> {
        let mut state = self.state.lock().expect("mock clock lock poisoned");
        if state.fail_enable {
            return Err(DriverError::Power("clock failed to start".to_owned()));
        }
        state.enabled = true;
        state.enables += 1;
        Ok(())
    }

    fn disable(&mut self) {
        self.state.lock().expect("mock clock lock poisoned").enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_script_then_idle() {
        let mut bus = MockBus::new();
        bus.push_status(&[0x00, 0x81]);
        let mut buf = [0u8; 1];

        for expected in [0x00, 0x81, 0x80, 0x80] {
            bus.write_read(0x10, &[REG_STATUS], &mut buf).expect("read");
            assert_eq!(buf[0], expected);
        }
        assert_eq!(bus.status_reads(), 4);
    }

    #[test]
    fn test_absent_device_naks() {
        let mut bus = MockBus::new().without_companion();
        let err = bus.write(0x10, &[200, 1]).expect_err("no device at 0x10");
        assert_eq!(err, ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
    }

    #[test]
    fn test_fail_write_is_relative() {
        let mut bus = MockBus::new();
        bus.write(0x60, &[0x01, 0x00, 0x01]).expect("first write");
        bus.fail_write_at(2);
        bus.write(0x60, &[0x01, 0x00, 0x00]).expect("second write");
        assert!(bus.write(0x60, &[0x01, 0x00, 0x01]).is_err());
        assert_eq!(bus.sensor_register(0x0100), Some(0x00));
    }

    #[test]
    fn test_clock_tracks_state() {
        let mut clock = MockClock::new();
        clock.enable().expect("enable");
        assert!(clock.is_enabled());
        clock.disable();
        assert!(!clock.is_enabled());
        assert_eq!(clock.enable_count(), 1);
    }
}
