//! Register tables and the fail-fast table player.

use embedded_hal::i2c::I2c;
use tracing::debug;

use crate::traits::Result;
use crate::transport::{BusDevice, Transport};

/// One register write: 16-bit address, 8-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOp {
    /// Register address.
    pub address: u16,
    /// Value to write.
    pub value: u8,
}

impl RegisterOp {
    /// Address that terminates a table.
    pub const END_ADDRESS: u16 = 0xffff;

    /// Table terminator.
    pub const END: Self = Self::new(Self::END_ADDRESS, 0x00);

    /// Create a register write.
    #[must_use]
    pub const fn new(address: u16, value: u8) -> Self {
        Self { address, value }
    }

    /// Whether this entry terminates its table.
    #[must_use]
    pub const fn is_end(self) -> bool {
        self.address == Self::END_ADDRESS
    }
}

/// Write `table` to `device` in order, stopping at the terminator or at the
/// end of the slice.
///
/// The first failing write aborts the table. Registers already written keep
/// their new values; tables are safe to re-apply from the start.
pub async fn apply<B: I2c>(
    transport: &mut Transport<B>,
    device: BusDevice,
    table: &[RegisterOp],
) -> Result<()> {
    let mut written = 0usize;
    for op in table.iter().take_while(|op| !op.is_end()) {
        transport.write(device, op.address, op.value).await?;
        written += 1;
    }
    debug!(address = device.address, written, "register table applied");
    Ok(())
}
