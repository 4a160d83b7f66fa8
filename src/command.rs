//! Raw EtherCAT commands, e.g. `LRW`, `BRD`, `APWR`, and datagram address encodings.

use crate::error::PduError;

const NOP: u8 = 0x00;
const APRD: u8 = 0x01;
const APWR: u8 = 0x02;
const APRW: u8 = 0x03;
const FPRD: u8 = 0x04;
const FPWR: u8 = 0x05;
const FPRW: u8 = 0x06;
const BRD: u8 = 0x07;
const BWR: u8 = 0x08;
const BRW: u8 = 0x09;
const LRD: u8 = 0x0a;
const LWR: u8 = 0x0b;
const LRW: u8 = 0x0c;
const ARMW: u8 = 0x0d;
const FRMW: u8 = 0x0e;

/// Datagram command.
///
/// Auto-increment commands act on the device whose position counter reaches zero, fixed commands
/// on the device with a matching configured station address, broadcast commands on every device,
/// and logical commands on whatever maps the addressed window of the process image.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// No operation.
    #[default]
    Nop = NOP,
    /// Auto-increment read.
    Aprd = APRD,
    /// Auto-increment write.
    Apwr = APWR,
    /// Auto-increment read/write.
    Aprw = APRW,
    /// Configured address read.
    Fprd = FPRD,
    /// Configured address write.
    Fpwr = FPWR,
    /// Configured address read/write.
    Fprw = FPRW,
    /// Broadcast read.
    Brd = BRD,
    /// Broadcast write.
    Bwr = BWR,
    /// Broadcast read/write.
    Brw = BRW,
    /// Logical read.
    Lrd = LRD,
    /// Logical write.
    Lwr = LWR,
    /// Logical read/write.
    Lrw = LRW,
    /// Auto-increment read, multiple write.
    Armw = ARMW,
    /// Configured address read, multiple write.
    Frmw = FRMW,
}

impl Command {
    pub fn parse(value: u8) -> Result<Self, PduError> {
        match value {
            NOP => Ok(Self::Nop),
            APRD => Ok(Self::Aprd),
            APWR => Ok(Self::Apwr),
            APRW => Ok(Self::Aprw),
            FPRD => Ok(Self::Fprd),
            FPWR => Ok(Self::Fpwr),
            FPRW => Ok(Self::Fprw),
            BRD => Ok(Self::Brd),
            BWR => Ok(Self::Bwr),
            BRW => Ok(Self::Brw),
            LRD => Ok(Self::Lrd),
            LWR => Ok(Self::Lwr),
            LRW => Ok(Self::Lrw),
            ARMW => Ok(Self::Armw),
            FRMW => Ok(Self::Frmw),
            _ => Err(PduError::Decode),
        }
    }

    /// Working counter increment contributed by one device that fully services this command.
    pub fn wkc_increment(self) -> u16 {
        match self {
            Command::Nop => 0,
            Command::Aprd | Command::Fprd | Command::Brd | Command::Lrd => 1,
            Command::Apwr | Command::Fpwr | Command::Bwr | Command::Lwr => 1,
            Command::Armw | Command::Frmw => 1,
            Command::Aprw | Command::Fprw | Command::Brw | Command::Lrw => 3,
        }
    }
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Command::Nop => "NOP",
            Command::Aprd => "APRD",
            Command::Apwr => "APWR",
            Command::Aprw => "APRW",
            Command::Fprd => "FPRD",
            Command::Fpwr => "FPWR",
            Command::Fprw => "FPRW",
            Command::Brd => "BRD",
            Command::Bwr => "BWR",
            Command::Brw => "BRW",
            Command::Lrd => "LRD",
            Command::Lwr => "LWR",
            Command::Lrw => "LRW",
            Command::Armw => "ARMW",
            Command::Frmw => "FRMW",
        };

        f.write_str(s)
    }
}

/// Encode an (ADP, ADO) pair into the 32 bit datagram address field.
///
/// ADP is the position counter (auto-increment commands) or the configured station address
/// (fixed commands); ADO is the offset into device memory.
pub const fn create_address(adp: u16, ado: u16) -> u32 {
    (ado as u32) << 16 | adp as u32
}

/// Position-addressed encoding for auto-increment commands.
///
/// Every device increments the position counter as the datagram passes, so the device at chain
/// position `position` is addressed with the negated value.
pub const fn position_address(position: u16, ado: u16) -> u32 {
    create_address(0u16.wrapping_sub(position), ado)
}

/// Split a 32 bit datagram address field back into its (ADP, ADO) pair.
pub const fn extract_address(address: u32) -> (u16, u16) {
    (address as u16, (address >> 16) as u16)
}
