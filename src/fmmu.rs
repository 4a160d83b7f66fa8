//! Fieldbus Memory Management Unit (FMMU) register image.
//!
//! An FMMU maps a window of the logical process image onto a range of device local memory.

use crate::error::PduError;
use crate::{PduData, PduRead};
use core::fmt;

/// One FMMU entity as written to the `0x0600` register bank.
///
/// ETG1000.4 Table 56.
#[derive(Default, Copy, Clone, PartialEq, Eq)]
pub struct Fmmu {
    /// Start of the mapped window in the logical memory area, in octets.
    pub logical_start_address: u32,
    pub length_bytes: u16,
    pub logical_start_bit: u8,
    pub logical_end_bit: u8,
    pub physical_start_address: u16,
    pub physical_start_bit: u8,
    pub read_enable: bool,
    pub write_enable: bool,
    pub enable: bool,
}

impl Fmmu {
    /// Whole-byte mapping of `length_bytes` of device memory at `physical_start` into the
    /// logical image at `logical_start`.
    pub fn byte_mapping(
        logical_start: u32,
        physical_start: u16,
        length_bytes: u16,
        write: bool,
    ) -> Self {
        Self {
            logical_start_address: logical_start,
            length_bytes,
            logical_start_bit: 0,
            logical_end_bit: 7,
            physical_start_address: physical_start,
            physical_start_bit: 0,
            read_enable: !write,
            write_enable: write,
            enable: true,
        }
    }
}

impl fmt::Debug for Fmmu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fmmu")
            .field(
                "logical_start_address",
                &format_args!("{:#010x}", self.logical_start_address),
            )
            .field("length_bytes", &self.length_bytes)
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field("read_enable", &self.read_enable)
            .field("write_enable", &self.write_enable)
            .field("enable", &self.enable)
            .finish()
    }
}

impl PduRead for Fmmu {
    const LEN: u16 = 16;

    fn try_from_slice(slice: &[u8]) -> Result<Self, PduError> {
        let slice = slice.get(0..16).ok_or(PduError::Decode)?;

        Ok(Self {
            logical_start_address: u32::from_le_bytes(slice[0..4].try_into().unwrap()),
            length_bytes: u16::from_le_bytes(slice[4..6].try_into().unwrap()),
            logical_start_bit: slice[6] & 0b111,
            logical_end_bit: slice[7] & 0b111,
            physical_start_address: u16::from_le_bytes(slice[8..10].try_into().unwrap()),
            physical_start_bit: slice[10] & 0b111,
            read_enable: slice[11] & 1 != 0,
            write_enable: slice[11] & (1 << 1) != 0,
            enable: slice[12] & 1 != 0,
        })
    }
}

impl PduData for Fmmu {
    type Bytes = [u8; 16];

    fn as_bytes(&self) -> Self::Bytes {
        let mut buf = [0u8; 16];

        buf[0..4].copy_from_slice(&self.logical_start_address.to_le_bytes());
        buf[4..6].copy_from_slice(&self.length_bytes.to_le_bytes());
        buf[6] = self.logical_start_bit & 0b111;
        buf[7] = self.logical_end_bit & 0b111;
        buf[8..10].copy_from_slice(&self.physical_start_address.to_le_bytes());
        buf[10] = self.physical_start_bit & 0b111;
        buf[11] = (self.read_enable as u8) | (self.write_enable as u8) << 1;
        buf[12] = self.enable as u8;

        buf
    }
}
