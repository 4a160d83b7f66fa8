//! Datagram header and flags.

use crate::command::Command;
use crate::error::PduError;
use crate::LEN_MASK;

/// Length of a datagram header on the wire.
pub const DATAGRAM_HEADER_LEN: usize = 10;

/// Length of the working counter trailing every datagram.
pub const WKC_LEN: usize = 2;

/// `LEN`, `C` and `NEXT` fields following the address in every datagram header.
///
/// ETG1000.4 5.4.1.2 Table 14.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct PduFlags {
    /// Data length of this datagram, 11 bits.
    pub length: u16,
    /// Set once the frame has passed the first device's processing unit, i.e. it circulated.
    pub circulated: bool,
    /// Set on every datagram of a frame except the last.
    pub is_not_last: bool,
}

impl PduFlags {
    pub const fn with_len(len: u16) -> Self {
        Self {
            length: len,
            circulated: false,
            is_not_last: false,
        }
    }

    pub fn pack(&self) -> [u8; 2] {
        let raw = self.length & LEN_MASK
            | (self.circulated as u16) << 14
            | (self.is_not_last as u16) << 15;

        raw.to_le_bytes()
    }

    pub fn unpack_from_slice(buf: &[u8]) -> Result<Self, PduError> {
        let raw = buf
            .get(0..2)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u16::from_le_bytes)
            .ok_or(PduError::Decode)?;

        Ok(Self {
            length: raw & LEN_MASK,
            circulated: (raw >> 14) & 0x01 == 0x01,
            is_not_last: (raw >> 15) & 0x01 == 0x01,
        })
    }
}

/// The 10 byte header in front of every datagram's data area.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DatagramHeader {
    pub command: Command,
    /// Master-assigned index used to match the response back to its in-flight slot.
    pub index: u8,
    /// Raw 32 bit address field; see [`crate::command`] for the encodings.
    pub address: u32,
    pub flags: PduFlags,
    /// IRQ event request mirror, left as raw bits.
    pub irq: u16,
}

impl DatagramHeader {
    pub fn pack(&self) -> [u8; DATAGRAM_HEADER_LEN] {
        let mut buf = [0u8; DATAGRAM_HEADER_LEN];

        buf[0] = self.command as u8;
        buf[1] = self.index;
        buf[2..6].copy_from_slice(&self.address.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.pack());
        buf[8..10].copy_from_slice(&self.irq.to_le_bytes());

        buf
    }

    pub fn unpack_from_slice(buf: &[u8]) -> Result<Self, PduError> {
        let buf = buf.get(0..DATAGRAM_HEADER_LEN).ok_or(PduError::Decode)?;

        Ok(Self {
            command: Command::parse(buf[0])?,
            index: buf[1],
            address: u32::from_le_bytes(buf[2..6].try_into().unwrap()),
            flags: PduFlags::unpack_from_slice(&buf[6..8])?,
            irq: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::create_address;

    #[test]
    fn pdu_flags_round_trip() {
        let flags = PduFlags {
            length: 0x110,
            circulated: false,
            is_not_last: true,
        };

        let packed = flags.pack();

        assert_eq!(packed, [0x10, 0x81]);
        assert_eq!(PduFlags::unpack_from_slice(&packed).unwrap(), flags);
    }

    #[test]
    fn correct_length() {
        let flags = PduFlags::with_len(1036);

        assert_eq!(flags.pack(), [0x0c, 0x04]);
    }

    #[test]
    fn header_round_trip() {
        let header = DatagramHeader {
            command: Command::Fprd,
            index: 0x42,
            address: create_address(0x1001, 0x0130),
            flags: PduFlags::with_len(2),
            irq: 0,
        };

        let packed = header.pack();

        assert_eq!(packed[0], 0x04);
        assert_eq!(packed[1], 0x42);
        // ADP then ADO, both little-endian
        assert_eq!(&packed[2..6], &[0x01, 0x10, 0x30, 0x01]);

        assert_eq!(DatagramHeader::unpack_from_slice(&packed).unwrap(), header);
    }

    #[test]
    fn unknown_command_refused() {
        let mut packed = DatagramHeader {
            command: Command::Brd,
            index: 0,
            address: 0,
            flags: PduFlags::with_len(1),
            irq: 0,
        }
        .pack();

        packed[0] = 0x7f;

        assert_eq!(
            DatagramHeader::unpack_from_slice(&packed),
            Err(PduError::Decode)
        );
    }
}
