//! Sync manager channel register image.

use crate::error::PduError;
use crate::{PduData, PduRead};
use core::fmt;

/// One sync manager channel as written to the `0x0800` register bank.
///
/// Defined in ETG1000.4 6.7.2.
#[derive(Default, Copy, Clone, PartialEq, Eq)]
pub struct SyncManagerChannel {
    pub physical_start_address: u16,
    pub length_bytes: u16,
    pub control: Control,
    pub status: Status,
    pub enable: Enable,
}

impl SyncManagerChannel {
    /// Channel 0 configuration: master to device mailbox.
    pub fn mailbox_write(start: u16, len: u16) -> Self {
        Self {
            physical_start_address: start,
            length_bytes: len,
            control: Control {
                operation_mode: OperationMode::Mailbox,
                direction: Direction::MasterWrite,
                ..Default::default()
            },
            status: Status::default(),
            enable: Enable {
                enable: true,
                ..Default::default()
            },
        }
    }

    /// Channel 1 configuration: device to master mailbox.
    pub fn mailbox_read(start: u16, len: u16) -> Self {
        Self {
            physical_start_address: start,
            length_bytes: len,
            control: Control {
                operation_mode: OperationMode::Mailbox,
                direction: Direction::MasterRead,
                ..Default::default()
            },
            status: Status::default(),
            enable: Enable {
                enable: true,
                ..Default::default()
            },
        }
    }

    /// Buffered process data channel.
    pub fn process_data(start: u16, len: u16, direction: Direction) -> Self {
        Self {
            physical_start_address: start,
            length_bytes: len,
            control: Control {
                operation_mode: OperationMode::Buffered,
                direction,
                watchdog_enable: direction == Direction::MasterWrite,
                ..Default::default()
            },
            status: Status::default(),
            enable: Enable {
                enable: len > 0,
                ..Default::default()
            },
        }
    }
}

impl fmt::Debug for SyncManagerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncManagerChannel")
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field("length_bytes", &self.length_bytes)
            .field("control", &self.control)
            .field("status", &self.status)
            .field("enable", &self.enable)
            .finish()
    }
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct Control {
    pub operation_mode: OperationMode,
    pub direction: Direction,
    pub ecat_event_enable: bool,
    pub dls_user_event_enable: bool,
    pub watchdog_enable: bool,
}

impl Control {
    fn pack(&self) -> u8 {
        self.operation_mode as u8
            | (self.direction as u8) << 2
            | (self.ecat_event_enable as u8) << 4
            | (self.dls_user_event_enable as u8) << 5
            | (self.watchdog_enable as u8) << 6
    }

    fn unpack(raw: u8) -> Result<Self, PduError> {
        Ok(Self {
            operation_mode: OperationMode::parse(raw & 0b11)?,
            direction: Direction::parse((raw >> 2) & 0b11)?,
            ecat_event_enable: raw & (1 << 4) != 0,
            dls_user_event_enable: raw & (1 << 5) != 0,
            watchdog_enable: raw & (1 << 6) != 0,
        })
    }
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub has_write_event: bool,
    pub has_read_event: bool,
    /// A complete message sits in the mailbox waiting to be fetched.
    pub mailbox_full: bool,
    pub buffer_state: u8,
    pub read_buffer_open: bool,
    pub write_buffer_open: bool,
}

impl Status {
    pub fn pack(&self) -> u8 {
        (self.has_write_event as u8)
            | (self.has_read_event as u8) << 1
            | (self.mailbox_full as u8) << 3
            | (self.buffer_state & 0b11) << 4
            | (self.read_buffer_open as u8) << 6
            | (self.write_buffer_open as u8) << 7
    }

    pub fn unpack(raw: u8) -> Self {
        Self {
            has_write_event: raw & 1 != 0,
            has_read_event: raw & (1 << 1) != 0,
            mailbox_full: raw & (1 << 3) != 0,
            buffer_state: (raw >> 4) & 0b11,
            read_buffer_open: raw & (1 << 6) != 0,
            write_buffer_open: raw & (1 << 7) != 0,
        }
    }
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct Enable {
    pub enable: bool,
    pub repeat: bool,
    pub channel_pdi_disabled: bool,
    pub repeat_ack: bool,
}

impl Enable {
    fn pack(&self) -> [u8; 2] {
        [
            (self.enable as u8) | (self.repeat as u8) << 1,
            (self.channel_pdi_disabled as u8) | (self.repeat_ack as u8) << 1,
        ]
    }

    fn unpack(raw: [u8; 2]) -> Self {
        Self {
            enable: raw[0] & 1 != 0,
            repeat: raw[0] & (1 << 1) != 0,
            channel_pdi_disabled: raw[1] & 1 != 0,
            repeat_ack: raw[1] & (1 << 1) != 0,
        }
    }
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationMode {
    #[default]
    Buffered = 0x00,
    Mailbox = 0x02,
}

impl OperationMode {
    fn parse(raw: u8) -> Result<Self, PduError> {
        match raw {
            0x00 => Ok(Self::Buffered),
            0x02 => Ok(Self::Mailbox),
            _ => Err(PduError::Decode),
        }
    }
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Device writes, master reads.
    #[default]
    MasterRead = 0x00,
    /// Master writes, device reads.
    MasterWrite = 0x01,
}

impl Direction {
    fn parse(raw: u8) -> Result<Self, PduError> {
        match raw {
            0x00 => Ok(Self::MasterRead),
            0x01 => Ok(Self::MasterWrite),
            _ => Err(PduError::Decode),
        }
    }
}

impl PduRead for SyncManagerChannel {
    const LEN: u16 = 8;

    fn try_from_slice(slice: &[u8]) -> Result<Self, PduError> {
        let slice = slice.get(0..8).ok_or(PduError::Decode)?;

        Ok(Self {
            physical_start_address: u16::from_le_bytes(slice[0..2].try_into().unwrap()),
            length_bytes: u16::from_le_bytes(slice[2..4].try_into().unwrap()),
            control: Control::unpack(slice[4])?,
            status: Status::unpack(slice[5]),
            enable: Enable::unpack([slice[6], slice[7]]),
        })
    }
}

impl PduData for SyncManagerChannel {
    type Bytes = [u8; 8];

    fn as_bytes(&self) -> Self::Bytes {
        let mut buf = [0u8; 8];

        buf[0..2].copy_from_slice(&self.physical_start_address.to_le_bytes());
        buf[2..4].copy_from_slice(&self.length_bytes.to_le_bytes());
        buf[4] = self.control.pack();
        buf[5] = self.status.pack();
        buf[6..8].copy_from_slice(&self.enable.pack());

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_mailbox_write_channel() {
        // Control byte 0x26: mailbox mode, master write, DLS user event enable.
        let raw = [0x00, 0x10, 0x80, 0x00, 0x26, 0x00, 0x01, 0x00];

        let parsed = SyncManagerChannel::try_from_slice(&raw).unwrap();

        assert_eq!(parsed.physical_start_address, 0x1000);
        assert_eq!(parsed.length_bytes, 0x0080);
        assert_eq!(parsed.control.operation_mode, OperationMode::Mailbox);
        assert_eq!(parsed.control.direction, Direction::MasterWrite);
        assert!(parsed.control.dls_user_event_enable);
        assert!(parsed.enable.enable);
    }

    #[test]
    fn round_trip() {
        let channel = SyncManagerChannel::mailbox_read(0x1080, 0x0080);

        assert_eq!(
            SyncManagerChannel::try_from_slice(&channel.as_bytes()),
            Ok(channel)
        );
    }

    #[test]
    fn mailbox_full_bit() {
        let status = Status::unpack(0x09);

        assert!(status.mailbox_full);
        assert!(status.has_write_event);
    }
}
