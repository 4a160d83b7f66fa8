//! Mailbox framing shared by the master (request) and device (response) sides.

pub mod request;
pub mod response;

use crate::error::PduError;

/// Length of the mailbox header on the wire.
pub const MAILBOX_HEADER_LEN: usize = 6;

/// Mailbox protocol selector. ETG1000.6 Table 29.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MailboxType {
    /// Error reply.
    Err = 0x00,
    /// ADS over EtherCAT (AoE).
    Aoe = 0x01,
    /// Ethernet over EtherCAT (EoE).
    Eoe = 0x02,
    /// CAN application protocol over EtherCAT (CoE).
    Coe = 0x03,
    /// File access over EtherCAT (FoE).
    Foe = 0x04,
    /// Servo profile over EtherCAT (SoE).
    Soe = 0x05,
    /// Vendor specific.
    VendorSpecific = 0x0f,
}

impl MailboxType {
    pub fn parse(raw: u8) -> Result<Self, PduError> {
        match raw {
            0x00 => Ok(Self::Err),
            0x01 => Ok(Self::Aoe),
            0x02 => Ok(Self::Eoe),
            0x03 => Ok(Self::Coe),
            0x04 => Ok(Self::Foe),
            0x05 => Ok(Self::Soe),
            0x0f => Ok(Self::VendorSpecific),
            _ => Err(PduError::Decode),
        }
    }
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Priority {
    #[default]
    Lowest = 0x00,
    Low = 0x01,
    High = 0x02,
    Highest = 0x03,
}

/// Mailbox header. ETG1000.6 `MbxHeader`, e.g. Table 29.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MailboxHeader {
    /// Payload length following this header.
    pub length: u16,
    /// Station address of the message source (destination on master to device transfers is
    /// implied by the addressed sync manager).
    pub address: u16,
    /// Channel, 6 bits, normally zero.
    pub channel: u8,
    pub priority: Priority,
    pub mailbox_type: MailboxType,
    /// Sequence counter, 1 to 7; 0 is reserved. A response mirrors the counter of its request.
    pub counter: u8,
}

impl MailboxHeader {
    pub fn pack(&self) -> [u8; MAILBOX_HEADER_LEN] {
        let mut buf = [0u8; MAILBOX_HEADER_LEN];

        buf[0..2].copy_from_slice(&self.length.to_le_bytes());
        buf[2..4].copy_from_slice(&self.address.to_le_bytes());
        buf[4] = (self.channel & 0x3f) | (self.priority as u8) << 6;
        buf[5] = (self.mailbox_type as u8) | (self.counter & 0x07) << 4;

        buf
    }

    pub fn unpack_from_slice(buf: &[u8]) -> Result<Self, PduError> {
        let buf = buf.get(0..MAILBOX_HEADER_LEN).ok_or(PduError::Decode)?;

        let priority = match (buf[4] >> 6) & 0b11 {
            0x00 => Priority::Lowest,
            0x01 => Priority::Low,
            0x02 => Priority::High,
            _ => Priority::Highest,
        };

        Ok(Self {
            length: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            address: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            channel: buf[4] & 0x3f,
            priority,
            mailbox_type: MailboxType::parse(buf[5] & 0x0f)?,
            counter: (buf[5] >> 4) & 0x07,
        })
    }
}

/// Where a device's mailboxes live in its local memory, from its SII.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MailboxConfig {
    /// Master to device mailbox (sync manager 0) offset.
    pub recv_offset: u16,
    /// Master to device mailbox size.
    pub recv_size: u16,
    /// Device to master mailbox (sync manager 1) offset.
    pub send_offset: u16,
    /// Device to master mailbox size.
    pub send_size: u16,
}

impl MailboxConfig {
    pub fn is_valid(&self) -> bool {
        self.recv_size > MAILBOX_HEADER_LEN as u16 && self.send_size > MAILBOX_HEADER_LEN as u16
    }
}

/// The 1..=7 sequence counter; 0 is never emitted.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct MailboxCounter {
    last: u8,
}

impl MailboxCounter {
    pub fn next(&mut self) -> u8 {
        self.last = if self.last >= 7 { 1 } else { self.last + 1 };

        self.last
    }
}
