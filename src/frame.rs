//! EtherCAT frame codec: one Ethernet II frame carrying an EtherCAT header and 1..N datagrams.

use crate::error::{Error, PduError};
use crate::ethernet::{
    EthernetAddress, EthernetFrame, ETHERNET_HEADER_LEN, ETHERNET_MIN_PAYLOAD, ETHERNET_MTU,
};
use crate::pdu::{DatagramHeader, PduFlags, DATAGRAM_HEADER_LEN, WKC_LEN};
use crate::command::Command;
use crate::{ETHERCAT_ETHERTYPE, LEN_MASK, MASTER_ADDR};

/// Length of the EtherCAT header following the Ethernet II header.
pub const FRAME_HEADER_LEN: usize = 2;

/// Absolute offset of the first datagram in a frame buffer.
const DATAGRAMS_START: usize = ETHERNET_HEADER_LEN + FRAME_HEADER_LEN;

/// Size of a buffer able to hold any EtherCAT frame.
pub const FRAME_BUFFER_LEN: usize = ETHERNET_HEADER_LEN + ETHERNET_MTU;

/// Smallest frame that may go on the wire (Ethernet minimum, FCS excluded).
const MIN_FRAME_LEN: usize = ETHERNET_HEADER_LEN + ETHERNET_MIN_PAYLOAD;

/// Type nibble of the EtherCAT frame header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolType {
    /// The payload is a chain of datagrams.
    DlPdu = 0x01,
    /// The payload is a single mailbox message (ETG8200 gateway framing).
    Mailbox = 0x05,
}

/// The 2 byte EtherCAT header: 11 bit payload length, reserved bit, 4 bit type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u16,
    pub protocol: ProtocolType,
}

impl FrameHeader {
    pub fn pdu(len: u16) -> Self {
        debug_assert!(len <= LEN_MASK);

        Self {
            payload_len: len & LEN_MASK,
            protocol: ProtocolType::DlPdu,
        }
    }

    pub fn pack(&self) -> [u8; FRAME_HEADER_LEN] {
        let raw = self.payload_len & LEN_MASK | (self.protocol as u16) << 12;

        raw.to_le_bytes()
    }

    pub fn unpack_from_slice(buf: &[u8]) -> Result<Self, PduError> {
        let raw = buf
            .get(0..FRAME_HEADER_LEN)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u16::from_le_bytes)
            .ok_or(PduError::Decode)?;

        let protocol = match (raw >> 12) as u8 {
            0x01 => ProtocolType::DlPdu,
            0x05 => ProtocolType::Mailbox,
            _ => return Err(PduError::Decode),
        };

        Ok(Self {
            payload_len: raw & LEN_MASK,
            protocol,
        })
    }
}

/// An EtherCAT frame under construction or freshly received.
///
/// The frame keeps a write cursor; [`add_datagram`](Self::add_datagram) appends behind it and
/// [`finalize`](Self::finalize) closes the frame for transmission, fixing up the `more` chain
/// bits and the header length field.
pub struct EthercatFrame {
    buffer: [u8; FRAME_BUFFER_LEN],
    cursor: usize,
    datagram_count: u8,
    /// Offset of the most recently written datagram header, so the next add can flag it as
    /// not-last.
    last_header: usize,
}

impl Default for EthercatFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl EthercatFrame {
    pub fn new() -> Self {
        Self {
            buffer: [0u8; FRAME_BUFFER_LEN],
            cursor: DATAGRAMS_START,
            datagram_count: 0,
            last_header: 0,
        }
    }

    pub fn datagram_count(&self) -> u8 {
        self.datagram_count
    }

    pub fn is_empty(&self) -> bool {
        self.datagram_count == 0
    }

    /// Bytes still available for another datagram (header and working counter included).
    pub fn free_space(&self) -> usize {
        FRAME_BUFFER_LEN - self.cursor
    }

    /// Append a datagram.
    ///
    /// `data` is copied into the frame and zero-extended to `length` bytes; read commands pass an
    /// empty `data` with the length of the region to read, which travels as zeroes for the
    /// devices to overwrite. Fails with [`PduError::FrameFull`] when the remaining space cannot
    /// hold header, data area and working counter.
    pub fn add_datagram(
        &mut self,
        command: Command,
        index: u8,
        address: u32,
        data: &[u8],
        length: u16,
    ) -> Result<(), Error> {
        let length = usize::from(length);

        if data.len() > length {
            return Err(Error::Pdu(PduError::TooLong));
        }

        if DATAGRAM_HEADER_LEN + length + WKC_LEN > FRAME_BUFFER_LEN - DATAGRAMS_START {
            return Err(Error::Pdu(PduError::TooLong));
        }

        if DATAGRAM_HEADER_LEN + length + WKC_LEN > self.free_space() {
            return Err(Error::Pdu(PduError::FrameFull));
        }

        if self.datagram_count > 0 {
            // Flag the previous datagram as not-last (bit 15 of its flags word).
            self.buffer[self.last_header + 7] |= 0x80;
        }

        let header = DatagramHeader {
            command,
            index,
            address,
            flags: PduFlags::with_len(length as u16),
            irq: 0,
        };

        self.last_header = self.cursor;

        self.buffer[self.cursor..self.cursor + DATAGRAM_HEADER_LEN]
            .copy_from_slice(&header.pack());
        self.cursor += DATAGRAM_HEADER_LEN;

        self.buffer[self.cursor..self.cursor + data.len()].copy_from_slice(data);
        self.buffer[self.cursor + data.len()..self.cursor + length].fill(0);
        self.cursor += length;

        // Working counter starts at zero.
        self.buffer[self.cursor..self.cursor + WKC_LEN].fill(0);
        self.cursor += WKC_LEN;

        self.datagram_count += 1;

        Ok(())
    }

    /// Close the frame and return the bytes to put on the wire.
    ///
    /// A frame with no datagram written cannot be sent.
    pub fn finalize(&mut self) -> Result<&[u8], Error> {
        if self.is_empty() {
            return Err(Error::Pdu(PduError::Decode));
        }

        let payload_len = (self.cursor - DATAGRAMS_START) as u16;

        let mut ethernet = EthernetFrame::new_unchecked(&mut self.buffer[..]);

        ethernet.set_dst_addr(EthernetAddress::BROADCAST);
        ethernet.set_src_addr(MASTER_ADDR);
        ethernet.set_ethertype(ETHERCAT_ETHERTYPE);

        self.buffer[ETHERNET_HEADER_LEN..DATAGRAMS_START]
            .copy_from_slice(&FrameHeader::pdu(payload_len).pack());

        let wire_len = if self.cursor < MIN_FRAME_LEN {
            self.buffer[self.cursor..MIN_FRAME_LEN].fill(0);

            MIN_FRAME_LEN
        } else {
            self.cursor
        };

        Ok(&self.buffer[..wire_len])
    }

    /// Reset the frame for reuse.
    pub fn clear(&mut self) {
        self.cursor = DATAGRAMS_START;
        self.datagram_count = 0;
        self.last_header = 0;
    }

    /// Mutable view of the whole backing buffer, for reading a frame off a socket.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Iterate the datagrams of the received frame held in the backing buffer.
    pub fn datagrams(&self) -> Result<DatagramIter<'_>, Error> {
        parse_datagrams(&self.buffer)
    }
}

/// Validate the Ethernet and EtherCAT headers of a received buffer and return a datagram walker.
pub fn parse_datagrams(buf: &[u8]) -> Result<DatagramIter<'_>, Error> {
    let ethernet = EthernetFrame::new_checked(buf)?;

    if ethernet.ethertype() != ETHERCAT_ETHERTYPE {
        return Err(Error::Pdu(PduError::Ethernet));
    }

    let header = FrameHeader::unpack_from_slice(ethernet.payload())?;

    if header.protocol != ProtocolType::DlPdu {
        return Err(Error::Pdu(PduError::Decode));
    }

    let end = DATAGRAMS_START + usize::from(header.payload_len);

    if end > buf.len() {
        return Err(Error::Pdu(PduError::Decode));
    }

    Ok(DatagramIter {
        buf,
        cursor: DATAGRAMS_START,
        end,
    })
}

/// One datagram of a received frame, located by offsets so callers may keep mutating the backing
/// buffer between steps.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReceivedDatagram {
    pub header: DatagramHeader,
    /// Absolute offset of the data area in the frame buffer.
    pub payload_start: usize,
    pub payload_len: usize,
    pub wkc: u16,
}

/// Left-to-right walker over the datagrams of a received frame.
pub struct DatagramIter<'a> {
    buf: &'a [u8],
    cursor: usize,
    end: usize,
}

impl Iterator for DatagramIter<'_> {
    type Item = ReceivedDatagram;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor + DATAGRAM_HEADER_LEN + WKC_LEN > self.end {
            return None;
        }

        let header = match DatagramHeader::unpack_from_slice(&self.buf[self.cursor..]) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("malformed datagram at offset {}: {}", self.cursor, e);

                return None;
            }
        };

        let payload_start = self.cursor + DATAGRAM_HEADER_LEN;
        let payload_len = usize::from(header.flags.length);

        if payload_start + payload_len + WKC_LEN > self.end {
            log::warn!("datagram at offset {} overruns frame", self.cursor);

            return None;
        }

        let wkc = u16::from_le_bytes(
            self.buf[payload_start + payload_len..payload_start + payload_len + WKC_LEN]
                .try_into()
                .unwrap(),
        );

        self.cursor = payload_start + payload_len + WKC_LEN;

        Some(ReceivedDatagram {
            header,
            payload_start,
            payload_len,
            wkc,
        })
    }
}

/// Host to network byte order for the 16 and 32 bit quantities EtherCAT tooling swaps by hand.
///
/// 64 bit values have no on-wire use here, so the conversion refuses them instead of guessing.
pub trait NetworkOrder: Sized {
    fn hton(self) -> Result<Self, PduError>;

    fn ntoh(self) -> Result<Self, PduError> {
        self.hton()
    }
}

impl NetworkOrder for u16 {
    fn hton(self) -> Result<Self, PduError> {
        Ok(self.swap_bytes())
    }
}

impl NetworkOrder for u32 {
    fn hton(self) -> Result<Self, PduError> {
        Ok(self.swap_bytes())
    }
}

impl NetworkOrder for u64 {
    fn hton(self) -> Result<Self, PduError> {
        Err(PduError::UnsupportedWidth)
    }
}

pub fn hton<T: NetworkOrder>(value: T) -> Result<T, PduError> {
    value.hton()
}

pub fn ntoh<T: NetworkOrder>(value: T) -> Result<T, PduError> {
    value.ntoh()
}
