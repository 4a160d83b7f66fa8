//! A synchronous EtherCAT master runtime.
//!
//! The crate is built from three layers:
//!
//! - [`Link`](crate::link::Link): the in-flight datagram pipeline. Datagrams are written into an
//!   outgoing frame with a per-datagram completion callback, flushed onto one or two raw sockets,
//!   and matched back by their 8 bit index. With a second (redundant) interface attached, the
//!   link merges per-datagram working counters from both returned copies so a single cable fault
//!   does not take the bus down.
//! - [`Mailbox`](crate::mailbox::request::Mailbox): the acyclic request/response machinery for
//!   CoE SDO transfers (expedited, normal and segmented), FoE file transfers and EoE IP
//!   configuration, with the counter and ordering rules of ETG1000.6.
//! - [`Bus`](crate::bus::Bus): discovery, SII loading, mailbox setup, AL state transitions,
//!   process data mapping and the cyclic exchange itself.
//!
//! All of it is single threaded and cooperative: nothing blocks except the socket reads, and
//! every blocking operation carries a deadline.

pub mod al_control;
pub mod al_status_code;
pub mod bus;
pub mod clock;
pub mod coe;
pub mod command;
pub mod diagnostics;
pub mod dl_status;
pub mod eoe;
pub mod error;
pub mod ethernet;
pub mod fmmu;
pub mod foe;
pub mod frame;
pub mod link;
pub mod mailbox;
pub mod pdu;
pub mod register;
pub mod sii;
pub mod slave;
pub mod socket;
pub mod sync_manager_channel;

#[cfg(test)]
pub(crate) mod test_support;

pub use al_control::{AlControl, AlState};
pub use al_status_code::AlStatusCode;
pub use bus::{Bus, BusConfig, Timeouts};
pub use clock::{Clock, SystemClock};
pub use error::Error;
pub use link::{DatagramState, Link};
pub use slave::Slave;

use crate::error::PduError;
use crate::ethernet::EthernetAddress;

/// Low 11 bits of the EtherCAT frame header and of every datagram length field.
pub(crate) const LEN_MASK: u16 = 0b0000_0111_1111_1111;

/// EtherType of every EtherCAT frame.
pub const ETHERCAT_ETHERTYPE: u16 = 0x88a4;

/// Source MAC used for frames emitted by this master.
pub const MASTER_ADDR: EthernetAddress = EthernetAddress([0x10, 0x10, 0x10, 0x10, 0x10, 0x10]);

/// First configured station address handed out during discovery.
///
/// Discovered devices are addressed 1001, 1002, ... in chain order, keeping the configured range
/// well away from 0 (the broadcast/auto-increment default).
pub const BASE_STATION_ADDRESS: u16 = 1001;

#[cfg(not(target_endian = "little"))]
compile_error!("only little-endian targets are supported: wire fields are stored as-is");

/// A type that can be decoded from the data area of a received datagram.
pub trait PduRead: Sized {
    /// Length of the wire representation in bytes.
    const LEN: u16;

    fn try_from_slice(slice: &[u8]) -> Result<Self, PduError>;
}

/// A type that can be written into the data area of an outgoing datagram.
pub trait PduData: PduRead {
    type Bytes: AsRef<[u8]>;

    fn as_bytes(&self) -> Self::Bytes;
}

macro_rules! impl_pdudata {
    ($ty:ty) => {
        impl PduRead for $ty {
            const LEN: u16 = Self::BITS as u16 / 8;

            fn try_from_slice(slice: &[u8]) -> Result<Self, PduError> {
                slice
                    .get(0..usize::from(Self::LEN))
                    .and_then(|bytes| bytes.try_into().ok())
                    .map(Self::from_le_bytes)
                    .ok_or(PduError::Decode)
            }
        }

        impl PduData for $ty {
            type Bytes = [u8; Self::BITS as usize / 8];

            fn as_bytes(&self) -> Self::Bytes {
                self.to_le_bytes()
            }
        }
    };
}

impl_pdudata!(u8);
impl_pdudata!(u16);
impl_pdudata!(u32);
impl_pdudata!(u64);
impl_pdudata!(i8);
impl_pdudata!(i16);
impl_pdudata!(i32);
impl_pdudata!(i64);

impl<const N: usize> PduRead for [u8; N] {
    const LEN: u16 = N as u16;

    fn try_from_slice(slice: &[u8]) -> Result<Self, PduError> {
        slice
            .get(0..N)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(PduError::Decode)
    }
}

impl<const N: usize> PduData for [u8; N] {
    type Bytes = [u8; N];

    fn as_bytes(&self) -> Self::Bytes {
        *self
    }
}

impl PduRead for () {
    const LEN: u16 = 0;

    fn try_from_slice(_slice: &[u8]) -> Result<Self, PduError> {
        Ok(())
    }
}

impl PduData for () {
    type Bytes = [u8; 0];

    fn as_bytes(&self) -> Self::Bytes {
        []
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trip() {
        let raw = 0xcafe_deca_u32.as_bytes();

        assert_eq!(raw, [0xca, 0xde, 0xfe, 0xca]);
        assert_eq!(u32::try_from_slice(&raw), Ok(0xcafe_deca));
    }

    #[test]
    fn short_slice_refused() {
        assert_eq!(u32::try_from_slice(&[0x01, 0x02]), Err(PduError::Decode));
    }
}
