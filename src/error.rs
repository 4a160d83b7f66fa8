//! Error types.

pub use crate::coe::CoeAbortCode;
use crate::al_status_code::AlStatusCode;
use crate::link::DatagramState;

/// Top level error type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// A low level error occurred when producing or consuming a datagram.
    Pdu(PduError),
    /// Socket I/O failed with the contained (positive) errno value.
    Io(i32),
    /// A working counter (WKC) check failed.
    WorkingCounter {
        /// The expected working counter value.
        expected: u16,
        /// The actual value received.
        received: u16,
    },
    /// Something timed out.
    Timeout,
    /// A mailbox dialog failed.
    Mailbox(MailboxError),
    /// A device reported an AL status code during a state transition.
    AlStatus(AlStatusCode),
    /// The bus or a device is configured in a way the master cannot work with.
    Config(ConfigError),
}

impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Pdu(e) => write!(f, "pdu: {}", e),
            Error::Io(errno) => write!(f, "socket I/O failed, errno {}", errno),
            Error::WorkingCounter { expected, received } => {
                write!(f, "working counter expected {}, got {}", expected, received)
            }
            Error::Timeout => f.write_str("timeout"),
            Error::Mailbox(e) => write!(f, "mailbox: {}", e),
            Error::AlStatus(code) => write!(f, "AL status: {}", code),
            Error::Config(e) => write!(f, "configuration: {}", e),
        }
    }
}

/// Low level datagram/frame error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PduError {
    /// Failed to decode raw data into a given type.
    Decode,
    /// Something went wrong encoding or decoding the raw Ethernet II frame.
    Ethernet,
    /// A payload is too long to ever fit in a frame.
    TooLong,
    /// The current frame has no room left for another datagram.
    FrameFull,
    /// All 256 datagram indices are in flight.
    TooManyInflight,
    /// A frame was only partially sent.
    PartialSend,
    /// A byte order conversion was requested for a width with no on-wire use.
    UnsupportedWidth,
    /// A datagram completed with the contained non-OK state.
    Failed(DatagramState),
}

impl core::fmt::Display for PduError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PduError::Decode => f.write_str("failed to decode raw data into type"),
            PduError::Ethernet => f.write_str("bad Ethernet II frame"),
            PduError::TooLong => f.write_str("payload can never fit in a frame"),
            PduError::FrameFull => f.write_str("no room left in frame"),
            PduError::TooManyInflight => f.write_str("all 256 datagram indices are in flight"),
            PduError::PartialSend => f.write_str("frame was only partially sent"),
            PduError::UnsupportedWidth => f.write_str("unsupported byte order width"),
            PduError::Failed(state) => write!(f, "datagram completed with state {:?}", state),
        }
    }
}

/// Mailbox dialog error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// The device aborted an SDO transfer.
    Aborted {
        /// SDO abort code.
        code: CoeAbortCode,
        /// Object index the transfer addressed.
        index: u16,
        /// Subindex the transfer addressed.
        subindex: u8,
    },
    /// A CoE response carried a service other than the expected one.
    WrongService,
    /// A CoE response carried a service code outside the defined set.
    UnknownService,
    /// The caller's buffer cannot hold the object being uploaded.
    ClientBufferTooSmall,
    /// A segmented transfer returned an unexpected toggle bit.
    BadToggleBit,
    /// The response to a transfer is malformed.
    InvalidResponse,
    /// An FoE transfer failed with the contained error code.
    Foe(u16),
    /// An EoE request failed with the contained result code.
    Eoe(u16),
    /// The device answered with a mailbox error reply carrying this detail code.
    ErrorReply(u16),
    /// A device needs a mailbox for the requested operation but has none.
    NoMailbox,
}

impl core::fmt::Display for MailboxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MailboxError::Aborted {
                code,
                index,
                subindex,
            } => write!(f, "{:#06x}:{} aborted: {}", index, subindex, code),
            MailboxError::WrongService => f.write_str("unexpected CoE service in response"),
            MailboxError::UnknownService => f.write_str("unknown CoE service in response"),
            MailboxError::ClientBufferTooSmall => f.write_str("client buffer too small"),
            MailboxError::BadToggleBit => f.write_str("bad segment toggle bit"),
            MailboxError::InvalidResponse => f.write_str("malformed mailbox response"),
            MailboxError::Foe(code) => {
                write!(f, "FoE error {:#06x}: {}", code, crate::foe::result_string(*code))
            }
            MailboxError::Eoe(code) => {
                write!(f, "EoE error {:#06x}: {}", code, crate::eoe::result_string(*code))
            }
            MailboxError::ErrorReply(code) => write!(f, "mailbox error reply {:#06x}", code),
            MailboxError::NoMailbox => f.write_str("device has no mailbox"),
        }
    }
}

/// Configuration problem discovered while setting up or inspecting the bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// SII/EEPROM content could not be parsed.
    Sii(SiiError),
    /// A device reports no open port at all; it cannot be part of the chain.
    ZeroOpenPorts,
    /// Sync manager regions overlap.
    OverlappingSyncManagers,
    /// The computed process data layout does not fit the supplied image buffer.
    PdiTooLong {
        /// Bytes available in the caller's buffer.
        available: usize,
        /// Bytes needed by the mapping.
        needed: usize,
    },
    /// The operation needs a mapping but [`create_mapping`](crate::bus::Bus::create_mapping) has
    /// not run yet.
    NoMapping,
    /// A device index is out of range.
    SlaveNotFound(u16),
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::Sii(e) => write!(f, "SII: {}", e),
            ConfigError::ZeroOpenPorts => f.write_str("device has no open port"),
            ConfigError::OverlappingSyncManagers => f.write_str("sync manager regions overlap"),
            ConfigError::PdiTooLong { available, needed } => write!(
                f,
                "process data image needs {} bytes, buffer holds {}",
                needed, available
            ),
            ConfigError::NoMapping => f.write_str("no process data mapping installed"),
            ConfigError::SlaveNotFound(index) => write!(f, "no device at index {}", index),
        }
    }
}

/// SII (EEPROM) parse error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SiiError {
    /// The image is shorter than the fixed header area.
    TooShort,
    /// A category's declared length runs past the end of the image.
    CategoryOverrun,
    /// A category body could not be decoded.
    Decode,
}

impl core::fmt::Display for SiiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SiiError::TooShort => f.write_str("image shorter than header area"),
            SiiError::CategoryOverrun => f.write_str("category length exceeds image"),
            SiiError::Decode => f.write_str("failed to decode category"),
        }
    }
}

impl From<PduError> for Error {
    fn from(e: PduError) -> Self {
        Self::Pdu(e)
    }
}

impl From<MailboxError> for Error {
    fn from(e: MailboxError) -> Self {
        Self::Mailbox(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<SiiError> for Error {
    fn from(e: SiiError) -> Self {
        Self::Config(ConfigError::Sii(e))
    }
}
