//! CANopen over EtherCAT: headers, SDO command specifiers and abort codes.

use crate::error::PduError;

/// CoE header: 9 bit number, 4 bit service. ETG1000.6 5.6.1 Table 29.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoeHeader {
    pub number: u16,
    pub service: CoeService,
}

impl CoeHeader {
    pub const LEN: usize = 2;

    pub fn new(service: CoeService) -> Self {
        Self { number: 0, service }
    }

    pub fn pack(&self) -> [u8; 2] {
        let raw = (self.number & 0b1_1111_1111) | (self.service as u16) << 12;

        raw.to_le_bytes()
    }

    pub fn unpack_from_slice(buf: &[u8]) -> Result<Self, CoeDecodeError> {
        let raw = buf
            .get(0..2)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u16::from_le_bytes)
            .ok_or(CoeDecodeError::Malformed)?;

        let service = CoeService::parse((raw >> 12) as u8)?;

        Ok(Self {
            number: raw & 0b1_1111_1111,
            service,
        })
    }
}

/// Distinguishes "bytes too short/garbled" from "well-formed but unknown service code".
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoeDecodeError {
    Malformed,
    UnknownService,
}

impl From<CoeDecodeError> for PduError {
    fn from(_: CoeDecodeError) -> Self {
        PduError::Decode
    }
}

/// CoE service codes. ETG1000.6 Table 29.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CoeService {
    /// Emergency
    Emergency = 0x01,
    /// SDO Request
    SdoRequest = 0x02,
    /// SDO Response
    SdoResponse = 0x03,
    /// TxPDO
    TxPdo = 0x04,
    /// RxPDO
    RxPdo = 0x05,
    /// TxPDO remote request
    TxPdoRemoteRequest = 0x06,
    /// RxPDO remote request
    RxPdoRemoteRequest = 0x07,
    /// SDO Information
    SdoInformation = 0x08,
}

impl CoeService {
    pub fn parse(raw: u8) -> Result<Self, CoeDecodeError> {
        match raw {
            0x01 => Ok(Self::Emergency),
            0x02 => Ok(Self::SdoRequest),
            0x03 => Ok(Self::SdoResponse),
            0x04 => Ok(Self::TxPdo),
            0x05 => Ok(Self::RxPdo),
            0x06 => Ok(Self::TxPdoRemoteRequest),
            0x07 => Ok(Self::RxPdoRemoteRequest),
            0x08 => Ok(Self::SdoInformation),
            _ => Err(CoeDecodeError::UnknownService),
        }
    }
}

/// SDO request command specifiers, the 3 high bits of the init flags byte.
pub mod request {
    pub const DOWNLOAD_SEGMENT: u8 = 0x00;
    pub const DOWNLOAD: u8 = 0x01;
    pub const UPLOAD: u8 = 0x02;
    pub const UPLOAD_SEGMENT: u8 = 0x03;
    pub const ABORT: u8 = 0x04;
}

/// SDO response command specifiers.
pub mod response {
    pub const UPLOAD_SEGMENT: u8 = 0x00;
    pub const DOWNLOAD_SEGMENT: u8 = 0x01;
    pub const UPLOAD: u8 = 0x02;
    pub const DOWNLOAD: u8 = 0x03;
    pub const ABORT: u8 = 0x04;
}

/// Expedited/normal SDO flags byte. ETG1000.6 5.6.2.1.1.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitSdoFlags {
    pub size_indicator: bool,
    pub expedited_transfer: bool,
    /// For expedited transfers: 4 minus the number of meaningful data bytes.
    pub size: u8,
    pub complete_access: bool,
    pub command: u8,
}

impl InitSdoFlags {
    pub fn pack(&self) -> u8 {
        (self.size_indicator as u8)
            | (self.expedited_transfer as u8) << 1
            | (self.size & 0b11) << 2
            | (self.complete_access as u8) << 4
            | (self.command & 0b111) << 5
    }

    pub fn unpack(raw: u8) -> Self {
        Self {
            size_indicator: raw & 1 != 0,
            expedited_transfer: raw & (1 << 1) != 0,
            size: (raw >> 2) & 0b11,
            complete_access: raw & (1 << 4) != 0,
            command: raw >> 5,
        }
    }
}

/// The 4 byte header of expedited/normal SDO requests and responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitSdoHeader {
    pub flags: InitSdoFlags,
    pub index: u16,
    pub sub_index: u8,
}

impl InitSdoHeader {
    pub const LEN: usize = 4;

    pub fn pack(&self) -> [u8; 4] {
        let mut buf = [0u8; 4];

        buf[0] = self.flags.pack();
        buf[1..3].copy_from_slice(&self.index.to_le_bytes());
        buf[3] = self.sub_index;

        buf
    }

    pub fn unpack_from_slice(buf: &[u8]) -> Result<Self, CoeDecodeError> {
        let buf = buf.get(0..4).ok_or(CoeDecodeError::Malformed)?;

        Ok(Self {
            flags: InitSdoFlags::unpack(buf[0]),
            index: u16::from_le_bytes(buf[1..3].try_into().unwrap()),
            sub_index: buf[3],
        })
    }
}

/// The 1 byte header of segmented SDO requests and responses. ETG1000.6 5.6.2.3.1.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentSdoHeader {
    pub is_last_segment: bool,
    /// For segments of up to 7 bytes: 7 minus the number of meaningful data bytes.
    pub segment_data_size: u8,
    pub toggle: bool,
    pub command: u8,
}

impl SegmentSdoHeader {
    pub const LEN: usize = 1;

    pub fn pack(&self) -> u8 {
        (self.is_last_segment as u8)
            | (self.segment_data_size & 0b111) << 1
            | (self.toggle as u8) << 4
            | (self.command & 0b111) << 5
    }

    pub fn unpack(raw: u8) -> Self {
        Self {
            is_last_segment: raw & 1 != 0,
            segment_data_size: (raw >> 1) & 0b111,
            toggle: raw & (1 << 4) != 0,
            command: raw >> 5,
        }
    }
}

/// SDO abort codes, ETG1000.6 Table 41.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoeAbortCode {
    /// Toggle bit not changed
    ToggleBit,
    /// SDO protocol timeout
    SdoTimeout,
    /// Command specifier not valid or unknown
    InvalidCommand,
    /// Out of memory
    OutOfMemory,
    /// Unsupported access to an object
    UnsupportedAccess,
    /// Attempt to read a write only object
    WriteOnlyRead,
    /// Attempt to write a read only object
    ReadOnlyWrite,
    /// Subindex cannot be written, SI0 must be 0 for write access
    IndexOnly,
    /// Complete access not supported for objects of variable length
    NoCompleteAccess,
    /// Object length exceeds mailbox size
    ObjectTooLarge,
    /// Object mapped to RxPDO, SDO download blocked
    DownloadBlocked,
    /// The object does not exist in the object dictionary
    NotFound,
    /// The object cannot be mapped into the PDO
    PdoMappingFailed,
    /// The number and length of the objects to be mapped would exceed the PDO length
    PdoTooSmall,
    /// General parameter incompatibility reason
    Incompatible,
    /// General internal incompatibility in the device
    Internal,
    /// Access failed due to a hardware error
    HardwareFailure,
    /// Data type does not match, length of service parameter does not match
    DataLengthMismatch,
    /// Data type does not match, length of service parameter too high
    DataTooLong,
    /// Data type does not match, length of service parameter too low
    DataTooShort,
    /// Subindex does not exist
    SubIndexNotFound,
    /// Value range of parameter exceeded
    ValueOutOfRange,
    /// Value of parameter written too high
    ValueTooLarge,
    /// Value of parameter written too low
    ValueTooSmall,
    /// Maximum value is less than minimum value
    MaxMin,
    /// General error
    General,
    /// Data cannot be transferred or stored to the application
    TransferFailed,
    /// Data cannot be transferred because of local control
    TransferFailedLocal,
    /// Data cannot be transferred in the present device state
    InvalidState,
    /// No object dictionary is present
    NoObjectDictionary,
    /// An abort code outside the documented space.
    Unknown(u32),
}

impl From<u32> for CoeAbortCode {
    fn from(value: u32) -> Self {
        match value {
            0x0503_0000 => Self::ToggleBit,
            0x0504_0000 => Self::SdoTimeout,
            0x0504_0001 => Self::InvalidCommand,
            0x0504_0005 => Self::OutOfMemory,
            0x0601_0000 => Self::UnsupportedAccess,
            0x0601_0001 => Self::WriteOnlyRead,
            0x0601_0002 => Self::ReadOnlyWrite,
            0x0601_0003 => Self::IndexOnly,
            0x0601_0004 => Self::NoCompleteAccess,
            0x0601_0005 => Self::ObjectTooLarge,
            0x0601_0006 => Self::DownloadBlocked,
            0x0602_0000 => Self::NotFound,
            0x0604_0041 => Self::PdoMappingFailed,
            0x0604_0042 => Self::PdoTooSmall,
            0x0604_0043 => Self::Incompatible,
            0x0604_0047 => Self::Internal,
            0x0606_0000 => Self::HardwareFailure,
            0x0607_0010 => Self::DataLengthMismatch,
            0x0607_0012 => Self::DataTooLong,
            0x0607_0013 => Self::DataTooShort,
            0x0609_0011 => Self::SubIndexNotFound,
            0x0609_0030 => Self::ValueOutOfRange,
            0x0609_0031 => Self::ValueTooLarge,
            0x0609_0032 => Self::ValueTooSmall,
            0x0609_0036 => Self::MaxMin,
            0x0800_0000 => Self::General,
            0x0800_0020 => Self::TransferFailed,
            0x0800_0021 => Self::TransferFailedLocal,
            0x0800_0022 => Self::InvalidState,
            0x0800_0023 => Self::NoObjectDictionary,
            other => Self::Unknown(other),
        }
    }
}

impl From<CoeAbortCode> for u32 {
    fn from(code: CoeAbortCode) -> Self {
        match code {
            CoeAbortCode::ToggleBit => 0x0503_0000,
            CoeAbortCode::SdoTimeout => 0x0504_0000,
            CoeAbortCode::InvalidCommand => 0x0504_0001,
            CoeAbortCode::OutOfMemory => 0x0504_0005,
            CoeAbortCode::UnsupportedAccess => 0x0601_0000,
            CoeAbortCode::WriteOnlyRead => 0x0601_0001,
            CoeAbortCode::ReadOnlyWrite => 0x0601_0002,
            CoeAbortCode::IndexOnly => 0x0601_0003,
            CoeAbortCode::NoCompleteAccess => 0x0601_0004,
            CoeAbortCode::ObjectTooLarge => 0x0601_0005,
            CoeAbortCode::DownloadBlocked => 0x0601_0006,
            CoeAbortCode::NotFound => 0x0602_0000,
            CoeAbortCode::PdoMappingFailed => 0x0604_0041,
            CoeAbortCode::PdoTooSmall => 0x0604_0042,
            CoeAbortCode::Incompatible => 0x0604_0043,
            CoeAbortCode::Internal => 0x0604_0047,
            CoeAbortCode::HardwareFailure => 0x0606_0000,
            CoeAbortCode::DataLengthMismatch => 0x0607_0010,
            CoeAbortCode::DataTooLong => 0x0607_0012,
            CoeAbortCode::DataTooShort => 0x0607_0013,
            CoeAbortCode::SubIndexNotFound => 0x0609_0011,
            CoeAbortCode::ValueOutOfRange => 0x0609_0030,
            CoeAbortCode::ValueTooLarge => 0x0609_0031,
            CoeAbortCode::ValueTooSmall => 0x0609_0032,
            CoeAbortCode::MaxMin => 0x0609_0036,
            CoeAbortCode::General => 0x0800_0000,
            CoeAbortCode::TransferFailed => 0x0800_0020,
            CoeAbortCode::TransferFailedLocal => 0x0800_0021,
            CoeAbortCode::InvalidState => 0x0800_0022,
            CoeAbortCode::NoObjectDictionary => 0x0800_0023,
            CoeAbortCode::Unknown(other) => other,
        }
    }
}

impl CoeAbortCode {
    pub fn description(&self) -> &'static str {
        match self {
            Self::ToggleBit => "Toggle bit not changed",
            Self::SdoTimeout => "SDO protocol timeout",
            Self::InvalidCommand => "Client/Server command specifier not valid or unknown",
            Self::OutOfMemory => "Out of memory",
            Self::UnsupportedAccess => "Unsupported access to an object",
            Self::WriteOnlyRead => "Attempt to read a write only object",
            Self::ReadOnlyWrite => "Attempt to write a read only object",
            Self::IndexOnly => "Subindex cannot be written, SI0 must be 0 for write access",
            Self::NoCompleteAccess => {
                "Complete access not supported for objects of variable length"
            }
            Self::ObjectTooLarge => "Object length exceeds mailbox size",
            Self::DownloadBlocked => "Object mapped to RxPDO, SDO download blocked",
            Self::NotFound => "Object does not exist in the object dictionary",
            Self::PdoMappingFailed => "Object cannot be mapped into the PDO",
            Self::PdoTooSmall => {
                "The number and length of the objects to be mapped would exceed the PDO length"
            }
            Self::Incompatible => "General parameter incompatibility reason",
            Self::Internal => "General internal incompatibility in the device",
            Self::HardwareFailure => "Access failed due to a hardware error",
            Self::DataLengthMismatch => {
                "Data type does not match, length of service parameter does not match"
            }
            Self::DataTooLong => "Data type does not match, length of service parameter too high",
            Self::DataTooShort => "Data type does not match, length of service parameter too low",
            Self::SubIndexNotFound => "Subindex does not exist",
            Self::ValueOutOfRange => "Value range of parameter exceeded",
            Self::ValueTooLarge => "Value of parameter written too high",
            Self::ValueTooSmall => "Value of parameter written too low",
            Self::MaxMin => "Maximum value is less than minimum value",
            Self::General => "General error",
            Self::TransferFailed => "Data cannot be transferred or stored to the application",
            Self::TransferFailedLocal => {
                "Data cannot be transferred or stored because of local control"
            }
            Self::InvalidState => {
                "Data cannot be transferred or stored in the present device state"
            }
            Self::NoObjectDictionary => {
                "Object dictionary dynamic generation fails or no object dictionary is present"
            }
            Self::Unknown(_) => "Unknown abort code",
        }
    }
}

impl core::fmt::Display for CoeAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}: {}", u32::from(*self), self.description())
    }
}
