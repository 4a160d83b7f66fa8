//! File access over EtherCAT: opcodes, headers and result codes. ETG1000.6 chapter 5.8.

use crate::error::PduError;

/// FoE opcodes.
pub mod opcode {
    pub const READ: u8 = 0x01;
    pub const WRITE: u8 = 0x02;
    pub const DATA: u8 = 0x03;
    pub const ACK: u8 = 0x04;
    pub const ERROR: u8 = 0x05;
    pub const BUSY: u8 = 0x06;
}

/// FoE error codes carried by the ERROR opcode.
pub mod result {
    pub const NOT_DEFINED: u16 = 0x8000;
    pub const NOT_FOUND: u16 = 0x8001;
    pub const ACCESS_DENIED: u16 = 0x8002;
    pub const DISK_FULL: u16 = 0x8003;
    pub const ILLEGAL: u16 = 0x8004;
    pub const PACKET_NUMBER_WRONG: u16 = 0x8005;
    pub const ALREADY_EXISTS: u16 = 0x8006;
    pub const NO_USER: u16 = 0x8007;
    pub const BOOTSTRAP_ONLY: u16 = 0x8008;
    pub const NOT_BOOTSTRAP: u16 = 0x8009;
    pub const NO_RIGHTS: u16 = 0x800a;
    pub const PROGRAM_ERROR: u16 = 0x800b;
}

pub fn result_string(code: u16) -> &'static str {
    match code {
        result::NOT_DEFINED => "Not defined",
        result::NOT_FOUND => "File not found",
        result::ACCESS_DENIED => "Access denied",
        result::DISK_FULL => "Disk full",
        result::ILLEGAL => "Illegal operation",
        result::PACKET_NUMBER_WRONG => "Wrong packet number",
        result::ALREADY_EXISTS => "File already exists",
        result::NO_USER => "No user",
        result::BOOTSTRAP_ONLY => "Bootstrap only",
        result::NOT_BOOTSTRAP => "Not bootstrap",
        result::NO_RIGHTS => "No rights",
        result::PROGRAM_ERROR => "Program error",
        _ => "Unknown",
    }
}

/// Every FoE message starts with `opcode` and a reserved byte, followed by a 4 byte
/// operation-specific field: password for READ/WRITE, packet number for DATA/ACK, error code for
/// ERROR and BUSY.
pub const FOE_HEADER_LEN: usize = 6;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FoeHeader {
    pub op: u8,
    /// Password, packet number or error code depending on `op`.
    pub field: u32,
}

impl FoeHeader {
    pub fn pack(&self) -> [u8; FOE_HEADER_LEN] {
        let mut buf = [0u8; FOE_HEADER_LEN];

        buf[0] = self.op;
        buf[2..6].copy_from_slice(&self.field.to_le_bytes());

        buf
    }

    pub fn unpack_from_slice(buf: &[u8]) -> Result<Self, PduError> {
        let buf = buf.get(0..FOE_HEADER_LEN).ok_or(PduError::Decode)?;

        Ok(Self {
            op: buf[0],
            field: u32::from_le_bytes(buf[2..6].try_into().unwrap()),
        })
    }
}

/// Build a READ or WRITE request: header plus the file name in the data section.
pub fn file_request(op: u8, password: u32, filename: &str) -> Vec<u8> {
    let mut out = FoeHeader { op, field: password }.pack().to_vec();

    out.extend_from_slice(filename.as_bytes());

    out
}

/// Build a DATA message carrying a chunk of the file.
pub fn data_message(packet_number: u32, chunk: &[u8]) -> Vec<u8> {
    let mut out = FoeHeader {
        op: opcode::DATA,
        field: packet_number,
    }
    .pack()
    .to_vec();

    out.extend_from_slice(chunk);

    out
}

/// Build an ACK for the given packet number.
pub fn ack_message(packet_number: u32) -> Vec<u8> {
    FoeHeader {
        op: opcode::ACK,
        field: packet_number,
    }
    .pack()
    .to_vec()
}

/// Build an ERROR message. The 16 bit error code travels zero-extended.
pub fn error_message(code: u16) -> Vec<u8> {
    FoeHeader {
        op: opcode::ERROR,
        field: u32::from(code),
    }
    .pack()
    .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FoeHeader {
            op: opcode::DATA,
            field: 3,
        };

        assert_eq!(FoeHeader::unpack_from_slice(&header.pack()), Ok(header));
    }

    #[test]
    fn read_request_layout() {
        let raw = file_request(opcode::READ, 0, "firmware.bin");

        assert_eq!(raw[0], 0x01);
        assert_eq!(&raw[2..6], &[0, 0, 0, 0]);
        assert_eq!(&raw[6..], b"firmware.bin");
    }

    #[test]
    fn known_results_have_strings() {
        for code in 0x8000..=0x800bu16 {
            assert_ne!(result_string(code), "Unknown");
        }

        assert_eq!(result_string(0x1234), "Unknown");
    }
}
