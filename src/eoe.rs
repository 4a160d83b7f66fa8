//! Ethernet over EtherCAT: the Set IP / Get IP parameter dialog. ETG1000.6 chapter 5.7.

use crate::error::PduError;
use bitflags::bitflags;

/// EoE frame type values carried in the header type nibble.
pub mod frame_type {
    pub const FRAGMENT: u8 = 0x00;
    pub const SET_IP_REQUEST: u8 = 0x02;
    pub const SET_IP_RESPONSE: u8 = 0x03;
    pub const GET_IP_REQUEST: u8 = 0x06;
    pub const GET_IP_RESPONSE: u8 = 0x07;
}

/// EoE result codes.
pub mod result {
    pub const SUCCESS: u16 = 0x0000;
    pub const UNSPECIFIED_ERROR: u16 = 0x0001;
    pub const UNSUPPORTED_FRAME_TYPE: u16 = 0x0002;
    pub const NO_IP_SUPPORT: u16 = 0x0201;
    pub const DHCP_NOT_SUPPORTED: u16 = 0x0202;
    pub const NO_FILTER_SUPPORT: u16 = 0x0401;
}

pub fn result_string(code: u16) -> &'static str {
    match code {
        result::SUCCESS => "Success",
        result::UNSPECIFIED_ERROR => "Unspecified error",
        result::UNSUPPORTED_FRAME_TYPE => "Unsupported frame type",
        result::NO_IP_SUPPORT => "No IP support",
        result::DHCP_NOT_SUPPORTED => "DHCP not supported",
        result::NO_FILTER_SUPPORT => "No filter support",
        _ => "Unknown",
    }
}

/// The 4 byte EoE header. ETG1000.6 5.7.1.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct EoeHeader {
    pub frame_type: u8,
    pub port: u8,
    pub last_fragment: bool,
    pub time_appended: bool,
    pub time_request: bool,
    pub fragment_number: u8,
    pub offset: u8,
    pub frame_number: u8,
}

impl EoeHeader {
    pub const LEN: usize = 4;

    pub fn request(frame_type: u8) -> Self {
        Self {
            frame_type,
            last_fragment: true,
            ..Default::default()
        }
    }

    pub fn pack(&self) -> [u8; 4] {
        let mut buf = [0u8; 4];

        buf[0] = (self.frame_type & 0x0f) | (self.port & 0x0f) << 4;
        buf[1] = (self.last_fragment as u8)
            | (self.time_appended as u8) << 1
            | (self.time_request as u8) << 2;

        let word = u16::from(self.fragment_number & 0x3f)
            | u16::from(self.offset & 0x3f) << 6
            | u16::from(self.frame_number & 0x0f) << 12;

        buf[2..4].copy_from_slice(&word.to_le_bytes());

        buf
    }

    pub fn unpack_from_slice(buf: &[u8]) -> Result<Self, PduError> {
        let buf = buf.get(0..4).ok_or(PduError::Decode)?;

        let word = u16::from_le_bytes(buf[2..4].try_into().unwrap());

        Ok(Self {
            frame_type: buf[0] & 0x0f,
            port: buf[0] >> 4,
            last_fragment: buf[1] & 1 != 0,
            time_appended: buf[1] & (1 << 1) != 0,
            time_request: buf[1] & (1 << 2) != 0,
            fragment_number: (word & 0x3f) as u8,
            offset: ((word >> 6) & 0x3f) as u8,
            frame_number: (word >> 12) as u8,
        })
    }
}

bitflags! {
    /// Which fields are present in a Set IP / Get IP parameter block. ETG1000.6 5.7.4.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
    pub struct IpParamFlags: u32 {
        const MAC_ADDRESS     = 1 << 0;
        const IP_ADDRESS      = 1 << 1;
        const SUBNET_MASK     = 1 << 2;
        const DEFAULT_GATEWAY = 1 << 3;
        const DNS_SERVER_IP   = 1 << 4;
        const DNS_NAME        = 1 << 5;
    }
}

/// Selective IP parameters, with presence tracked by [`IpParamFlags`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpParam {
    pub flags: IpParamFlags,
    pub mac: [u8; 6],
    pub ip: [u8; 4],
    pub subnet_mask: [u8; 4],
    pub gateway: [u8; 4],
    pub dns_server: [u8; 4],
    pub dns_name: heapless::String<32>,
}

impl IpParam {
    /// Serialize the flag word followed by exactly the fields the mask announces.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = self.flags.bits().to_le_bytes().to_vec();

        if self.flags.contains(IpParamFlags::MAC_ADDRESS) {
            out.extend_from_slice(&self.mac);
        }

        if self.flags.contains(IpParamFlags::IP_ADDRESS) {
            out.extend_from_slice(&self.ip);
        }

        if self.flags.contains(IpParamFlags::SUBNET_MASK) {
            out.extend_from_slice(&self.subnet_mask);
        }

        if self.flags.contains(IpParamFlags::DEFAULT_GATEWAY) {
            out.extend_from_slice(&self.gateway);
        }

        if self.flags.contains(IpParamFlags::DNS_SERVER_IP) {
            out.extend_from_slice(&self.dns_server);
        }

        if self.flags.contains(IpParamFlags::DNS_NAME) {
            let mut name = [0u8; 32];

            name[..self.dns_name.len()].copy_from_slice(self.dns_name.as_bytes());

            out.extend_from_slice(&name);
        }

        out
    }

    pub fn unpack_from_slice(buf: &[u8]) -> Result<Self, PduError> {
        let raw_flags = buf
            .get(0..4)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or(PduError::Decode)?;

        let flags = IpParamFlags::from_bits_truncate(raw_flags);

        let mut param = IpParam {
            flags,
            ..Default::default()
        };

        let mut cursor = 4usize;

        fn take<'buf>(
            buf: &'buf [u8],
            cursor: &mut usize,
            len: usize,
        ) -> Result<&'buf [u8], PduError> {
            let field = buf.get(*cursor..*cursor + len).ok_or(PduError::Decode)?;

            *cursor += len;

            Ok(field)
        }

        if flags.contains(IpParamFlags::MAC_ADDRESS) {
            param.mac.copy_from_slice(take(buf, &mut cursor, 6)?);
        }

        if flags.contains(IpParamFlags::IP_ADDRESS) {
            param.ip.copy_from_slice(take(buf, &mut cursor, 4)?);
        }

        if flags.contains(IpParamFlags::SUBNET_MASK) {
            param.subnet_mask.copy_from_slice(take(buf, &mut cursor, 4)?);
        }

        if flags.contains(IpParamFlags::DEFAULT_GATEWAY) {
            param.gateway.copy_from_slice(take(buf, &mut cursor, 4)?);
        }

        if flags.contains(IpParamFlags::DNS_SERVER_IP) {
            param.dns_server.copy_from_slice(take(buf, &mut cursor, 4)?);
        }

        if flags.contains(IpParamFlags::DNS_NAME) {
            let raw = take(buf, &mut cursor, 32)?;
            let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());

            let name = core::str::from_utf8(&raw[..end]).map_err(|_| PduError::Decode)?;

            param.dns_name = heapless::String::try_from(name).map_err(|_| PduError::Decode)?;
        }

        Ok(param)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = EoeHeader::request(frame_type::SET_IP_REQUEST);
        let packed = header.pack();

        assert_eq!(packed[0], 0x02);
        assert_eq!(packed[1], 0x01);
        assert_eq!(EoeHeader::unpack_from_slice(&packed), Ok(header));
    }

    #[test]
    fn selective_fields_round_trip() {
        let param = IpParam {
            flags: IpParamFlags::IP_ADDRESS | IpParamFlags::SUBNET_MASK,
            ip: [192, 168, 100, 2],
            subnet_mask: [255, 255, 255, 0],
            ..Default::default()
        };

        let packed = param.pack();

        // Flag word plus two 4 byte fields; absent fields do not travel.
        assert_eq!(packed.len(), 4 + 4 + 4);
        assert_eq!(IpParam::unpack_from_slice(&packed), Ok(param));
    }

    #[test]
    fn dns_name_round_trip() {
        let param = IpParam {
            flags: IpParamFlags::DNS_NAME,
            dns_name: heapless::String::try_from("device7").unwrap(),
            ..Default::default()
        };

        let packed = param.pack();

        assert_eq!(packed.len(), 4 + 32);
        assert_eq!(IpParam::unpack_from_slice(&packed), Ok(param));
    }

    #[test]
    fn result_strings() {
        assert_eq!(result_string(0x0000), "Success");
        assert_eq!(result_string(0x0201), "No IP support");
        assert_eq!(result_string(0xbeef), "Unknown");
    }
}
