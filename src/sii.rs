//! Slave Information Interface (SII): EEPROM register access plumbing and the TLV category
//! walker over a cached EEPROM image.

use crate::error::SiiError;
use crate::mailbox::MailboxConfig;
use bitflags::bitflags;

/// EEPROM control/status register image (`0x0502`), ETG1000.4 6.4.3.
///
/// The command and status bits live in the high byte of the little-endian word.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SiiControl {
    pub read: bool,
    pub write: bool,
    pub reload: bool,
    pub checksum_error: bool,
    pub device_info_error: bool,
    pub command_error: bool,
    pub write_error: bool,
    pub busy: bool,
}

impl SiiControl {
    pub fn read_command() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    pub fn has_error(&self) -> bool {
        self.checksum_error || self.device_info_error || self.command_error || self.write_error
    }

    pub fn pack(&self) -> [u8; 2] {
        let high = (self.read as u8)
            | (self.write as u8) << 1
            | (self.reload as u8) << 2
            | (self.checksum_error as u8) << 3
            | (self.device_info_error as u8) << 4
            | (self.command_error as u8) << 5
            | (self.write_error as u8) << 6
            | (self.busy as u8) << 7;

        [0, high]
    }

    pub fn unpack(raw: u16) -> Self {
        let high = (raw >> 8) as u8;

        Self {
            read: high & 1 != 0,
            write: high & (1 << 1) != 0,
            reload: high & (1 << 2) != 0,
            checksum_error: high & (1 << 3) != 0,
            device_info_error: high & (1 << 4) != 0,
            command_error: high & (1 << 5) != 0,
            write_error: high & (1 << 6) != 0,
            busy: high & (1 << 7) != 0,
        }
    }
}

/// One EEPROM read request: the control word followed by the word address, written to `0x0502`.
#[derive(Debug, Copy, Clone)]
pub struct SiiRequest {
    control: SiiControl,
    address: u16,
}

impl SiiRequest {
    pub fn read(address: u16) -> Self {
        Self {
            control: SiiControl::read_command(),
            address,
        }
    }

    pub fn as_array(&self) -> [u8; 4] {
        let mut buf = [0u8; 4];

        buf[0..2].copy_from_slice(&self.control.pack());
        buf[2..4].copy_from_slice(&self.address.to_le_bytes());

        buf
    }
}

/// Fixed word addresses of the SII header area. ETG1000.6 Table 16.
pub mod word {
    pub const ALIAS: u16 = 0x0004;
    pub const VENDOR_ID: u16 = 0x0008;
    pub const PRODUCT_CODE: u16 = 0x000a;
    pub const REVISION: u16 = 0x000c;
    pub const SERIAL: u16 = 0x000e;
    pub const STD_RECV_MAILBOX_OFFSET: u16 = 0x0018;
    pub const STD_RECV_MAILBOX_SIZE: u16 = 0x0019;
    pub const STD_SEND_MAILBOX_OFFSET: u16 = 0x001a;
    pub const STD_SEND_MAILBOX_SIZE: u16 = 0x001b;
    pub const MAILBOX_PROTOCOL: u16 = 0x001c;
    /// First category header.
    pub const FIRST_CATEGORY: u16 = 0x0040;
}

/// Category type of one TLV section. ETG1000.6 Table 19.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CategoryType {
    Nop,
    Strings,
    DataTypes,
    General,
    Fmmu,
    SyncManager,
    TxPdo,
    RxPdo,
    DistributedClock,
    End,
    Other(u16),
}

impl From<u16> for CategoryType {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::Nop,
            10 => Self::Strings,
            20 => Self::DataTypes,
            30 => Self::General,
            40 => Self::Fmmu,
            41 => Self::SyncManager,
            50 => Self::TxPdo,
            51 => Self::RxPdo,
            60 => Self::DistributedClock,
            0xffff => Self::End,
            other => Self::Other(other),
        }
    }
}

bitflags! {
    /// Mailbox protocols a device claims to support, from SII word `0x001c`.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
    pub struct MailboxProtocols: u16 {
        const AOE = 1 << 0;
        const EOE = 1 << 1;
        const COE = 1 << 2;
        const FOE = 1 << 3;
        const SOE = 1 << 4;
        const VOE = 1 << 5;
    }
}

bitflags! {
    /// CoE feature bits from the General category.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
    pub struct CoeDetails: u8 {
        const ENABLE_SDO = 1 << 0;
        const ENABLE_SDO_INFO = 1 << 1;
        const ENABLE_PDO_ASSIGN = 1 << 2;
        const ENABLE_PDO_CONFIGURATION = 1 << 3;
        const ENABLE_STARTUP_UPLOAD = 1 << 4;
        const ENABLE_COMPLETE_ACCESS = 1 << 5;
    }
}

/// "General" category. ETG1000.6 Table 21, trimmed to the fields the master consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiiGeneral {
    pub group_string_idx: u8,
    pub image_string_idx: u8,
    pub order_string_idx: u8,
    pub name_string_idx: u8,
    pub coe_details: CoeDetails,
    pub foe_enabled: bool,
    pub eoe_enabled: bool,
}

/// One sync manager definition from the SyncManager category, 8 bytes each.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SiiSyncManager {
    pub start_address: u16,
    pub length: u16,
    pub control: u8,
    pub enable: u8,
    pub usage: SyncManagerUsage,
}

/// ETG1000.6 Table 22: what a sync manager carries.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum SyncManagerUsage {
    #[default]
    Unused,
    /// Master to device mailbox.
    MailboxOut,
    /// Device to master mailbox.
    MailboxIn,
    /// Master to device process data.
    ProcessDataOut,
    /// Device to master process data.
    ProcessDataIn,
}

impl From<u8> for SyncManagerUsage {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::MailboxOut,
            2 => Self::MailboxIn,
            3 => Self::ProcessDataOut,
            4 => Self::ProcessDataIn,
            _ => Self::Unused,
        }
    }
}

/// One entry of a PDO definition, 8 bytes each.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SiiPdoEntry {
    pub index: u16,
    pub subindex: u8,
    pub name_string_idx: u8,
    pub data_type: u8,
    pub bit_len: u8,
}

/// One PDO definition from the TxPDO or RxPDO category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiiPdo {
    pub index: u16,
    pub sync_manager: u8,
    pub name_string_idx: u8,
    pub entries: Vec<SiiPdoEntry>,
}

impl SiiPdo {
    pub fn bit_len(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| usize::from(entry.bit_len))
            .sum()
    }
}

/// Everything the master consumes from one device's EEPROM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiiInfo {
    pub alias: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision: u32,
    pub serial: u32,
    /// Standard mailbox layout; `None` when the device declares no mailbox.
    pub mailbox: Option<MailboxConfig>,
    pub mailbox_protocols: MailboxProtocols,
    /// Strings category; index 0 is reserved as the empty string.
    pub strings: Vec<String>,
    pub general: Option<SiiGeneral>,
    pub sync_managers: Vec<SiiSyncManager>,
    /// Device to master PDOs (inputs).
    pub tx_pdos: Vec<SiiPdo>,
    /// Master to device PDOs (outputs).
    pub rx_pdos: Vec<SiiPdo>,
}

impl SiiInfo {
    /// Look up a category string by its 1-based SII string index.
    pub fn string(&self, index: u8) -> Option<&str> {
        if index == 0 {
            return Some("");
        }

        self.strings
            .get(usize::from(index) - 1)
            .map(|s| s.as_str())
    }

    /// Device name from the General category.
    pub fn name(&self) -> Option<&str> {
        self.general
            .as_ref()
            .and_then(|general| self.string(general.name_string_idx))
    }
}

fn word_at(image: &[u8], word: u16) -> Option<u16> {
    let at = usize::from(word) * 2;

    image
        .get(at..at + 2)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u16::from_le_bytes)
}

fn dword_at(image: &[u8], word: u16) -> Option<u32> {
    let at = usize::from(word) * 2;

    image
        .get(at..at + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
}

/// Parse a cached EEPROM image.
///
/// The fixed header area is mandatory; categories are walked left to right, each declared as a
/// `(type, size-in-words)` pair, until the `0xffff` terminator. Unknown categories are skipped
/// by their declared length.
pub fn parse_sii(image: &[u8]) -> Result<SiiInfo, SiiError> {
    let mut info = SiiInfo {
        alias: word_at(image, word::ALIAS).ok_or(SiiError::TooShort)?,
        vendor_id: dword_at(image, word::VENDOR_ID).ok_or(SiiError::TooShort)?,
        product_code: dword_at(image, word::PRODUCT_CODE).ok_or(SiiError::TooShort)?,
        revision: dword_at(image, word::REVISION).ok_or(SiiError::TooShort)?,
        serial: dword_at(image, word::SERIAL).ok_or(SiiError::TooShort)?,
        ..Default::default()
    };

    let recv_offset = word_at(image, word::STD_RECV_MAILBOX_OFFSET).ok_or(SiiError::TooShort)?;
    let recv_size = word_at(image, word::STD_RECV_MAILBOX_SIZE).ok_or(SiiError::TooShort)?;
    let send_offset = word_at(image, word::STD_SEND_MAILBOX_OFFSET).ok_or(SiiError::TooShort)?;
    let send_size = word_at(image, word::STD_SEND_MAILBOX_SIZE).ok_or(SiiError::TooShort)?;

    info.mailbox_protocols = MailboxProtocols::from_bits_truncate(
        word_at(image, word::MAILBOX_PROTOCOL).ok_or(SiiError::TooShort)?,
    );

    let mailbox = MailboxConfig {
        recv_offset,
        recv_size,
        send_offset,
        send_size,
    };

    if mailbox.is_valid() && !info.mailbox_protocols.is_empty() {
        info.mailbox = Some(mailbox);
    }

    let mut cursor = usize::from(word::FIRST_CATEGORY) * 2;

    loop {
        let Some(raw_type) = image
            .get(cursor..cursor + 2)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u16::from_le_bytes)
        else {
            // Image ends without a terminator; treat what was parsed as complete.
            break;
        };

        let category = CategoryType::from(raw_type);

        if category == CategoryType::End {
            break;
        }

        let size_words = image
            .get(cursor + 2..cursor + 4)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u16::from_le_bytes)
            .ok_or(SiiError::CategoryOverrun)?;

        let start = cursor + 4;
        let end = start + usize::from(size_words) * 2;

        let body = image.get(start..end).ok_or(SiiError::CategoryOverrun)?;

        match category {
            CategoryType::Strings => parse_strings(body, &mut info.strings)?,
            CategoryType::General => info.general = Some(parse_general(body)?),
            CategoryType::SyncManager => parse_sync_managers(body, &mut info.sync_managers),
            CategoryType::TxPdo => parse_pdos(body, &mut info.tx_pdos)?,
            CategoryType::RxPdo => parse_pdos(body, &mut info.rx_pdos)?,
            other => {
                log::trace!("skipping SII category {:?} ({} words)", other, size_words);
            }
        }

        cursor = end;
    }

    Ok(info)
}

fn parse_strings(body: &[u8], strings: &mut Vec<String>) -> Result<(), SiiError> {
    let count = *body.first().ok_or(SiiError::Decode)?;
    let mut at = 1usize;

    for _ in 0..count {
        let len = usize::from(*body.get(at).ok_or(SiiError::Decode)?);

        let raw = body.get(at + 1..at + 1 + len).ok_or(SiiError::Decode)?;

        strings.push(String::from_utf8_lossy(raw).into_owned());

        at += 1 + len;
    }

    Ok(())
}

fn parse_general(body: &[u8]) -> Result<SiiGeneral, SiiError> {
    if body.len() < 8 {
        return Err(SiiError::Decode);
    }

    Ok(SiiGeneral {
        group_string_idx: body[0],
        image_string_idx: body[1],
        order_string_idx: body[2],
        name_string_idx: body[3],
        coe_details: CoeDetails::from_bits_truncate(body[5]),
        foe_enabled: body[6] != 0,
        eoe_enabled: body[7] != 0,
    })
}

fn parse_sync_managers(body: &[u8], sync_managers: &mut Vec<SiiSyncManager>) {
    for chunk in body.chunks_exact(8) {
        sync_managers.push(SiiSyncManager {
            start_address: u16::from_le_bytes(chunk[0..2].try_into().unwrap()),
            length: u16::from_le_bytes(chunk[2..4].try_into().unwrap()),
            control: chunk[4],
            enable: chunk[6],
            usage: SyncManagerUsage::from(chunk[7]),
        });
    }
}

fn parse_pdos(body: &[u8], pdos: &mut Vec<SiiPdo>) -> Result<(), SiiError> {
    let mut at = 0usize;

    while at < body.len() {
        let header = body.get(at..at + 8).ok_or(SiiError::Decode)?;

        let entry_count = usize::from(header[2]);

        let mut pdo = SiiPdo {
            index: u16::from_le_bytes(header[0..2].try_into().unwrap()),
            sync_manager: header[3],
            name_string_idx: header[5],
            entries: Vec::with_capacity(entry_count),
        };

        at += 8;

        for _ in 0..entry_count {
            let raw = body.get(at..at + 8).ok_or(SiiError::Decode)?;

            pdo.entries.push(SiiPdoEntry {
                index: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
                subindex: raw[2],
                name_string_idx: raw[3],
                data_type: raw[4],
                bit_len: raw[5],
            });

            at += 8;
        }

        pdos.push(pdo);
    }

    Ok(())
}
