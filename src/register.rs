//! Device register address map.
//!
//! Gives the raw ESC addresses this runtime touches readable names. Defined in ETG1000.4
//! Table 31 and friends.

/// Register address of a device's local memory space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum RegisterAddress {
    /// Device type, `u8`.
    Type = 0x0000,
    /// EtherCAT revision, `u8`.
    Revision = 0x0001,
    /// Device build, `u16`.
    Build = 0x0002,
    /// Number of supported FMMU entities, `u8`.
    FmmuCount = 0x0004,
    /// Number of supported sync manager channels, `u8`.
    SyncManagerChannels = 0x0005,
    /// EtherCAT port descriptors 0-3, `u8`.
    PortDescriptors = 0x0007,
    /// Feature support flags, `u16`.
    SupportFlags = 0x0008,
    /// The device's configured station address, `u16`.
    ConfiguredStationAddress = 0x0010,
    /// The device's station alias, `u16`.
    ConfiguredStationAlias = 0x0012,

    /// DL status, `u16`. ETG1000.4 Table 34.
    DlStatus = 0x0110,

    /// AL control register, `u16`. ETG1000.6 Table 9.
    AlControl = 0x0120,
    /// AL status register, `u16`.
    AlStatus = 0x0130,
    /// AL status code register, `u16`.
    AlStatusCode = 0x0134,

    /// Start of the RX error counter block (one `u16` pair per port), ETG1000.4 Table 41.
    RxErrorCounter = 0x0300,

    /// Watchdog divider, `u16`.
    WatchdogDivider = 0x0400,
    /// Sync manager watchdog timeout, `u16`.
    SyncManagerWatchdog = 0x0420,

    /// EEPROM (SII) config register, `u16`.
    SiiConfig = 0x0500,
    /// EEPROM (SII) control register, `u16`.
    SiiControl = 0x0502,
    /// EEPROM (SII) word address register, `u16`.
    SiiAddress = 0x0504,
    /// Start of 4 bytes of EEPROM read data.
    SiiData = 0x0508,

    /// Fieldbus Memory Management Unit (FMMU) bank, 16 bytes each. ETG1000.4 Table 57.
    Fmmu0 = 0x0600,

    /// Sync manager channel bank, 8 bytes each. ETG1000.4 Table 59.
    Sm0 = 0x0800,
}

impl From<RegisterAddress> for u16 {
    fn from(reg: RegisterAddress) -> Self {
        reg as u16
    }
}

impl RegisterAddress {
    /// FMMU entity by index, 16 available.
    pub fn fmmu(index: u8) -> u16 {
        debug_assert!(index < 16);

        Self::Fmmu0 as u16 + u16::from(index) * 0x10
    }

    /// Sync manager channel by index, 16 available.
    pub fn sync_manager(index: u8) -> u16 {
        debug_assert!(index < 16);

        Self::Sm0 as u16 + u16::from(index) * 0x08
    }

    /// Status byte of a sync manager channel, the 5th byte of the bank entry.
    pub fn sync_manager_status(index: u8) -> u16 {
        Self::sync_manager(index) + 5
    }
}
