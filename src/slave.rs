//! Per-device state owned by the bus.

use crate::al_control::AlState;
use crate::dl_status::DlStatus;
use crate::error::{PduError, SiiError};
use crate::mailbox::request::Mailbox;
use crate::sii::{self, SiiInfo, SiiPdo};
use crate::PduRead;

/// A byte window of the logical process image assigned to one device.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PdiSegment {
    pub offset: usize,
    pub len: usize,
}

impl PdiSegment {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// RX error counter block read from register `0x0300`, ETG1000.4 Table 41.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    /// Invalid frame counter per port.
    pub frame: [u8; 4],
    /// Physical layer error counter per port.
    pub physical: [u8; 4],
    /// Forwarded error counter per port.
    pub forwarded: [u8; 4],
}

impl PduRead for ErrorCounters {
    const LEN: u16 = 12;

    fn try_from_slice(slice: &[u8]) -> Result<Self, PduError> {
        let slice = slice.get(0..12).ok_or(PduError::Decode)?;

        let mut counters = Self::default();

        for port in 0..4 {
            counters.frame[port] = slice[port * 2];
            counters.physical[port] = slice[port * 2 + 1];
            counters.forwarded[port] = slice[8 + port];
        }

        Ok(counters)
    }
}

/// One discovered device.
///
/// Created during discovery, mutated by the bus through the state transitions, and kept until
/// bus teardown.
pub struct Slave {
    /// Station address assigned by the master during discovery.
    pub configured_address: u16,
    pub al_state: AlState,
    pub dl_status: DlStatus,
    pub error_counters: ErrorCounters,
    /// Raw EEPROM image cache.
    pub eeprom: Vec<u8>,
    /// Parsed view of the EEPROM.
    pub sii: Option<SiiInfo>,
    /// Master side mailbox, present once the mailbox sync managers are configured.
    pub mailbox: Option<Mailbox>,
    /// Active TxPDO assignment (from CoE `0x1c13`); empty means every SII TxPDO.
    pub assigned_tx_pdos: Vec<u16>,
    /// Active RxPDO assignment (from CoE `0x1c12`); empty means every SII RxPDO.
    pub assigned_rx_pdos: Vec<u16>,
    /// Input window of the logical image, assigned by the mapping.
    pub inputs: PdiSegment,
    /// Output window of the logical image, assigned by the mapping.
    pub outputs: PdiSegment,
}

impl Slave {
    pub fn new(configured_address: u16) -> Self {
        Self {
            configured_address,
            al_state: AlState::None,
            dl_status: DlStatus::default(),
            error_counters: ErrorCounters::default(),
            eeprom: Vec::new(),
            sii: None,
            mailbox: None,
            assigned_tx_pdos: Vec::new(),
            assigned_rx_pdos: Vec::new(),
            inputs: PdiSegment::default(),
            outputs: PdiSegment::default(),
        }
    }

    /// Cache and parse an EEPROM image.
    pub fn parse_sii(&mut self, image: Vec<u8>) -> Result<(), SiiError> {
        self.sii = Some(sii::parse_sii(&image)?);
        self.eeprom = image;

        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.sii.as_ref().and_then(|info| info.name())
    }

    /// Ports that are linked and carrying communication, from the cached DL status.
    pub fn count_open_ports(&self) -> u8 {
        self.dl_status.open_ports()
    }

    fn pdo_bytes(pdos: &[SiiPdo], assigned: &[u16]) -> usize {
        let bits: usize = pdos
            .iter()
            .filter(|pdo| assigned.is_empty() || assigned.contains(&pdo.index))
            .map(|pdo| pdo.bit_len())
            .sum();

        bits.div_ceil(8)
    }

    /// Bytes this device contributes to the input image.
    pub fn input_len(&self) -> usize {
        self.sii
            .as_ref()
            .map(|info| Self::pdo_bytes(&info.tx_pdos, &self.assigned_tx_pdos))
            .unwrap_or(0)
    }

    /// Bytes this device contributes to the output image.
    pub fn output_len(&self) -> usize {
        self.sii
            .as_ref()
            .map(|info| Self::pdo_bytes(&info.rx_pdos, &self.assigned_rx_pdos))
            .unwrap_or(0)
    }
}

impl core::fmt::Debug for Slave {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Slave")
            .field(
                "configured_address",
                &format_args!("{:#06x}", self.configured_address),
            )
            .field("al_state", &self.al_state)
            .field("name", &self.name().unwrap_or("?"))
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SiiImageBuilder;

    #[test]
    fn parse_sii_populates_view() {
        let mut slave = Slave::new(0x1001);

        slave
            .parse_sii(SiiImageBuilder::demo_io_device().build())
            .unwrap();

        assert_eq!(slave.name(), Some("demo io device"));
        assert_eq!(slave.input_len(), 2);
        assert_eq!(slave.output_len(), 2);
    }

    #[test]
    fn assignment_filters_pdo_sizes() {
        let mut slave = Slave::new(0x1001);

        slave
            .parse_sii(SiiImageBuilder::demo_io_device().build())
            .unwrap();

        // Deselect the only TxPDO.
        slave.assigned_tx_pdos = vec![0x1a99];

        assert_eq!(slave.input_len(), 0);
        assert_eq!(slave.output_len(), 2);
    }

    #[test]
    fn error_counter_layout() {
        let raw = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

        let counters = ErrorCounters::try_from_slice(&raw).unwrap();

        assert_eq!(counters.frame, [1, 3, 5, 7]);
        assert_eq!(counters.physical, [2, 4, 6, 8]);
        assert_eq!(counters.forwarded, [9, 10, 11, 12]);
    }

    #[test]
    fn open_ports_follow_dl_status() {
        let mut slave = Slave::new(0x1001);

        assert_eq!(slave.count_open_ports(), 0);

        slave.dl_status = DlStatus::with_open_ports(3);

        assert_eq!(slave.count_open_ports(), 3);
    }
}
