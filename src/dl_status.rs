//! DL status word: per-port link, loopback and signal bits.

use crate::error::PduError;
use crate::PduRead;

/// DL status register (`0x0110`), ETG1000.4 Table 34.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DlStatus {
    pub pdi_operational: bool,
    pub watchdog_ok: bool,
    pub extended_link_detection: bool,
    /// True if the numbered port has a physical link present.
    pub link_port: [bool; 4],
    /// True if the numbered port forwards to itself (loopback).
    pub loopback_port: [bool; 4],
    /// RX signal detected on the numbered port.
    pub signal_port: [bool; 4],
}

impl DlStatus {
    /// Number of ports that are both linked and carrying communication.
    ///
    /// Topology inference keys off this: one open port is a chain end, two a pass-through,
    /// more a junction.
    pub fn open_ports(&self) -> u8 {
        self.link_port
            .iter()
            .zip(self.signal_port.iter())
            .filter(|(link, signal)| **link && **signal)
            .count() as u8
    }

    /// Port state used by tests and emulation: mark `count` ports as open.
    pub fn with_open_ports(count: u8) -> Self {
        let mut status = Self::default();

        for port in 0..usize::from(count.min(4)) {
            status.link_port[port] = true;
            status.signal_port[port] = true;
        }

        status
    }
}

impl PduRead for DlStatus {
    const LEN: u16 = 2;

    fn try_from_slice(slice: &[u8]) -> Result<Self, PduError> {
        let raw = u16::try_from_slice(slice)?;

        let bit = |n: u16| raw & (1 << n) != 0;

        Ok(Self {
            pdi_operational: bit(0),
            watchdog_ok: bit(1),
            extended_link_detection: bit(2),
            link_port: [bit(4), bit(5), bit(6), bit(7)],
            loopback_port: [bit(8), bit(10), bit(12), bit(14)],
            signal_port: [bit(9), bit(11), bit(13), bit(15)],
        })
    }
}

impl DlStatus {
    pub fn pack(&self) -> [u8; 2] {
        let mut raw = 0u16;

        let mut set = |n: u16, value: bool| {
            if value {
                raw |= 1 << n;
            }
        };

        set(0, self.pdi_operational);
        set(1, self.watchdog_ok);
        set(2, self.extended_link_detection);

        for port in 0..4 {
            set(4 + port as u16, self.link_port[port]);
            set(8 + 2 * port as u16, self.loopback_port[port]);
            set(9 + 2 * port as u16, self.signal_port[port]);
        }

        raw.to_le_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let status = DlStatus {
            pdi_operational: true,
            watchdog_ok: true,
            extended_link_detection: false,
            link_port: [true, true, false, false],
            loopback_port: [false, true, false, false],
            signal_port: [true, true, false, false],
        };

        assert_eq!(DlStatus::try_from_slice(&status.pack()), Ok(status));
    }

    #[test]
    fn open_port_count() {
        assert_eq!(DlStatus::with_open_ports(0).open_ports(), 0);
        assert_eq!(DlStatus::with_open_ports(2).open_ports(), 2);
        assert_eq!(DlStatus::with_open_ports(4).open_ports(), 4);

        // A linked port with no communication does not count as open.
        let mut status = DlStatus::with_open_ports(2);

        status.signal_port[1] = false;

        assert_eq!(status.open_ports(), 1);
    }
}
