//! AL (application layer) state machine words.

use crate::error::PduError;
use crate::{PduData, PduRead};

/// AL state of a single device.
///
/// Read from register `0x0130`, requested through `0x0120`. Defined in ETG1000.6 Table 9.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AlState {
    /// No state recorded/read/known.
    #[default]
    None,
    /// EtherCAT `INIT` state.
    Init,
    /// EtherCAT `PRE-OP` state.
    PreOp,
    /// EtherCAT `BOOT` state, used for firmware update.
    Boot,
    /// EtherCAT `SAFE-OP` state.
    SafeOp,
    /// EtherCAT `OP` state.
    Op,
    /// A combination of states or an out-of-spec value.
    Other(u8),
}

impl From<u8> for AlState {
    fn from(value: u8) -> Self {
        match value {
            0x00 => AlState::None,
            0x01 => AlState::Init,
            0x02 => AlState::PreOp,
            0x03 => AlState::Boot,
            0x04 => AlState::SafeOp,
            0x08 => AlState::Op,
            other => AlState::Other(other),
        }
    }
}

impl From<AlState> for u8 {
    fn from(state: AlState) -> Self {
        match state {
            AlState::None => 0x00,
            AlState::Init => 0x01,
            AlState::PreOp => 0x02,
            AlState::Boot => 0x03,
            AlState::SafeOp => 0x04,
            AlState::Op => 0x08,
            AlState::Other(other) => other,
        }
    }
}

impl core::fmt::Display for AlState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AlState::None => f.write_str("None"),
            AlState::Init => f.write_str("Init"),
            AlState::PreOp => f.write_str("Pre-Operational"),
            AlState::Boot => f.write_str("Bootstrap"),
            AlState::SafeOp => f.write_str("Safe-Operational"),
            AlState::Op => f.write_str("Operational"),
            AlState::Other(value) => write!(f, "Other({:#04x})", value),
        }
    }
}

/// The AL control/status word.
///
/// The same layout serves both registers: the requested or reported state in the low nibble, the
/// error/acknowledge flag in bit 4.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AlControl {
    pub state: AlState,
    /// In AL status: the device flags a transition error. In AL control it stays clear for the
    /// in-place acknowledge ([`AlControl::acknowledge`]); the INIT reset is the one request
    /// that raises it.
    pub error: bool,
    /// ID request flag.
    pub id_request: bool,
}

impl AlControl {
    pub fn new(state: AlState) -> Self {
        Self {
            state,
            error: false,
            id_request: false,
        }
    }

    /// Request INIT and acknowledge any pending error in one write.
    pub fn reset() -> Self {
        Self {
            state: AlState::Init,
            error: true,
            ..Default::default()
        }
    }

    /// Acknowledge a flagged error in place: the current state written back with bit 4 clear.
    ///
    /// A device that raised its error flag refuses further transitions until it sees exactly
    /// this form.
    pub fn acknowledge(state: AlState) -> Self {
        Self {
            state,
            error: false,
            id_request: false,
        }
    }
}

impl PduRead for AlControl {
    const LEN: u16 = 2;

    fn try_from_slice(slice: &[u8]) -> Result<Self, PduError> {
        let raw = u16::try_from_slice(slice)?;

        Ok(Self {
            state: AlState::from((raw & 0x0f) as u8),
            error: raw & (1 << 4) != 0,
            id_request: raw & (1 << 5) != 0,
        })
    }
}

impl PduData for AlControl {
    type Bytes = [u8; 2];

    fn as_bytes(&self) -> Self::Bytes {
        let raw = u16::from(u8::from(self.state) & 0x0f)
            | (self.error as u16) << 4
            | (self.id_request as u16) << 5;

        raw.to_le_bytes()
    }
}
