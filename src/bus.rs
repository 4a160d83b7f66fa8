//! Bus orchestration: discovery, AL state transitions, SII loading, mailbox pumping, process
//! data mapping and the cyclic exchange.

use crate::al_control::{AlControl, AlState};
use crate::al_status_code::AlStatusCode;
use crate::clock::Clock;
use crate::command::{create_address, position_address, Command};
use crate::error::{ConfigError, Error, MailboxError, PduError};
use crate::fmmu::Fmmu;
use crate::frame::EthercatFrame;
use crate::link::{DatagramState, Link};
use crate::mailbox::request::{Mailbox, MessageHandle, MessageStatus};
use crate::register::RegisterAddress;
use crate::sii::{MailboxProtocols, SiiRequest, SiiControl, SyncManagerUsage};
use crate::slave::{ErrorCounters, PdiSegment, Slave};
use crate::sync_manager_channel::{Direction, Status, SyncManagerChannel};
use crate::{PduData, PduRead, BASE_STATION_ADDRESS};
use core::time::Duration;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Deadlines for everything that blocks.
#[derive(Debug, Copy, Clone)]
pub struct Timeouts {
    /// Socket deadline for one receive inside the datagram pipeline.
    pub pdu: Duration,
    /// Budget for a full AL state transition across the chain.
    pub state_transition: Duration,
    /// Sleep between polls of a condition (state waits, mailbox rounds, EEPROM busy).
    pub poll_interval: Duration,
    /// Per-message mailbox deadline.
    pub mailbox_response: Duration,
    /// Budget for one EEPROM word read.
    pub eeprom: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            pdu: Duration::from_millis(2),
            state_transition: Duration::from_secs(1),
            poll_interval: Duration::from_millis(1),
            mailbox_response: Duration::from_millis(500),
            eeprom: Duration::from_millis(20),
        }
    }
}

/// Knobs that change how the bus is brought up.
#[derive(Debug, Copy, Clone, Default)]
pub struct BusConfig {
    /// Trust the SII PDO lists as-is instead of reading the CoE PDO assignment objects.
    pub is_static_mapping: bool,
}

/// How an SDO read addresses the subindices of an object.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SdoAccess {
    /// One subindex.
    Partial,
    /// All subindices in one exchange, for devices that support complete access.
    Complete,
    /// Read subindex 0 (the entry count) then each subindex in turn, for devices that do not.
    EmulateComplete,
}

#[derive(Debug, Copy, Clone)]
struct PdiLayout {
    input_len: usize,
    total_len: usize,
    expected_lrd_wkc: u16,
    expected_lwr_wkc: u16,
    expected_lrw_wkc: u16,
}

/// The master's view of one fieldbus segment.
pub struct Bus {
    link: Link,
    clock: Rc<dyn Clock>,
    timeouts: Timeouts,
    config: BusConfig,
    slaves: Vec<Slave>,
    pdi: Option<PdiLayout>,
}

impl Bus {
    pub fn new(mut link: Link, clock: Rc<dyn Clock>, timeouts: Timeouts, config: BusConfig) -> Self {
        link.set_timeout(Some(timeouts.pdu));

        Self {
            link,
            clock,
            timeouts,
            config,
            slaves: Vec::new(),
            pdi: None,
        }
    }

    pub fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    pub fn slaves_mut(&mut self) -> &mut [Slave] {
        &mut self.slaves
    }

    /// Full discovery and baseline configuration, ending with every device in PRE-OP.
    pub fn init(&mut self) -> Result<(), Error> {
        self.reset_slaves()?;

        let count = self.count_slaves()?;

        log::info!("detected {} devices", count);

        if count == 0 {
            log::warn!("no devices detected; check wiring and interface");

            self.slaves.clear();

            return Ok(());
        }

        self.slaves = (0..count)
            .map(|position| Slave::new(BASE_STATION_ADDRESS + position))
            .collect();

        // Hand out configured station addresses in chain order; everything after this addresses
        // devices by station.
        for position in 0..count {
            let (_, wkc) = self.roundtrip(
                Command::Apwr,
                position_address(position, RegisterAddress::ConfiguredStationAddress.into()),
                &(BASE_STATION_ADDRESS + position).as_bytes(),
                2,
            )?;

            if wkc != 1 {
                return Err(Error::WorkingCounter {
                    expected: 1,
                    received: wkc,
                });
            }
        }

        self.refresh_dl_status()?;

        for index in 0..self.slaves.len() {
            self.load_eeprom(index)?;
            self.configure_mailbox(index)?;
        }

        self.request_state(AlState::PreOp)?;
        self.wait_for_state(AlState::PreOp, self.timeouts.state_transition, None)?;

        Ok(())
    }

    /// Broadcast reset: request INIT everywhere, acknowledging stale errors, and blank the
    /// translation and channel banks plus the error counters.
    fn reset_slaves(&mut self) -> Result<(), Error> {
        log::debug!("resetting devices");

        self.bwr(RegisterAddress::AlControl.into(), &AlControl::reset().as_bytes())?;

        for index in 0..16 {
            self.bwr(RegisterAddress::fmmu(index), &[0u8; 16])?;
            self.bwr(RegisterAddress::sync_manager(index), &[0u8; 8])?;
        }

        self.bwr(RegisterAddress::RxErrorCounter.into(), &[0u8; 12])?;

        Ok(())
    }

    /// Every device increments the working counter of a broadcast read, so the count of devices
    /// falls out of a BRD of the type register.
    fn count_slaves(&mut self) -> Result<u16, Error> {
        let mut frame = EthercatFrame::new();

        frame.add_datagram(
            Command::Brd,
            0,
            create_address(0, RegisterAddress::Type.into()),
            &[],
            1,
        )?;

        self.link.write_then_read(&mut frame)?;

        let wkc = frame
            .datagrams()?
            .next()
            .map(|datagram| datagram.wkc)
            .ok_or(Error::Pdu(PduError::Decode))?;

        Ok(wkc)
    }

    /// Read the DL status of every device into its record.
    pub fn refresh_dl_status(&mut self) -> Result<(), Error> {
        for index in 0..self.slaves.len() {
            let address = self.slaves[index].configured_address;

            let status = self.fprd(address, RegisterAddress::DlStatus.into())?;

            self.slaves[index].dl_status = status;
        }

        Ok(())
    }

    /// Read the RX error counter block of every device into its record.
    pub fn refresh_error_counters(&mut self) -> Result<(), Error> {
        for index in 0..self.slaves.len() {
            let address = self.slaves[index].configured_address;

            let counters: ErrorCounters =
                self.fprd(address, RegisterAddress::RxErrorCounter.into())?;

            self.slaves[index].error_counters = counters;
        }

        Ok(())
    }

    /// Read one device's EEPROM through the SII registers: header area first, then category by
    /// category until the end marker.
    fn load_eeprom(&mut self, index: usize) -> Result<(), Error> {
        const MAX_IMAGE: usize = 4096;

        let address = self.slaves[index].configured_address;

        let mut image = Vec::new();
        let mut word = 0u16;

        while !sii_image_complete(&image) && image.len() < MAX_IMAGE {
            let bytes = self.read_eeprom_word(address, word)?;

            image.extend_from_slice(&bytes);
            word += 2;
        }

        log::debug!("device {:#06x}: read {} bytes of SII", address, image.len());

        self.slaves[index].parse_sii(image)?;

        Ok(())
    }

    /// One 4 byte EEPROM read: post the request, poll busy, fetch the data register.
    fn read_eeprom_word(&mut self, address: u16, word: u16) -> Result<[u8; 4], Error> {
        self.fpwr_slice(
            address,
            RegisterAddress::SiiControl.into(),
            &SiiRequest::read(word).as_array(),
        )?;

        let deadline = self.clock.now() + self.timeouts.eeprom;

        loop {
            let raw: u16 = self.fprd(address, RegisterAddress::SiiControl.into())?;
            let control = SiiControl::unpack(raw);

            if control.has_error() {
                return Err(Error::Config(ConfigError::Sii(
                    crate::error::SiiError::Decode,
                )));
            }

            if !control.busy {
                break;
            }

            if self.clock.now() >= deadline {
                return Err(Error::Timeout);
            }

            std::thread::sleep(self.timeouts.poll_interval);
        }

        let data: u32 = self.fprd(address, RegisterAddress::SiiData.into())?;

        Ok(data.to_le_bytes())
    }

    /// Program the mailbox sync manager pair from the device's SII and attach a mailbox.
    fn configure_mailbox(&mut self, index: usize) -> Result<(), Error> {
        let (address, config) = {
            let slave = &self.slaves[index];

            let Some(config) = slave.sii.as_ref().and_then(|info| info.mailbox) else {
                return Ok(());
            };

            (slave.configured_address, config)
        };

        self.fpwr(
            address,
            RegisterAddress::sync_manager(0),
            SyncManagerChannel::mailbox_write(config.recv_offset, config.recv_size),
        )?;

        self.fpwr(
            address,
            RegisterAddress::sync_manager(1),
            SyncManagerChannel::mailbox_read(config.send_offset, config.send_size),
        )?;

        log::debug!(
            "device {:#06x}: mailbox recv {:#06x}/{} send {:#06x}/{}",
            address,
            config.recv_offset,
            config.recv_size,
            config.send_offset,
            config.send_size
        );

        self.slaves[index].mailbox = Some(Mailbox::new(address, config));

        Ok(())
    }

    /// Broadcast a state request to every device.
    pub fn request_state(&mut self, state: AlState) -> Result<(), Error> {
        log::debug!("requesting state {}", state);

        let wkc = self.bwr(
            RegisterAddress::AlControl.into(),
            &AlControl::new(state).as_bytes(),
        )?;

        let expected = self.slaves.len() as u16;

        if wkc != expected {
            return Err(Error::WorkingCounter {
                expected,
                received: wkc,
            });
        }

        Ok(())
    }

    /// Poll the broadcast AL status until every device reports `state` or the timeout passes.
    ///
    /// Fails with the AL status code of the first device found in error.
    pub fn wait_for_state(
        &mut self,
        state: AlState,
        timeout: Duration,
        mut on_poll: Option<&mut dyn FnMut()>,
    ) -> Result<(), Error> {
        let deadline = self.clock.now() + timeout;
        let expected_wkc = self.slaves.len() as u16;

        loop {
            let (data, wkc) = self.brd(RegisterAddress::AlStatus.into(), 2)?;

            if wkc != expected_wkc {
                return Err(Error::WorkingCounter {
                    expected: expected_wkc,
                    received: wkc,
                });
            }

            // A broadcast read ORs the registers of every device, so the combined word only
            // equals the target while all devices agree and none flags an error.
            let combined = AlControl::try_from_slice(&data)?;

            if combined.state == state && !combined.error {
                for slave in &mut self.slaves {
                    slave.al_state = state;
                }

                return Ok(());
            }

            if combined.error {
                self.find_faulty_slave()?;
            }

            if self.clock.now() >= deadline {
                log::error!("devices stuck in {} waiting for {}", combined.state, state);

                return Err(Error::Timeout);
            }

            if let Some(callback) = on_poll.as_deref_mut() {
                callback();
            }

            std::thread::sleep(self.timeouts.poll_interval);
        }
    }

    /// Hunt down the first device reporting an AL error and surface its status code.
    fn find_faulty_slave(&mut self) -> Result<(), Error> {
        for index in 0..self.slaves.len() {
            let address = self.slaves[index].configured_address;

            let status: AlControl = self.fprd(address, RegisterAddress::AlStatus.into())?;

            self.slaves[index].al_state = status.state;

            if status.error {
                let code: AlStatusCode =
                    self.fprd(address, RegisterAddress::AlStatusCode.into())?;

                // A raised error flag with no code yet is transient; keep polling.
                if code != AlStatusCode::NoError {
                    log::error!("device {:#06x} refused transition: {}", address, code);

                    return Err(Error::AlStatus(code));
                }
            }
        }

        Ok(())
    }

    /// Acknowledge the error flag of every device that raised one by writing its current state
    /// back with bit 4 clear, re-enabling transitions.
    pub fn ack_errors(&mut self) -> Result<(), Error> {
        for index in 0..self.slaves.len() {
            let address = self.slaves[index].configured_address;

            let status: AlControl = self.fprd(address, RegisterAddress::AlStatus.into())?;

            self.slaves[index].al_state = status.state;

            if status.error {
                log::debug!("device {:#06x}: acknowledging error", address);

                self.fpwr(
                    address,
                    RegisterAddress::AlControl.into(),
                    AlControl::acknowledge(status.state),
                )?;
            }
        }

        Ok(())
    }

    /// Read one device's AL state.
    pub fn get_current_state(&mut self, index: usize) -> Result<AlState, Error> {
        let address = self.address_of(index)?;

        let status: AlControl = self.fprd(address, RegisterAddress::AlStatus.into())?;

        self.slaves[index].al_state = status.state;

        Ok(status.state)
    }

    /// Compute the global process data layout, program each device's translation units and
    /// channels, and remember the cyclic expectations.
    ///
    /// `iomap` is the caller's logical image buffer: inputs first, then outputs.
    pub fn create_mapping(&mut self, iomap: &mut [u8]) -> Result<(), Error> {
        if !self.config.is_static_mapping {
            self.read_pdo_assignments()?;
        }

        let mut cursor = 0usize;
        let mut expected_lrd_wkc = 0u16;
        let mut expected_lwr_wkc = 0u16;
        let mut expected_lrw_wkc = 0u16;

        for slave in &mut self.slaves {
            let len = slave.input_len();

            slave.inputs = PdiSegment {
                offset: cursor,
                len,
            };

            cursor += len;

            if len > 0 {
                expected_lrd_wkc += 1;
                expected_lrw_wkc += 1;
            }
        }

        let input_len = cursor;

        for slave in &mut self.slaves {
            let len = slave.output_len();

            slave.outputs = PdiSegment {
                offset: cursor,
                len,
            };

            cursor += len;

            if len > 0 {
                expected_lwr_wkc += 1;
                expected_lrw_wkc += 2;
            }
        }

        let total_len = cursor;

        if total_len > iomap.len() {
            return Err(Error::Config(ConfigError::PdiTooLong {
                available: iomap.len(),
                needed: total_len,
            }));
        }

        iomap[..total_len].fill(0);

        for index in 0..self.slaves.len() {
            self.program_mapping(index)?;
        }

        log::info!(
            "process image: {} input bytes, {} output bytes",
            input_len,
            total_len - input_len
        );

        self.pdi = Some(PdiLayout {
            input_len,
            total_len,
            expected_lrd_wkc,
            expected_lwr_wkc,
            expected_lrw_wkc,
        });

        Ok(())
    }

    /// Program one device's process data sync managers and FMMUs from its assigned windows.
    fn program_mapping(&mut self, index: usize) -> Result<(), Error> {
        struct ChannelPlan {
            sm_index: u8,
            sm_start: u16,
            segment: PdiSegment,
            write: bool,
        }

        let (address, plans) = {
            let slave = &self.slaves[index];

            let Some(info) = slave.sii.as_ref() else {
                return Ok(());
            };

            let mut plans = Vec::new();

            for (sm_index, sm) in info.sync_managers.iter().enumerate() {
                let (segment, write) = match sm.usage {
                    SyncManagerUsage::ProcessDataOut => (slave.outputs, true),
                    SyncManagerUsage::ProcessDataIn => (slave.inputs, false),
                    _ => continue,
                };

                if segment.is_empty() {
                    continue;
                }

                plans.push(ChannelPlan {
                    sm_index: sm_index as u8,
                    sm_start: sm.start_address,
                    segment,
                    write,
                });
            }

            (slave.configured_address, plans)
        };

        for (fmmu_index, plan) in plans.iter().enumerate() {
            self.fpwr(
                address,
                RegisterAddress::sync_manager(plan.sm_index),
                SyncManagerChannel::process_data(
                    plan.sm_start,
                    plan.segment.len as u16,
                    if plan.write {
                        Direction::MasterWrite
                    } else {
                        Direction::MasterRead
                    },
                ),
            )?;

            self.fpwr(
                address,
                RegisterAddress::fmmu(fmmu_index as u8),
                Fmmu::byte_mapping(
                    plan.segment.offset as u32,
                    plan.sm_start,
                    plan.segment.len as u16,
                    plan.write,
                ),
            )?;
        }

        Ok(())
    }

    /// Read the CoE PDO assignment objects (`0x1c12`/`0x1c13`) of every CoE-capable device.
    ///
    /// A device without these objects keeps its SII-declared PDO set.
    fn read_pdo_assignments(&mut self) -> Result<(), Error> {
        for index in 0..self.slaves.len() {
            let has_coe = {
                let slave = &self.slaves[index];

                slave.mailbox.is_some()
                    && slave
                        .sii
                        .as_ref()
                        .map(|info| info.mailbox_protocols.contains(MailboxProtocols::COE))
                        .unwrap_or(false)
            };

            if !has_coe {
                continue;
            }

            self.slaves[index].assigned_rx_pdos = self.read_assignment(index, 0x1c12)?;
            self.slaves[index].assigned_tx_pdos = self.read_assignment(index, 0x1c13)?;
        }

        Ok(())
    }

    fn read_assignment(&mut self, index: usize, object: u16) -> Result<Vec<u16>, Error> {
        let count = match self.read_sdo(index, object, 0, SdoAccess::Partial, 1) {
            Ok(data) => data.first().copied().unwrap_or(0),
            // No such object: the device maps per its SII.
            Err(Error::Mailbox(MailboxError::Aborted { .. })) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut assigned = Vec::with_capacity(usize::from(count));

        for subindex in 1..=count {
            let data = self.read_sdo(index, object, subindex, SdoAccess::Partial, 2)?;

            let pdo = data
                .get(0..2)
                .and_then(|bytes| bytes.try_into().ok())
                .map(u16::from_le_bytes)
                .ok_or(Error::Mailbox(MailboxError::InvalidResponse))?;

            assigned.push(pdo);
        }

        Ok(assigned)
    }

    /// Cyclic read of the input image.
    pub fn process_data_read(
        &mut self,
        iomap: &mut [u8],
        mut on_error: impl FnMut(DatagramState),
    ) -> Result<(), Error> {
        let layout = self.pdi.ok_or(Error::Config(ConfigError::NoMapping))?;

        if layout.input_len == 0 {
            return Ok(());
        }

        let (data, wkc) =
            match self.roundtrip(Command::Lrd, 0, &[], layout.input_len as u16) {
                Ok(result) => result,
                Err(Error::Pdu(PduError::Failed(state))) => {
                    on_error(state);

                    return Err(Error::Pdu(PduError::Failed(state)));
                }
                Err(e) => return Err(e),
            };

        iomap[..layout.input_len].copy_from_slice(&data);

        if wkc != layout.expected_lrd_wkc {
            on_error(DatagramState::InvalidWkc);

            return Err(Error::WorkingCounter {
                expected: layout.expected_lrd_wkc,
                received: wkc,
            });
        }

        Ok(())
    }

    /// Cyclic write of the output image.
    pub fn process_data_write(
        &mut self,
        iomap: &[u8],
        mut on_error: impl FnMut(DatagramState),
    ) -> Result<(), Error> {
        let layout = self.pdi.ok_or(Error::Config(ConfigError::NoMapping))?;

        let output_len = layout.total_len - layout.input_len;

        if output_len == 0 {
            return Ok(());
        }

        let outputs = &iomap[layout.input_len..layout.total_len];

        let (_, wkc) = match self.roundtrip(
            Command::Lwr,
            layout.input_len as u32,
            outputs,
            output_len as u16,
        ) {
            Ok(result) => result,
            Err(Error::Pdu(PduError::Failed(state))) => {
                on_error(state);

                return Err(Error::Pdu(PduError::Failed(state)));
            }
            Err(e) => return Err(e),
        };

        if wkc != layout.expected_lwr_wkc {
            on_error(DatagramState::InvalidWkc);

            return Err(Error::WorkingCounter {
                expected: layout.expected_lwr_wkc,
                received: wkc,
            });
        }

        Ok(())
    }

    /// Cyclic exchange of the whole image in one LRW: outputs go out, inputs come back.
    ///
    /// An under-count means some device failed to service its read or write; attributing it to a
    /// device takes an AL status or sync manager inspection, which is left to the caller.
    pub fn process_data_exchange(
        &mut self,
        iomap: &mut [u8],
        mut on_error: impl FnMut(DatagramState),
    ) -> Result<(), Error> {
        let layout = self.pdi.ok_or(Error::Config(ConfigError::NoMapping))?;

        if layout.total_len == 0 {
            return Ok(());
        }

        let outgoing = iomap[..layout.total_len].to_vec();

        let (data, wkc) = match self.roundtrip(
            Command::Lrw,
            0,
            &outgoing,
            layout.total_len as u16,
        ) {
            Ok(result) => result,
            Err(Error::Pdu(PduError::Failed(state))) => {
                on_error(state);

                return Err(Error::Pdu(PduError::Failed(state)));
            }
            Err(e) => return Err(e),
        };

        iomap[..layout.total_len].copy_from_slice(&data);

        if wkc != layout.expected_lrw_wkc {
            on_error(DatagramState::InvalidWkc);

            return Err(Error::WorkingCounter {
                expected: layout.expected_lrw_wkc,
                received: wkc,
            });
        }

        Ok(())
    }

    /// Pump every device's mailbox: post queued requests, fetch ready responses, expire
    /// deadlines.
    pub fn process_awaiting_frames(&mut self) -> Result<(), Error> {
        let now = self.clock.now();

        for index in 0..self.slaves.len() {
            let (address, config, busy) = {
                let slave = &self.slaves[index];

                match slave.mailbox.as_ref() {
                    Some(mailbox) => (slave.configured_address, mailbox.config, mailbox.is_busy()),
                    None => continue,
                }
            };

            if !busy {
                continue;
            }

            // Post the next request once the device has consumed the previous one.
            let write_status: u8 =
                self.fprd(address, RegisterAddress::sync_manager_status(0))?;

            if !Status::unpack(write_status).mailbox_full {
                let outgoing = self.slaves[index]
                    .mailbox
                    .as_mut()
                    .and_then(|mailbox| mailbox.send(now));

                if let Some(mut bytes) = outgoing {
                    // A mailbox write must cover the whole sync manager buffer.
                    bytes.resize(usize::from(config.recv_size), 0);

                    self.fpwr_slice(address, config.recv_offset, &bytes)?;
                }
            }

            // Fetch a response when the device flags its send mailbox full.
            let read_status: u8 =
                self.fprd(address, RegisterAddress::sync_manager_status(1))?;

            if Status::unpack(read_status).mailbox_full {
                let data = self.fprd_slice(address, config.send_offset, config.send_size)?;

                let mailbox = self.slaves[index].mailbox.as_mut().unwrap();

                if !mailbox.receive(&data) {
                    log::trace!(
                        "device {:#06x}: mailbox bytes matched no pending message",
                        address
                    );
                }
            }

            if let Some(mailbox) = self.slaves[index].mailbox.as_mut() {
                mailbox.process_timeouts(now);
            }
        }

        Ok(())
    }

    /// Read an SDO, blocking until the dialog settles.
    pub fn read_sdo(
        &mut self,
        index: usize,
        object: u16,
        subindex: u8,
        access: SdoAccess,
        capacity: usize,
    ) -> Result<Vec<u8>, Error> {
        match access {
            SdoAccess::Partial | SdoAccess::Complete => {
                let handle = {
                    let timeout = self.timeouts.mailbox_response;
                    let mailbox = self.mailbox_of(index)?;

                    mailbox.create_sdo_upload(
                        object,
                        subindex,
                        access == SdoAccess::Complete,
                        capacity,
                        timeout,
                    )
                };

                self.wait_message(&handle)
            }
            SdoAccess::EmulateComplete => {
                // Subindex 0 is the entry count, an 8 bit value zero-extended here.
                let count = self
                    .read_sdo(index, object, 0, SdoAccess::Partial, 1)?
                    .first()
                    .copied()
                    .unwrap_or(0);

                let mut out = Vec::new();

                for sub in 1..=count {
                    let remaining = capacity
                        .checked_sub(out.len())
                        .filter(|remaining| *remaining > 0)
                        .ok_or(Error::Mailbox(MailboxError::ClientBufferTooSmall))?;

                    let chunk =
                        self.read_sdo(index, object, sub, SdoAccess::Partial, remaining)?;

                    out.extend_from_slice(&chunk);
                }

                Ok(out)
            }
        }
    }

    /// Write an SDO, blocking until the dialog settles.
    pub fn write_sdo(
        &mut self,
        index: usize,
        object: u16,
        subindex: u8,
        complete_access: bool,
        data: &[u8],
    ) -> Result<(), Error> {
        let handle = {
            let timeout = self.timeouts.mailbox_response;
            let mailbox = self.mailbox_of(index)?;

            mailbox.create_sdo_download(object, subindex, complete_access, data, timeout)
        };

        self.wait_message(&handle).map(|_| ())
    }

    /// Fetch a file over FoE, blocking until the transfer settles.
    pub fn read_file(
        &mut self,
        index: usize,
        filename: &str,
        password: u32,
    ) -> Result<Vec<u8>, Error> {
        let handle = {
            let timeout = self.timeouts.mailbox_response;
            let mailbox = self.mailbox_of(index)?;

            mailbox.create_read_file(filename, password, timeout)
        };

        self.wait_message(&handle)
    }

    /// Push a file over FoE, blocking until the transfer settles.
    pub fn write_file(
        &mut self,
        index: usize,
        filename: &str,
        password: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let handle = {
            let timeout = self.timeouts.mailbox_response;
            let mailbox = self.mailbox_of(index)?;

            mailbox.create_write_file(filename, password, data, timeout)
        };

        self.wait_message(&handle).map(|_| ())
    }

    fn wait_message(&mut self, handle: &MessageHandle) -> Result<Vec<u8>, Error> {
        loop {
            match handle.status() {
                MessageStatus::Running => {
                    self.process_awaiting_frames()?;

                    std::thread::sleep(self.timeouts.poll_interval);
                }
                MessageStatus::Success => return Ok(handle.data()),
                MessageStatus::TimedOut => return Err(Error::Timeout),
                MessageStatus::Failed(error) => return Err(Error::Mailbox(error)),
            }
        }
    }

    fn address_of(&self, index: usize) -> Result<u16, Error> {
        self.slaves
            .get(index)
            .map(|slave| slave.configured_address)
            .ok_or(Error::Config(ConfigError::SlaveNotFound(index as u16)))
    }

    fn mailbox_of(&mut self, index: usize) -> Result<&mut Mailbox, Error> {
        self.slaves
            .get_mut(index)
            .ok_or(Error::Config(ConfigError::SlaveNotFound(index as u16)))?
            .mailbox
            .as_mut()
            .ok_or(Error::Mailbox(MailboxError::NoMailbox))
    }

    /// One datagram round trip through the link, returning the payload and working counter.
    fn roundtrip(
        &mut self,
        command: Command,
        address: u32,
        data: &[u8],
        length: u16,
    ) -> Result<(Vec<u8>, u16), Error> {
        let result: Rc<RefCell<Option<(Vec<u8>, u16)>>> = Rc::new(RefCell::new(None));
        let failure: Rc<Cell<Option<DatagramState>>> = Rc::new(Cell::new(None));

        {
            let result = result.clone();
            let failure = failure.clone();

            self.link.add_datagram(
                command,
                address,
                data,
                length,
                move |_header, payload, wkc| {
                    *result.borrow_mut() = Some((payload.to_vec(), wkc));

                    DatagramState::Ok
                },
                move |state| failure.set(Some(state)),
            )?;
        }

        self.link.process_datagrams()?;

        if let Some(state) = failure.get() {
            return Err(Error::Pdu(PduError::Failed(state)));
        }

        let taken = result.borrow_mut().take();
        taken.ok_or(Error::Pdu(PduError::Failed(DatagramState::Lost)))
    }

    fn brd(&mut self, register: u16, length: u16) -> Result<(Vec<u8>, u16), Error> {
        self.roundtrip(Command::Brd, create_address(0, register), &[], length)
    }

    fn bwr(&mut self, register: u16, data: &[u8]) -> Result<u16, Error> {
        self.roundtrip(
            Command::Bwr,
            create_address(0, register),
            data,
            data.len() as u16,
        )
        .map(|(_, wkc)| wkc)
    }

    fn fprd<T: PduRead>(&mut self, address: u16, register: u16) -> Result<T, Error> {
        let data = self.fprd_slice(address, register, T::LEN)?;

        T::try_from_slice(&data).map_err(Error::Pdu)
    }

    fn fprd_slice(
        &mut self,
        address: u16,
        register: u16,
        length: u16,
    ) -> Result<Vec<u8>, Error> {
        let (data, wkc) = self.roundtrip(
            Command::Fprd,
            create_address(address, register),
            &[],
            length,
        )?;

        if wkc != 1 {
            return Err(Error::WorkingCounter {
                expected: 1,
                received: wkc,
            });
        }

        Ok(data)
    }

    fn fpwr<T: PduData>(&mut self, address: u16, register: u16, value: T) -> Result<(), Error> {
        let bytes = value.as_bytes();

        self.fpwr_slice(address, register, bytes.as_ref())
    }

    fn fpwr_slice(&mut self, address: u16, register: u16, data: &[u8]) -> Result<(), Error> {
        let (_, wkc) = self.roundtrip(
            Command::Fpwr,
            create_address(address, register),
            data,
            data.len() as u16,
        )?;

        if wkc != 1 {
            return Err(Error::WorkingCounter {
                expected: 1,
                received: wkc,
            });
        }

        Ok(())
    }
}

/// Whether a progressively read EEPROM image already holds its category terminator.
pub(crate) fn sii_image_complete(image: &[u8]) -> bool {
    let mut cursor = usize::from(crate::sii::word::FIRST_CATEGORY) * 2;

    loop {
        let Some(category) = image
            .get(cursor..cursor + 2)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u16::from_le_bytes)
        else {
            return false;
        };

        if category == 0xffff {
            return true;
        }

        let Some(size_words) = image
            .get(cursor + 2..cursor + 4)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u16::from_le_bytes)
        else {
            return false;
        };

        cursor += 4 + usize::from(size_words) * 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::test_support::{EmulatedBus, EmulatedSlave};
    use pretty_assertions::assert_eq;

    fn fast_timeouts() -> Timeouts {
        Timeouts {
            poll_interval: Duration::ZERO,
            state_transition: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn demo_bus(count: usize) -> (Bus, EmulatedBus) {
        let emulated = EmulatedBus::new((0..count).map(|_| EmulatedSlave::demo()).collect());

        let link = Link::new(Box::new(emulated.socket()));

        let bus = Bus::new(
            link,
            Rc::new(SystemClock::default()),
            fast_timeouts(),
            BusConfig::default(),
        );

        (bus, emulated)
    }

    #[test]
    fn init_discovers_addresses_and_reaches_preop() {
        let (mut bus, _emulated) = demo_bus(2);

        bus.init().unwrap();

        assert_eq!(bus.slaves().len(), 2);
        assert_eq!(bus.slaves()[0].configured_address, 1001);
        assert_eq!(bus.slaves()[1].configured_address, 1002);

        for slave in bus.slaves() {
            assert_eq!(slave.al_state, AlState::PreOp);
            assert_eq!(slave.name(), Some("demo io device"));
            assert!(slave.mailbox.is_some());
            assert_eq!(slave.count_open_ports(), 2);

            let info = slave.sii.as_ref().unwrap();

            assert_eq!(info.serial, 0x7856_3412);
        }
    }

    #[test]
    fn init_with_empty_chain() {
        let (mut bus, _emulated) = demo_bus(0);

        bus.init().unwrap();

        assert!(bus.slaves().is_empty());
    }

    #[test]
    fn sdo_read_over_the_wire() {
        let (mut bus, _emulated) = demo_bus(1);

        bus.init().unwrap();

        let serial = bus
            .read_sdo(0, 0x1018, 4, SdoAccess::Partial, 16)
            .unwrap();

        assert_eq!(serial, vec![0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn sdo_write_then_read_back() {
        let (mut bus, _emulated) = demo_bus(1);

        bus.init().unwrap();

        bus.write_sdo(0, 0x7100, 1, false, &[0xca, 0xfe]).unwrap();

        let value = bus
            .read_sdo(0, 0x7100, 1, SdoAccess::Partial, 16)
            .unwrap();

        assert_eq!(value, vec![0xca, 0xfe]);
    }

    #[test]
    fn complete_access_emulation_walks_subindices() {
        let (mut bus, _emulated) = demo_bus(1);

        bus.init().unwrap();

        let record = bus
            .read_sdo(0, 0x5000, 1, SdoAccess::EmulateComplete, 64)
            .unwrap();

        // Subindex 0 counts two entries; their concatenation follows.
        assert_eq!(record, vec![0x11, 0x22, 0x33]);
    }

    #[test]
    fn foe_file_fetch_through_bus() {
        let (mut bus, _emulated) = demo_bus(1);

        bus.init().unwrap();

        let file = bus.read_file(0, "boot.bin", 0).unwrap();

        assert_eq!(file, (0u8..=255).cycle().take(300).collect::<Vec<_>>());
    }

    #[test]
    fn mapping_then_cyclic_exchange() {
        let (mut bus, emulated) = demo_bus(2);

        bus.init().unwrap();

        let mut iomap = [0u8; 64];

        bus.create_mapping(&mut iomap).unwrap();

        // Two devices, each 2 bytes in and 2 bytes out: inputs first.
        assert_eq!(bus.slaves()[0].inputs, crate::slave::PdiSegment { offset: 0, len: 2 });
        assert_eq!(bus.slaves()[1].inputs, crate::slave::PdiSegment { offset: 2, len: 2 });
        assert_eq!(bus.slaves()[0].outputs, crate::slave::PdiSegment { offset: 4, len: 2 });
        assert_eq!(bus.slaves()[1].outputs, crate::slave::PdiSegment { offset: 6, len: 2 });

        // Plant input process data in each device's SM3 area.
        emulated.with_slave(0, |slave| {
            slave.memory[0x1180..0x1182].copy_from_slice(&[0x11, 0x22]);
        });
        emulated.with_slave(1, |slave| {
            slave.memory[0x1180..0x1182].copy_from_slice(&[0x33, 0x44]);
        });

        iomap[4..8].copy_from_slice(&[0xa1, 0xa2, 0xa3, 0xa4]);

        let mut errors = Vec::new();

        bus.process_data_exchange(&mut iomap, |state| errors.push(state))
            .unwrap();

        assert!(errors.is_empty());
        assert_eq!(&iomap[0..4], &[0x11, 0x22, 0x33, 0x44]);

        // Outputs landed in each device's SM2 area.
        emulated.with_slave(0, |slave| {
            assert_eq!(&slave.memory[0x1100..0x1102], &[0xa1, 0xa2]);
        });
        emulated.with_slave(1, |slave| {
            assert_eq!(&slave.memory[0x1100..0x1102], &[0xa3, 0xa4]);
        });
    }

    #[test]
    fn separate_cyclic_read_and_write() {
        let (mut bus, emulated) = demo_bus(1);

        bus.init().unwrap();

        let mut iomap = [0u8; 16];

        bus.create_mapping(&mut iomap).unwrap();

        emulated.with_slave(0, |slave| {
            slave.memory[0x1180..0x1182].copy_from_slice(&[0x55, 0x66]);
        });

        iomap[2..4].copy_from_slice(&[0x77, 0x88]);

        bus.process_data_read(&mut iomap, |_| {}).unwrap();
        bus.process_data_write(&iomap, |_| {}).unwrap();

        assert_eq!(&iomap[0..2], &[0x55, 0x66]);

        emulated.with_slave(0, |slave| {
            assert_eq!(&slave.memory[0x1100..0x1102], &[0x77, 0x88]);
        });
    }

    #[test]
    fn mapping_refuses_short_iomap() {
        let (mut bus, _emulated) = demo_bus(2);

        bus.init().unwrap();

        let mut iomap = [0u8; 4];

        assert_eq!(
            bus.create_mapping(&mut iomap),
            Err(Error::Config(ConfigError::PdiTooLong {
                available: 4,
                needed: 8,
            }))
        );
    }

    #[test]
    fn refused_transition_surfaces_status_code() {
        let (mut bus, emulated) = demo_bus(2);

        bus.init().unwrap();

        emulated.with_slave(1, |slave| {
            slave.refuse_state = Some(0x04);
            slave.refuse_code = 0x001d;
        });

        bus.request_state(AlState::SafeOp).unwrap();

        let result = bus.wait_for_state(AlState::SafeOp, Duration::from_millis(50), None);

        assert_eq!(
            result,
            Err(Error::AlStatus(AlStatusCode::InvalidOutputConfiguration))
        );

        // The compliant device reached SAFE-OP; the refusing one stayed behind.
        assert_eq!(bus.slaves()[0].al_state, AlState::SafeOp);
        assert_eq!(bus.slaves()[1].al_state, AlState::PreOp);
    }

    #[test]
    fn error_acknowledge_reenables_transitions() {
        let (mut bus, emulated) = demo_bus(1);

        bus.init().unwrap();

        emulated.with_slave(0, |slave| {
            slave.refuse_state = Some(0x04);
            slave.refuse_code = 0x001d;
        });

        bus.request_state(AlState::SafeOp).unwrap();

        assert!(bus
            .wait_for_state(AlState::SafeOp, Duration::from_millis(20), None)
            .is_err());

        // While the flag is raised the device ignores further state requests.
        bus.request_state(AlState::SafeOp).unwrap();

        assert!(bus
            .wait_for_state(AlState::SafeOp, Duration::from_millis(20), None)
            .is_err());

        // The acknowledge goes out as the current state with bit 4 clear; only that write
        // unsticks the device.
        assert_eq!(
            AlControl::acknowledge(AlState::PreOp).as_bytes(),
            [0x02, 0x00]
        );

        bus.ack_errors().unwrap();
        bus.request_state(AlState::SafeOp).unwrap();
        bus.wait_for_state(AlState::SafeOp, Duration::from_millis(50), None)
            .unwrap();

        assert_eq!(bus.slaves()[0].al_state, AlState::SafeOp);
    }

    #[test]
    fn state_poll_callback_fires() {
        let (mut bus, emulated) = demo_bus(1);

        bus.init().unwrap();

        // Refuse OP with no status code: the wait keeps polling until its deadline and the
        // callback runs on every round.
        emulated.with_slave(0, |slave| {
            slave.refuse_state = Some(0x08);
        });

        let mut polls = 0u32;

        bus.request_state(AlState::Op).unwrap();

        let result = bus.wait_for_state(
            AlState::Op,
            Duration::from_millis(20),
            Some(&mut || polls += 1),
        );

        assert_eq!(result, Err(Error::Timeout));
        assert!(polls > 0);
    }

    #[test]
    fn topology_of_discovered_chain() {
        let (mut bus, _emulated) = demo_bus(3);

        bus.init().unwrap();

        let topology = crate::diagnostics::get_topology(bus.slaves()).unwrap();

        assert_eq!(topology.get(&1001), Some(&1001));
        assert_eq!(topology.get(&1002), Some(&1001));
        assert_eq!(topology.get(&1003), Some(&1002));
    }

    #[test]
    fn partial_sii_image_detection() {
        let image = crate::test_support::SiiImageBuilder::demo_io_device().build();

        assert!(sii_image_complete(&image));
        assert!(!sii_image_complete(&image[..image.len() - 2]));
        assert!(!sii_image_complete(&image[..0x80]));
        assert!(!sii_image_complete(&[]));
    }
}
