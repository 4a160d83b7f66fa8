//! Test doubles shared by the unit tests: a scripted socket standing in for the wire.

use crate::error::Error;
use crate::frame::parse_datagrams;
use crate::pdu::DATAGRAM_HEADER_LEN;
use crate::socket::RawSocket;
use core::time::Duration;
use std::collections::VecDeque;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>>>;

/// A socket whose reads replay queued frames, optionally computed from the frames written.
pub(crate) struct ScriptedSocket {
    responder: Option<Responder>,
    queue: VecDeque<Vec<u8>>,
}

impl ScriptedSocket {
    /// Never answers; every read times out.
    pub fn silent() -> Self {
        Self {
            responder: None,
            queue: VecDeque::new(),
        }
    }

    /// Answers every written frame with the frames the closure produces.
    pub fn answering(responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + 'static) -> Self {
        Self {
            responder: Some(Box::new(responder)),
            queue: VecDeque::new(),
        }
    }
}

impl RawSocket for ScriptedSocket {
    fn open(&mut self, _interface: &str) -> Result<(), Error> {
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    fn close(&mut self) {}

    fn read(&mut self, frame: &mut [u8]) -> Result<usize, Error> {
        match self.queue.pop_front() {
            Some(bytes) => {
                frame[..bytes.len()].copy_from_slice(&bytes);

                Ok(bytes.len())
            }
            None => Err(Error::Timeout),
        }
    }

    fn write(&mut self, frame: &[u8]) -> Result<usize, Error> {
        if let Some(responder) = self.responder.as_mut() {
            let responses = responder(frame);

            self.queue.extend(responses);
        }

        Ok(frame.len())
    }
}

/// Copy a sent frame, stamp every datagram with the given working counter and flag it as
/// circulated, the way a frame returns after a full round trip.
pub(crate) fn respond_with_wkc(frame: &[u8], wkc: u16) -> Vec<u8> {
    let mut out = frame.to_vec();

    let datagrams: Vec<_> = parse_datagrams(frame).unwrap().collect();

    for datagram in datagrams {
        let wkc_at = datagram.payload_start + datagram.payload_len;

        out[wkc_at..wkc_at + 2].copy_from_slice(&wkc.to_le_bytes());

        // Circulating bit: bit 14 of the flags word at header offset 6.
        out[datagram.payload_start - DATAGRAM_HEADER_LEN + 7] |= 0x40;
    }

    out
}

/// Overwrite the data area of the `nth` datagram of a response frame.
pub(crate) fn set_datagram_payload(frame: &mut [u8], nth: usize, data: &[u8]) {
    let datagrams: Vec<_> = parse_datagrams(frame).unwrap().collect();
    let datagram = datagrams[nth];

    assert!(data.len() <= datagram.payload_len);

    frame[datagram.payload_start..datagram.payload_start + data.len()].copy_from_slice(data);
}

use crate::command::{extract_address, Command};
use crate::fmmu::Fmmu;
use crate::mailbox::response::{MemoryFileStore, ResponseMailbox, SimpleDictionary};
use crate::mailbox::MailboxConfig;
use crate::pdu::WKC_LEN;
use crate::register::RegisterAddress;
use crate::PduRead;
use std::cell::RefCell;
use std::rc::Rc;

/// Builds SII/EEPROM images for tests and device emulation.
pub(crate) struct SiiImageBuilder {
    alias: u16,
    vendor_id: u32,
    product_code: u32,
    revision: u32,
    serial: u32,
    mailbox: Option<MailboxConfig>,
    mailbox_protocols: u16,
    categories: Vec<(u16, Vec<u8>)>,
}

impl SiiImageBuilder {
    /// A two-byte-in/two-byte-out mailbox-capable device used across the test suite.
    pub fn demo_io_device() -> Self {
        let mut builder = Self {
            alias: 0,
            vendor_id: 0x0000_0999,
            product_code: 0x0000_2025,
            revision: 1,
            serial: 0x7856_3412,
            mailbox: Some(MailboxConfig {
                recv_offset: 0x1000,
                recv_size: 128,
                send_offset: 0x1080,
                send_size: 128,
            }),
            // CoE | FoE | EoE
            mailbox_protocols: 0x000e,
            categories: Vec::new(),
        };

        // Strings: index 1 is the device name.
        let mut strings = vec![1u8];

        let name = b"demo io device";

        strings.push(name.len() as u8);
        strings.extend_from_slice(name);

        builder.categories.push((10, strings));

        // General: name string 1, SDO + PDO assignment via CoE, FoE and EoE on.
        let general = vec![0u8, 0, 0, 1, 0, 0x05, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

        builder.categories.push((30, general));

        // Sync managers: mailbox pair then one process data channel per direction.
        let mut sync_managers = Vec::new();

        for (start, len, control, usage) in [
            (0x1000u16, 128u16, 0x26u8, 1u8),
            (0x1080, 128, 0x22, 2),
            (0x1100, 0, 0x24, 3),
            (0x1180, 0, 0x20, 4),
        ] {
            sync_managers.extend_from_slice(&start.to_le_bytes());
            sync_managers.extend_from_slice(&len.to_le_bytes());
            sync_managers.push(control);
            sync_managers.push(0);
            sync_managers.push(1);
            sync_managers.push(usage);
        }

        builder.categories.push((41, sync_managers));

        // One 16 bit RxPDO (outputs) on SM2 and one 16 bit TxPDO (inputs) on SM3.
        builder
            .categories
            .push((51, Self::pdo(0x1600, 2, &[(0x7000, 1, 16)])));
        builder
            .categories
            .push((50, Self::pdo(0x1a00, 3, &[(0x6000, 1, 16)])));

        builder
    }

    fn pdo(index: u16, sync_manager: u8, entries: &[(u16, u8, u8)]) -> Vec<u8> {
        let mut body = Vec::new();

        body.extend_from_slice(&index.to_le_bytes());
        body.push(entries.len() as u8);
        body.push(sync_manager);
        body.push(0);
        body.push(0);
        body.extend_from_slice(&[0, 0]);

        for (entry_index, subindex, bit_len) in entries {
            body.extend_from_slice(&entry_index.to_le_bytes());
            body.push(*subindex);
            body.push(0);
            body.push(0x06);
            body.push(*bit_len);
            body.extend_from_slice(&[0, 0]);
        }

        body
    }

    pub fn with_unknown_category(mut self, category: u16, body: &[u8]) -> Self {
        // Unknown categories must be skipped by their declared length, so splice one in front.
        self.categories.insert(0, (category, body.to_vec()));

        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut image = vec![0u8; 0x80];

        let mut put_word = |image: &mut Vec<u8>, word: u16, value: u16| {
            let at = usize::from(word) * 2;

            image[at..at + 2].copy_from_slice(&value.to_le_bytes());
        };

        put_word(&mut image, 0x0004, self.alias);
        put_word(&mut image, 0x0008, self.vendor_id as u16);
        put_word(&mut image, 0x0009, (self.vendor_id >> 16) as u16);
        put_word(&mut image, 0x000a, self.product_code as u16);
        put_word(&mut image, 0x000b, (self.product_code >> 16) as u16);
        put_word(&mut image, 0x000c, self.revision as u16);
        put_word(&mut image, 0x000d, (self.revision >> 16) as u16);
        put_word(&mut image, 0x000e, self.serial as u16);
        put_word(&mut image, 0x000f, (self.serial >> 16) as u16);

        if let Some(mailbox) = self.mailbox {
            put_word(&mut image, 0x0018, mailbox.recv_offset);
            put_word(&mut image, 0x0019, mailbox.recv_size);
            put_word(&mut image, 0x001a, mailbox.send_offset);
            put_word(&mut image, 0x001b, mailbox.send_size);
            put_word(&mut image, 0x001c, self.mailbox_protocols);
        }

        for (category, mut body) in self.categories {
            if body.len() % 2 != 0 {
                body.push(0);
            }

            image.extend_from_slice(&category.to_le_bytes());
            image.extend_from_slice(&((body.len() / 2) as u16).to_le_bytes());
            image.extend_from_slice(&body);
        }

        image.extend_from_slice(&0xffffu16.to_le_bytes());

        image
    }
}

const EMULATED_MEMORY: usize = 0x2000;

/// One emulated device: a register file, an EEPROM and a response mailbox.
pub(crate) struct EmulatedSlave {
    pub memory: Vec<u8>,
    pub eeprom: Vec<u8>,
    pub response: ResponseMailbox,
    mailbox_config: MailboxConfig,
    outgoing: Option<Vec<u8>>,
    /// Refuse transitions into this AL state with the paired status code.
    pub refuse_state: Option<u8>,
    pub refuse_code: u16,
}

impl EmulatedSlave {
    pub fn new(
        eeprom: Vec<u8>,
        mailbox_config: MailboxConfig,
        dictionary: SimpleDictionary,
        files: MemoryFileStore,
    ) -> Self {
        let mut memory = vec![0u8; EMULATED_MEMORY];

        memory[usize::from(RegisterAddress::Type as u16)] = 0x04;
        memory[0x0110..0x0112]
            .copy_from_slice(&crate::dl_status::DlStatus::with_open_ports(2).pack());

        Self {
            memory,
            eeprom,
            response: ResponseMailbox::new(
                mailbox_config,
                Box::new(dictionary),
                Box::new(files),
            ),
            mailbox_config,
            outgoing: None,
            refuse_state: None,
            refuse_code: 0,
        }
    }

    /// A device matching [`SiiImageBuilder::demo_io_device`], with a small dictionary covering
    /// identity, PDO assignment and complete-access objects, plus one FoE file.
    pub fn demo() -> Self {
        let mut dictionary = SimpleDictionary::default();

        // Identity: serial number.
        dictionary.insert(0x1018, 4, &[0x12, 0x34, 0x56, 0x78]);

        // PDO assignments mirroring the SII.
        dictionary.insert(0x1c12, 0, &[1]);
        dictionary.insert(0x1c12, 1, &0x1600u16.to_le_bytes());
        dictionary.insert(0x1c13, 0, &[1]);
        dictionary.insert(0x1c13, 1, &0x1a00u16.to_le_bytes());

        // A three-entry record for complete-access tests.
        dictionary.insert(0x5000, 0, &[2]);
        dictionary.insert(0x5000, 1, &[0x11]);
        dictionary.insert(0x5000, 2, &[0x22, 0x33]);

        let mut files = MemoryFileStore::default();

        files.insert("boot.bin", &(0u8..=255).cycle().take(300).collect::<Vec<_>>());

        Self::new(
            SiiImageBuilder::demo_io_device().build(),
            MailboxConfig {
                recv_offset: 0x1000,
                recv_size: 128,
                send_offset: 0x1080,
                send_size: 128,
            },
            dictionary,
            files,
        )
    }

    fn station_address(&self) -> u16 {
        u16::from_le_bytes([self.memory[0x0010], self.memory[0x0011]])
    }

    fn read(&mut self, ado: u16, buf: &mut [u8]) {
        let at = usize::from(ado);

        // Send mailbox status: full bit reflects a queued response.
        if ado == RegisterAddress::sync_manager_status(1) {
            buf[0] = if self.outgoing.is_some() { 0x08 } else { 0x00 };

            return;
        }

        // Reading the send mailbox consumes the queued response.
        if ado == self.mailbox_config.send_offset {
            if let Some(response) = self.outgoing.take() {
                let len = response.len().min(buf.len());

                buf[..len].copy_from_slice(&response[..len]);

                return;
            }
        }

        for (offset, byte) in buf.iter_mut().enumerate() {
            *byte = self.memory.get(at + offset).copied().unwrap_or(0);
        }
    }

    fn write(&mut self, ado: u16, data: &[u8]) {
        let at = usize::from(ado);

        if at + data.len() <= self.memory.len() {
            self.memory[at..at + data.len()].copy_from_slice(data);
        }

        if ado == RegisterAddress::AlControl as u16 && !data.is_empty() {
            self.handle_al_control(data[0]);
        }

        if ado == RegisterAddress::SiiControl as u16 && data.len() >= 4 {
            self.handle_eeprom_command(data);
        }

        if ado == self.mailbox_config.recv_offset
            && data.len() == usize::from(self.mailbox_config.recv_size)
        {
            self.response.receive(data);

            if let Some(response) = self.response.send() {
                self.outgoing = Some(response);
            }
        }
    }

    fn handle_al_control(&mut self, control: u8) {
        let requested = control & 0x0f;
        let bit4 = control & 0x10 != 0;
        let current = self.memory[0x0130] & 0x0f;
        let in_error = self.memory[0x0130] & 0x10 != 0;

        // A raised error flag blocks every transition until the master acknowledges it by
        // writing the current state back with bit 4 clear.
        if in_error {
            if !bit4 && requested == current {
                self.memory[0x0130] = current;
                self.memory[0x0134..0x0136].fill(0);
                self.refuse_state = None;
            }

            return;
        }

        if self.refuse_state == Some(requested) {
            self.memory[0x0130] = current | 0x10;
            self.memory[0x0134..0x0136].copy_from_slice(&self.refuse_code.to_le_bytes());

            return;
        }

        self.memory[0x0130] = requested;
        self.memory[0x0134..0x0136].fill(0);

        if requested == 0x01 {
            self.response.reset();
            self.outgoing = None;
        }
    }

    fn handle_eeprom_command(&mut self, data: &[u8]) {
        // Read command bit sits in the high byte of the control word.
        if data[1] & 0x01 == 0 {
            return;
        }

        let word = u16::from_le_bytes([data[2], data[3]]);
        let start = usize::from(word) * 2;

        for offset in 0..4 {
            self.memory[0x0508 + offset] =
                self.eeprom.get(start + offset).copied().unwrap_or(0xff);
        }
    }
}

/// A chain of emulated devices answering every frame a link sends.
pub(crate) struct EmulatedBus {
    slaves: Rc<RefCell<Vec<EmulatedSlave>>>,
}

impl EmulatedBus {
    pub fn new(slaves: Vec<EmulatedSlave>) -> Self {
        Self {
            slaves: Rc::new(RefCell::new(slaves)),
        }
    }

    pub fn with_slave<R>(&self, index: usize, f: impl FnOnce(&mut EmulatedSlave) -> R) -> R {
        f(&mut self.slaves.borrow_mut()[index])
    }

    pub fn socket(&self) -> ScriptedSocket {
        let slaves = self.slaves.clone();

        ScriptedSocket::answering(move |frame| {
            vec![Self::respond(&mut slaves.borrow_mut(), frame)]
        })
    }

    fn respond(slaves: &mut [EmulatedSlave], frame: &[u8]) -> Vec<u8> {
        let mut out = frame.to_vec();

        let datagrams: Vec<_> = parse_datagrams(frame).unwrap().collect();

        for datagram in datagrams {
            let payload = datagram.payload_start..datagram.payload_start + datagram.payload_len;
            let (adp, ado) = extract_address(datagram.header.address);
            let mut wkc = 0u16;

            match datagram.header.command {
                Command::Brd => {
                    for slave in slaves.iter_mut() {
                        let mut tmp = vec![0u8; datagram.payload_len];

                        slave.read(ado, &mut tmp);

                        for (byte, value) in out[payload.clone()].iter_mut().zip(tmp) {
                            *byte |= value;
                        }

                        wkc += 1;
                    }
                }
                Command::Bwr => {
                    for slave in slaves.iter_mut() {
                        slave.write(ado, &frame[payload.clone()]);

                        wkc += 1;
                    }
                }
                Command::Aprd => {
                    let position = adp.wrapping_neg();

                    if let Some(slave) = slaves.get_mut(usize::from(position)) {
                        let range = payload.clone();

                        slave.read(ado, &mut out[range]);

                        wkc += 1;
                    }
                }
                Command::Apwr => {
                    let position = adp.wrapping_neg();

                    if let Some(slave) = slaves.get_mut(usize::from(position)) {
                        slave.write(ado, &frame[payload.clone()]);

                        wkc += 1;
                    }
                }
                Command::Fprd => {
                    for slave in slaves.iter_mut() {
                        if slave.station_address() == adp {
                            let range = payload.clone();

                            slave.read(ado, &mut out[range]);

                            wkc += 1;
                        }
                    }
                }
                Command::Fpwr => {
                    for slave in slaves.iter_mut() {
                        if slave.station_address() == adp {
                            slave.write(ado, &frame[payload.clone()]);

                            wkc += 1;
                        }
                    }
                }
                Command::Lrd | Command::Lwr | Command::Lrw => {
                    let logical = datagram.header.address;

                    for slave in slaves.iter_mut() {
                        wkc += Self::apply_logical(
                            slave,
                            datagram.header.command,
                            logical,
                            frame,
                            &mut out,
                            &payload,
                        );
                    }
                }
                _ => {}
            }

            let wkc_at = datagram.payload_start + datagram.payload_len;

            out[wkc_at..wkc_at + WKC_LEN].copy_from_slice(&wkc.to_le_bytes());

            // Circulating bit.
            out[datagram.payload_start - 10 + 7] |= 0x40;
        }

        out
    }

    /// Run one logical command against a device's programmed FMMUs. Returns the working counter
    /// contribution: 1 per serviced direction, writes counting double on read/writes.
    fn apply_logical(
        slave: &mut EmulatedSlave,
        command: Command,
        logical_start: u32,
        frame: &[u8],
        out: &mut [u8],
        payload: &std::ops::Range<usize>,
    ) -> u16 {
        let mut wkc = 0u16;

        for fmmu_index in 0..16u8 {
            let at = usize::from(RegisterAddress::fmmu(fmmu_index));

            let Ok(fmmu) = Fmmu::try_from_slice(&slave.memory[at..at + 16]) else {
                continue;
            };

            if !fmmu.enable || fmmu.length_bytes == 0 {
                continue;
            }

            let window = fmmu.logical_start_address;
            let len = usize::from(fmmu.length_bytes);

            if window < logical_start
                || (window - logical_start) as usize + len > payload.len()
            {
                continue;
            }

            let in_datagram = payload.start + (window - logical_start) as usize;
            let physical = usize::from(fmmu.physical_start_address);

            if fmmu.read_enable && command != Command::Lwr {
                out[in_datagram..in_datagram + len]
                    .copy_from_slice(&slave.memory[physical..physical + len]);

                wkc += 1;
            }

            if fmmu.write_enable && command != Command::Lrd {
                slave.memory[physical..physical + len]
                    .copy_from_slice(&frame[in_datagram..in_datagram + len]);

                wkc += if command == Command::Lrw { 2 } else { 1 };
            }
        }

        wkc
    }
}
