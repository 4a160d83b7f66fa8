//! Device side of the mailbox, as used by a slave stack and by tests as an emulated device.
//!
//! Bytes written into sync manager 0 are parsed as requests; responses are queued for sync
//! manager 1. CoE SDO dialogs are answered from an [`ObjectDictionary`], expedited for values of
//! up to 4 bytes and in canonical 7 byte segments beyond that. FoE is delegated to a
//! [`FileStore`]; EoE keeps the device's IP configuration.

use super::{MailboxConfig, MailboxHeader, MailboxType, Priority, MAILBOX_HEADER_LEN};
use crate::coe::{
    self, CoeAbortCode, CoeHeader, CoeService, InitSdoFlags, InitSdoHeader, SegmentSdoHeader,
};
use crate::eoe::{self, EoeHeader, IpParam};
use crate::foe::{self, FoeHeader, FOE_HEADER_LEN};
use std::collections::{BTreeMap, VecDeque};

/// Segment data bytes per segmented SDO round.
const SEGMENT_CHUNK: usize = 7;

/// The device's CoE object dictionary.
pub trait ObjectDictionary {
    fn read(
        &mut self,
        index: u16,
        subindex: u8,
        complete_access: bool,
    ) -> Result<Vec<u8>, CoeAbortCode>;

    fn write(
        &mut self,
        index: u16,
        subindex: u8,
        complete_access: bool,
        data: &[u8],
    ) -> Result<(), CoeAbortCode>;
}

/// The device's FoE backing store. Errors are FoE result codes.
pub trait FileStore {
    fn read_file(&mut self, name: &str, password: u32) -> Result<Vec<u8>, u16>;

    fn write_file(&mut self, name: &str, password: u32, data: &[u8]) -> Result<(), u16>;
}

/// Dictionary over a plain map, sufficient for slave stacks with static objects.
///
/// Complete access concatenates the subindices of an object in ascending order.
#[derive(Debug, Default)]
pub struct SimpleDictionary {
    entries: BTreeMap<(u16, u8), Vec<u8>>,
}

impl SimpleDictionary {
    pub fn insert(&mut self, index: u16, subindex: u8, value: &[u8]) {
        self.entries.insert((index, subindex), value.to_vec());
    }
}

impl ObjectDictionary for SimpleDictionary {
    fn read(
        &mut self,
        index: u16,
        subindex: u8,
        complete_access: bool,
    ) -> Result<Vec<u8>, CoeAbortCode> {
        if complete_access {
            let mut out = Vec::new();

            for ((_, sub), value) in self.entries.range((index, subindex)..=(index, u8::MAX)) {
                debug_assert!(*sub >= subindex);

                out.extend_from_slice(value);
            }

            if out.is_empty() {
                return Err(CoeAbortCode::NotFound);
            }

            return Ok(out);
        }

        self.entries
            .get(&(index, subindex))
            .cloned()
            .ok_or(if self.entries.range((index, 0)..=(index, u8::MAX)).next().is_some() {
                CoeAbortCode::SubIndexNotFound
            } else {
                CoeAbortCode::NotFound
            })
    }

    fn write(
        &mut self,
        index: u16,
        subindex: u8,
        _complete_access: bool,
        data: &[u8],
    ) -> Result<(), CoeAbortCode> {
        self.entries.insert((index, subindex), data.to_vec());

        Ok(())
    }
}

/// In-memory FoE store.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryFileStore {
    pub fn insert(&mut self, name: &str, data: &[u8]) {
        self.files.insert(name.to_string(), data.to_vec());
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(|data| data.as_slice())
    }
}

impl FileStore for MemoryFileStore {
    fn read_file(&mut self, name: &str, _password: u32) -> Result<Vec<u8>, u16> {
        self.files
            .get(name)
            .cloned()
            .ok_or(foe::result::NOT_FOUND)
    }

    fn write_file(&mut self, name: &str, _password: u32, data: &[u8]) -> Result<(), u16> {
        self.files.insert(name.to_string(), data.to_vec());

        Ok(())
    }
}

struct SegmentedUpload {
    data: Vec<u8>,
    cursor: usize,
    toggle: bool,
}

struct SegmentedDownload {
    index: u16,
    subindex: u8,
    complete_access: bool,
    data: Vec<u8>,
    toggle: bool,
}

struct FoeReadState {
    data: Vec<u8>,
    cursor: usize,
    packet: u32,
    /// A chunk strictly shorter than the mailbox capacity went out; the next ACK closes the
    /// transfer.
    closed: bool,
}

struct FoeWriteState {
    name: String,
    password: u32,
    data: Vec<u8>,
    expected_packet: u32,
}

/// Device side mailbox.
pub struct ResponseMailbox {
    pub config: MailboxConfig,
    dictionary: Box<dyn ObjectDictionary>,
    files: Box<dyn FileStore>,
    out: VecDeque<Vec<u8>>,
    /// Counter of the most recently accepted request. A repeated counter is a retransmission
    /// and elicits the previous response again.
    last_counter: u8,
    last_response: Option<Vec<u8>>,
    upload: Option<SegmentedUpload>,
    download: Option<SegmentedDownload>,
    foe_read: Option<FoeReadState>,
    foe_write: Option<FoeWriteState>,
    ip: IpParam,
}

impl ResponseMailbox {
    pub fn new(
        config: MailboxConfig,
        dictionary: Box<dyn ObjectDictionary>,
        files: Box<dyn FileStore>,
    ) -> Self {
        Self {
            config,
            dictionary,
            files,
            out: VecDeque::new(),
            last_counter: 0,
            last_response: None,
            upload: None,
            download: None,
            foe_read: None,
            foe_write: None,
            ip: IpParam::default(),
        }
    }

    /// Drop all dialog state, as on a transition back to INIT. The counter sequence restarts.
    pub fn reset(&mut self) {
        self.out.clear();
        self.last_counter = 0;
        self.last_response = None;
        self.upload = None;
        self.download = None;
        self.foe_read = None;
        self.foe_write = None;
    }

    /// The device's current EoE IP configuration.
    pub fn ip_param(&self) -> &IpParam {
        &self.ip
    }

    /// Next queued response, to be placed into sync manager 1.
    pub fn send(&mut self) -> Option<Vec<u8>> {
        self.out.pop_front()
    }

    /// Process one request read from sync manager 0.
    pub fn receive(&mut self, raw: &[u8]) {
        let Ok(header) = MailboxHeader::unpack_from_slice(raw) else {
            log::warn!("dropping malformed mailbox request");

            return;
        };

        let length = usize::from(header.length);

        let Some(payload) = raw.get(MAILBOX_HEADER_LEN..MAILBOX_HEADER_LEN + length) else {
            log::warn!("dropping truncated mailbox request");

            return;
        };

        // A repeated counter is the master retransmitting; answer with the previous response.
        if header.counter != 0 && header.counter == self.last_counter {
            if let Some(response) = self.last_response.clone() {
                self.out.push_back(response);
            }

            return;
        }

        self.last_counter = header.counter;

        let response = match header.mailbox_type {
            MailboxType::Coe => self.handle_coe(payload),
            MailboxType::Foe => self.handle_foe(payload),
            MailboxType::Eoe => self.handle_eoe(payload),
            other => {
                log::warn!("unsupported mailbox protocol {:?}", other);

                Some((MailboxType::Err, error_reply(0x0001)))
            }
        };

        if let Some((mailbox_type, payload)) = response {
            let framed = frame(mailbox_type, header.counter, payload);

            self.last_response = Some(framed.clone());
            self.out.push_back(framed);
        }
    }

    fn handle_coe(&mut self, payload: &[u8]) -> Option<(MailboxType, Vec<u8>)> {
        let coe = CoeHeader::unpack_from_slice(payload).ok()?;

        if coe.service != CoeService::SdoRequest {
            return Some((MailboxType::Err, error_reply(0x0002)));
        }

        let sdo = &payload[CoeHeader::LEN..];
        let first = *sdo.first()?;
        let command = InitSdoFlags::unpack(first).command;

        let response = match command {
            coe::request::UPLOAD => self.sdo_upload(sdo),
            coe::request::UPLOAD_SEGMENT => self.sdo_upload_segment(first),
            coe::request::DOWNLOAD => self.sdo_download(sdo),
            coe::request::DOWNLOAD_SEGMENT => self.sdo_download_segment(sdo),
            coe::request::ABORT => {
                // The master gave up; drop any transfer in progress silently.
                self.upload = None;
                self.download = None;

                return None;
            }
            _ => abort_response(0, 0, CoeAbortCode::InvalidCommand),
        };

        Some((MailboxType::Coe, response))
    }

    fn sdo_upload(&mut self, sdo: &[u8]) -> Vec<u8> {
        let Ok(header) = InitSdoHeader::unpack_from_slice(sdo) else {
            return abort_response(0, 0, CoeAbortCode::InvalidCommand);
        };

        let index = header.index;
        let subindex = header.sub_index;

        let value = match self
            .dictionary
            .read(index, subindex, header.flags.complete_access)
        {
            Ok(value) => value,
            Err(code) => return abort_response(index, subindex, code),
        };

        if value.len() <= 4 {
            let mut data = [0u8; 4];

            data[..value.len()].copy_from_slice(&value);

            return sdo_response(
                InitSdoFlags {
                    size_indicator: true,
                    expedited_transfer: true,
                    size: (4 - value.len()) as u8,
                    complete_access: header.flags.complete_access,
                    command: coe::response::UPLOAD,
                },
                index,
                subindex,
                &data,
            );
        }

        // Larger values go out segmented: the init response announces the size, the segments
        // carry the bytes.
        let total = value.len() as u32;

        self.upload = Some(SegmentedUpload {
            data: value,
            cursor: 0,
            toggle: false,
        });

        sdo_response(
            InitSdoFlags {
                size_indicator: true,
                expedited_transfer: false,
                size: 0,
                complete_access: header.flags.complete_access,
                command: coe::response::UPLOAD,
            },
            index,
            subindex,
            &total.to_le_bytes(),
        )
    }

    fn sdo_upload_segment(&mut self, first: u8) -> Vec<u8> {
        let request = SegmentSdoHeader::unpack(first);

        let Some(upload) = self.upload.as_mut() else {
            return abort_response(0, 0, CoeAbortCode::InvalidCommand);
        };

        if request.toggle != upload.toggle {
            self.upload = None;

            return abort_response(0, 0, CoeAbortCode::ToggleBit);
        }

        let remaining = upload.data.len() - upload.cursor;
        let size = remaining.min(SEGMENT_CHUNK);
        let chunk = upload.data[upload.cursor..upload.cursor + size].to_vec();
        let last = size == remaining;
        let toggle = upload.toggle;

        upload.cursor += size;
        upload.toggle = !upload.toggle;

        if last {
            self.upload = None;
        }

        let mut out = CoeHeader::new(CoeService::SdoResponse).pack().to_vec();

        out.push(
            SegmentSdoHeader {
                is_last_segment: last,
                segment_data_size: size as u8,
                toggle,
                command: coe::response::UPLOAD_SEGMENT,
            }
            .pack(),
        );

        out.extend_from_slice(&chunk);
        out.resize(CoeHeader::LEN + SegmentSdoHeader::LEN + SEGMENT_CHUNK.max(size), 0);

        out
    }

    fn sdo_download(&mut self, sdo: &[u8]) -> Vec<u8> {
        let Ok(header) = InitSdoHeader::unpack_from_slice(sdo) else {
            return abort_response(0, 0, CoeAbortCode::InvalidCommand);
        };

        let index = header.index;
        let subindex = header.sub_index;
        let body = &sdo[InitSdoHeader::LEN..];

        if header.flags.expedited_transfer {
            let size = if header.flags.size_indicator {
                4 - usize::from(header.flags.size)
            } else {
                4
            };

            let Some(value) = body.get(0..size) else {
                return abort_response(index, subindex, CoeAbortCode::DataTooShort);
            };

            return match self.dictionary.write(
                index,
                subindex,
                header.flags.complete_access,
                value,
            ) {
                Ok(()) => download_ack(index, subindex),
                Err(code) => abort_response(index, subindex, code),
            };
        }

        let Some(size_bytes) = body.get(0..4).and_then(|b| <[u8; 4]>::try_from(b).ok()) else {
            return abort_response(index, subindex, CoeAbortCode::DataTooShort);
        };

        let total = u32::from_le_bytes(size_bytes) as usize;
        let value = &body[4..];

        if value.len() >= total {
            // Normal download: everything arrived in one mailbox.
            return match self.dictionary.write(
                index,
                subindex,
                header.flags.complete_access,
                &value[..total],
            ) {
                Ok(()) => download_ack(index, subindex),
                Err(code) => abort_response(index, subindex, code),
            };
        }

        self.download = Some(SegmentedDownload {
            index,
            subindex,
            complete_access: header.flags.complete_access,
            data: Vec::with_capacity(total),
            toggle: false,
        });

        download_ack(index, subindex)
    }

    fn sdo_download_segment(&mut self, sdo: &[u8]) -> Vec<u8> {
        let request = SegmentSdoHeader::unpack(sdo[0]);

        let Some(download) = self.download.as_mut() else {
            return abort_response(0, 0, CoeAbortCode::InvalidCommand);
        };

        if request.toggle != download.toggle {
            let (index, subindex) = (download.index, download.subindex);

            self.download = None;

            return abort_response(index, subindex, CoeAbortCode::ToggleBit);
        }

        let body = &sdo[SegmentSdoHeader::LEN..];

        let size = if body.len() > SEGMENT_CHUNK {
            body.len()
        } else {
            usize::from(request.segment_data_size)
        };

        let Some(chunk) = body.get(0..size) else {
            let (index, subindex) = (download.index, download.subindex);

            self.download = None;

            return abort_response(index, subindex, CoeAbortCode::DataTooShort);
        };

        download.data.extend_from_slice(chunk);

        let toggle = download.toggle;

        download.toggle = !download.toggle;

        let mut out = CoeHeader::new(CoeService::SdoResponse).pack().to_vec();

        out.push(
            SegmentSdoHeader {
                is_last_segment: request.is_last_segment,
                segment_data_size: 0,
                toggle,
                command: coe::response::DOWNLOAD_SEGMENT,
            }
            .pack(),
        );

        out.resize(CoeHeader::LEN + SegmentSdoHeader::LEN + SEGMENT_CHUNK, 0);

        if request.is_last_segment {
            let state = self.download.take().unwrap();

            if let Err(code) = self.dictionary.write(
                state.index,
                state.subindex,
                state.complete_access,
                &state.data,
            ) {
                return abort_response(state.index, state.subindex, code);
            }
        }

        out
    }

    fn handle_foe(&mut self, payload: &[u8]) -> Option<(MailboxType, Vec<u8>)> {
        let header = FoeHeader::unpack_from_slice(payload).ok()?;
        let body = &payload[FOE_HEADER_LEN..];

        let chunk_capacity =
            usize::from(self.config.send_size) - MAILBOX_HEADER_LEN - FOE_HEADER_LEN;

        match header.op {
            foe::opcode::READ => {
                let name = String::from_utf8_lossy(body).into_owned();

                match self.files.read_file(&name, header.field) {
                    Ok(data) => {
                        let size = data.len().min(chunk_capacity);
                        let chunk = data[..size].to_vec();

                        self.foe_read = Some(FoeReadState {
                            data,
                            cursor: size,
                            packet: 1,
                            closed: size < chunk_capacity,
                        });

                        Some((MailboxType::Foe, foe::data_message(1, &chunk)))
                    }
                    Err(code) => Some((MailboxType::Foe, foe::error_message(code))),
                }
            }
            foe::opcode::ACK => {
                // A stray ACK (e.g. for an already closed transfer) is dropped.
                let state = self.foe_read.as_mut()?;

                if header.field != state.packet {
                    self.foe_read = None;

                    return Some((
                        MailboxType::Foe,
                        foe::error_message(foe::result::PACKET_NUMBER_WRONG),
                    ));
                }

                if state.closed {
                    self.foe_read = None;

                    return None;
                }

                let remaining = state.data.len() - state.cursor;
                let size = remaining.min(chunk_capacity);
                let chunk = state.data[state.cursor..state.cursor + size].to_vec();

                state.cursor += size;
                state.packet += 1;
                state.closed = size < chunk_capacity;

                let packet = state.packet;

                Some((MailboxType::Foe, foe::data_message(packet, &chunk)))
            }
            foe::opcode::WRITE => {
                let name = String::from_utf8_lossy(body).into_owned();

                self.foe_write = Some(FoeWriteState {
                    name,
                    password: header.field,
                    data: Vec::new(),
                    expected_packet: 1,
                });

                Some((MailboxType::Foe, foe::ack_message(0)))
            }
            foe::opcode::DATA => {
                let recv_capacity =
                    usize::from(self.config.recv_size) - MAILBOX_HEADER_LEN - FOE_HEADER_LEN;

                let Some(state) = self.foe_write.as_mut() else {
                    return Some((
                        MailboxType::Foe,
                        foe::error_message(foe::result::ILLEGAL),
                    ));
                };

                if header.field != state.expected_packet {
                    self.foe_write = None;

                    return Some((
                        MailboxType::Foe,
                        foe::error_message(foe::result::PACKET_NUMBER_WRONG),
                    ));
                }

                state.data.extend_from_slice(body);
                state.expected_packet += 1;

                let done = body.len() < recv_capacity;
                let packet = header.field;

                if done {
                    let state = self.foe_write.take().unwrap();

                    if let Err(code) =
                        self.files.write_file(&state.name, state.password, &state.data)
                    {
                        return Some((MailboxType::Foe, foe::error_message(code)));
                    }
                }

                Some((MailboxType::Foe, foe::ack_message(packet)))
            }
            _ => Some((
                MailboxType::Foe,
                foe::error_message(foe::result::ILLEGAL),
            )),
        }
    }

    fn handle_eoe(&mut self, payload: &[u8]) -> Option<(MailboxType, Vec<u8>)> {
        let header = EoeHeader::unpack_from_slice(payload).ok()?;
        let body = &payload[EoeHeader::LEN..];

        match header.frame_type {
            eoe::frame_type::SET_IP_REQUEST => {
                let result = match IpParam::unpack_from_slice(body) {
                    Ok(param) => {
                        self.apply_ip(&param);

                        eoe::result::SUCCESS
                    }
                    Err(_) => eoe::result::UNSPECIFIED_ERROR,
                };

                let mut out = EoeHeader::request(eoe::frame_type::SET_IP_RESPONSE)
                    .pack()
                    .to_vec();

                out.extend_from_slice(&result.to_le_bytes());

                Some((MailboxType::Eoe, out))
            }
            eoe::frame_type::GET_IP_REQUEST => {
                let mut out = EoeHeader::request(eoe::frame_type::GET_IP_RESPONSE)
                    .pack()
                    .to_vec();

                out.extend_from_slice(&self.ip.pack());

                Some((MailboxType::Eoe, out))
            }
            _ => {
                let mut out = EoeHeader::request(eoe::frame_type::SET_IP_RESPONSE)
                    .pack()
                    .to_vec();

                out.extend_from_slice(&eoe::result::UNSUPPORTED_FRAME_TYPE.to_le_bytes());

                Some((MailboxType::Eoe, out))
            }
        }
    }

    /// Merge the fields announced by the parameter mask into the stored configuration.
    fn apply_ip(&mut self, param: &IpParam) {
        use crate::eoe::IpParamFlags;

        if param.flags.contains(IpParamFlags::MAC_ADDRESS) {
            self.ip.mac = param.mac;
        }

        if param.flags.contains(IpParamFlags::IP_ADDRESS) {
            self.ip.ip = param.ip;
        }

        if param.flags.contains(IpParamFlags::SUBNET_MASK) {
            self.ip.subnet_mask = param.subnet_mask;
        }

        if param.flags.contains(IpParamFlags::DEFAULT_GATEWAY) {
            self.ip.gateway = param.gateway;
        }

        if param.flags.contains(IpParamFlags::DNS_SERVER_IP) {
            self.ip.dns_server = param.dns_server;
        }

        if param.flags.contains(IpParamFlags::DNS_NAME) {
            self.ip.dns_name = param.dns_name.clone();
        }

        self.ip.flags |= param.flags;
    }
}

fn frame(mailbox_type: MailboxType, counter: u8, payload: Vec<u8>) -> Vec<u8> {
    let header = MailboxHeader {
        length: payload.len() as u16,
        address: 0,
        channel: 0,
        priority: Priority::Lowest,
        mailbox_type,
        counter,
    };

    let mut out = header.pack().to_vec();

    out.extend_from_slice(&payload);

    out
}

fn error_reply(detail: u16) -> Vec<u8> {
    // Mailbox error reply: command word 0x01 then the detail code.
    let mut out = 0x0001u16.to_le_bytes().to_vec();

    out.extend_from_slice(&detail.to_le_bytes());

    out
}

fn sdo_response(flags: InitSdoFlags, index: u16, subindex: u8, data: &[u8; 4]) -> Vec<u8> {
    let mut out = CoeHeader::new(CoeService::SdoResponse).pack().to_vec();

    out.extend_from_slice(
        &InitSdoHeader {
            flags,
            index,
            sub_index: subindex,
        }
        .pack(),
    );

    out.extend_from_slice(data);

    out
}

fn download_ack(index: u16, subindex: u8) -> Vec<u8> {
    sdo_response(
        InitSdoFlags {
            command: coe::response::DOWNLOAD,
            ..Default::default()
        },
        index,
        subindex,
        &[0u8; 4],
    )
}

fn abort_response(index: u16, subindex: u8, code: CoeAbortCode) -> Vec<u8> {
    sdo_response(
        InitSdoFlags {
            command: coe::response::ABORT,
            ..Default::default()
        },
        index,
        subindex,
        &u32::from(code).to_le_bytes(),
    )
}
