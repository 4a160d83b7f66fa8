//! Master side of one device's mailbox.
//!
//! Requests are created as messages, queued per service type and moved to a pending list when
//! transmitted. Each physical transmission gets the next 1..=7 counter; a response is matched
//! back to its message by mirroring that counter. CoE, FoE and EoE dialogs each run at most one
//! message in flight at a time, strictly FIFO within their type.
//!
//! Callers keep a [`MessageHandle`] and poll [`MessageHandle::status`] while the bus pumps
//! [`Mailbox::send`]/[`Mailbox::receive`]/[`Mailbox::process_timeouts`].

use super::{
    MailboxConfig, MailboxCounter, MailboxHeader, MailboxType, Priority, MAILBOX_HEADER_LEN,
};
use crate::coe::{
    self, CoeDecodeError, CoeHeader, CoeService, InitSdoFlags, InitSdoHeader, SegmentSdoHeader,
};
use crate::eoe::{self, EoeHeader, IpParam};
use crate::error::MailboxError;
use crate::foe::{self, FoeHeader, FOE_HEADER_LEN};
use core::time::Duration;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Lifecycle of one mailbox message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// Queued or awaiting (more of) its response.
    Running,
    /// Terminal: the dialog completed.
    Success,
    /// Terminal: the deadline passed before the dialog completed.
    TimedOut,
    /// Terminal: the dialog failed.
    Failed(MailboxError),
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Running)
    }
}

enum Kind {
    SdoUpload {
        index: u16,
        subindex: u8,
        complete_access: bool,
        /// Caller's buffer budget; exceeding it aborts the transfer.
        capacity: usize,
        /// Toggle expected in the next segment response.
        toggle: bool,
        /// Total size negotiated by the init response once segmented.
        total: Option<usize>,
    },
    SdoDownload {
        index: u16,
        subindex: u8,
        payload: Vec<u8>,
        /// Bytes handed to segment requests so far.
        cursor: usize,
        toggle: bool,
        segmented: bool,
        /// The final (short) segment went out; the next response completes the dialog.
        finishing: bool,
    },
    FoeRead {
        next_packet: u32,
    },
    FoeWrite {
        payload: Vec<u8>,
        cursor: usize,
        next_packet: u32,
        /// WRITE sent, waiting for the opening ACK(0).
        opened: bool,
        /// The final (short) chunk went out; the next ACK completes the dialog.
        finishing: bool,
    },
    EoeSetIp,
    EoeGetIp,
}

/// One queued/in-flight mailbox dialog.
pub struct Message {
    status: MessageStatus,
    mailbox_type: MailboxType,
    /// Counter of the most recent transmission, mirrored by the response.
    counter: u8,
    timeout: Duration,
    /// Absolute deadline, armed at first transmission.
    deadline: Option<Duration>,
    /// Next mailbox payload (after the mailbox header) awaiting transmission.
    request: Option<Vec<u8>>,
    /// Copy of the last transmitted payload, for BUSY retries.
    last_request: Option<Vec<u8>>,
    /// Accumulated result: uploaded object, downloaded file, packed IP parameters.
    data: Vec<u8>,
    kind: Kind,
}

impl Message {
    fn new(mailbox_type: MailboxType, kind: Kind, request: Vec<u8>, timeout: Duration) -> Self {
        Self {
            status: MessageStatus::Running,
            mailbox_type,
            counter: 0,
            timeout,
            deadline: None,
            request: Some(request),
            last_request: None,
            data: Vec::new(),
            kind,
        }
    }

    fn fail(&mut self, error: MailboxError) {
        self.status = MessageStatus::Failed(error);
        self.request = None;
    }
}

/// Shared handle to poll a message's progress and read its result.
#[derive(Clone)]
pub struct MessageHandle(Rc<RefCell<Message>>);

impl MessageHandle {
    pub fn status(&self) -> MessageStatus {
        self.0.borrow().status
    }

    /// Result bytes accumulated so far: the uploaded object, the downloaded file, or the packed
    /// IP parameter block of a Get IP request.
    pub fn data(&self) -> Vec<u8> {
        self.0.borrow().data.clone()
    }

    /// Decode the result of a Get IP request.
    pub fn ip_param(&self) -> Option<IpParam> {
        IpParam::unpack_from_slice(&self.0.borrow().data).ok()
    }

    /// The SDO abort code, if the dialog was aborted.
    pub fn abort_code(&self) -> Option<crate::coe::CoeAbortCode> {
        match self.status() {
            MessageStatus::Failed(MailboxError::Aborted { code, .. }) => Some(code),
            _ => None,
        }
    }
}

/// Master side mailbox of one device.
pub struct Mailbox {
    /// Station address of the device, for diagnostics.
    address: u16,
    pub config: MailboxConfig,
    counter: MailboxCounter,
    to_send: VecDeque<Rc<RefCell<Message>>>,
    pending: Vec<Rc<RefCell<Message>>>,
    /// Framed one-shot transmissions needing no response, e.g. the closing FoE ACK.
    bare_sends: VecDeque<Vec<u8>>,
}

impl Mailbox {
    pub fn new(address: u16, config: MailboxConfig) -> Self {
        Self {
            address,
            config,
            counter: MailboxCounter::default(),
            to_send: VecDeque::new(),
            pending: Vec::new(),
            bare_sends: VecDeque::new(),
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Anything queued, in flight or waiting to fire.
    pub fn is_busy(&self) -> bool {
        !self.to_send.is_empty() || !self.pending.is_empty() || !self.bare_sends.is_empty()
    }

    /// Request payload budget: master to device mailbox minus its header.
    fn recv_budget(&self) -> usize {
        usize::from(self.config.recv_size).saturating_sub(MAILBOX_HEADER_LEN)
    }

    /// Response payload budget: device to master mailbox minus its header.
    fn send_budget(&self) -> usize {
        usize::from(self.config.send_size).saturating_sub(MAILBOX_HEADER_LEN)
    }

    /// Queue an SDO upload of `index:subindex` into a caller buffer of `capacity` bytes.
    pub fn create_sdo_upload(
        &mut self,
        index: u16,
        subindex: u8,
        complete_access: bool,
        capacity: usize,
        timeout: Duration,
    ) -> MessageHandle {
        let request = sdo_upload_request(index, subindex, complete_access);

        self.enqueue(Message::new(
            MailboxType::Coe,
            Kind::SdoUpload {
                index,
                subindex,
                complete_access,
                capacity,
                toggle: false,
                total: None,
            },
            request,
            timeout,
        ))
    }

    /// Queue an SDO download of `payload` to `index:subindex`, picking the expedited, normal or
    /// segmented shape by size.
    pub fn create_sdo_download(
        &mut self,
        index: u16,
        subindex: u8,
        complete_access: bool,
        payload: &[u8],
        timeout: Duration,
    ) -> MessageHandle {
        // An init request always carries coe header + sdo header + 4 data bytes.
        let normal_budget = self
            .recv_budget()
            .saturating_sub(CoeHeader::LEN + InitSdoHeader::LEN + 4);

        let (request, segmented) = if payload.len() <= 4 {
            (
                sdo_download_expedited(index, subindex, complete_access, payload),
                false,
            )
        } else if payload.len() <= normal_budget {
            (
                sdo_download_normal(index, subindex, complete_access, payload),
                false,
            )
        } else {
            (
                sdo_download_init_segmented(index, subindex, complete_access, payload.len()),
                true,
            )
        };

        self.enqueue(Message::new(
            MailboxType::Coe,
            Kind::SdoDownload {
                index,
                subindex,
                payload: payload.to_vec(),
                cursor: 0,
                toggle: false,
                segmented,
                finishing: false,
            },
            request,
            timeout,
        ))
    }

    /// Queue an FoE read of `filename`; the file lands in the message data.
    pub fn create_read_file(
        &mut self,
        filename: &str,
        password: u32,
        timeout: Duration,
    ) -> MessageHandle {
        let request = foe::file_request(foe::opcode::READ, password, filename);

        self.enqueue(Message::new(
            MailboxType::Foe,
            Kind::FoeRead { next_packet: 1 },
            request,
            timeout,
        ))
    }

    /// Queue an FoE write of `data` as `filename`.
    pub fn create_write_file(
        &mut self,
        filename: &str,
        password: u32,
        data: &[u8],
        timeout: Duration,
    ) -> MessageHandle {
        let request = foe::file_request(foe::opcode::WRITE, password, filename);

        self.enqueue(Message::new(
            MailboxType::Foe,
            Kind::FoeWrite {
                payload: data.to_vec(),
                cursor: 0,
                next_packet: 1,
                opened: false,
                finishing: false,
            },
            request,
            timeout,
        ))
    }

    /// Queue an EoE Set IP request. Fields to apply are selected by `param.flags`.
    pub fn create_eoe_set_ip(&mut self, param: &IpParam, timeout: Duration) -> MessageHandle {
        let mut request = EoeHeader::request(eoe::frame_type::SET_IP_REQUEST).pack().to_vec();

        request.extend_from_slice(&param.pack());

        self.enqueue(Message::new(MailboxType::Eoe, Kind::EoeSetIp, request, timeout))
    }

    /// Queue an EoE Get IP request; the packed parameter block lands in the message data.
    pub fn create_eoe_get_ip(&mut self, timeout: Duration) -> MessageHandle {
        let request = EoeHeader::request(eoe::frame_type::GET_IP_REQUEST).pack().to_vec();

        self.enqueue(Message::new(MailboxType::Eoe, Kind::EoeGetIp, request, timeout))
    }

    fn enqueue(&mut self, message: Message) -> MessageHandle {
        let handle = Rc::new(RefCell::new(message));

        self.to_send.push_back(handle.clone());

        MessageHandle(handle)
    }

    /// Hand out the next message to transmit, already framed with mailbox header and counter,
    /// and move it to the pending list.
    ///
    /// Honors the one-in-flight-per-service rule: a message whose service type already awaits a
    /// response stays queued.
    pub fn send(&mut self, now: Duration) -> Option<Vec<u8>> {
        if let Some(bytes) = self.bare_sends.pop_front() {
            return Some(bytes);
        }

        let position = self
            .to_send
            .iter()
            .position(|m| !self.service_busy(m.borrow().mailbox_type))?;

        let message = self.to_send.remove(position)?;

        let frame = {
            let mut msg = message.borrow_mut();

            let payload = msg.request.take()?;

            msg.counter = self.counter.next();

            if msg.deadline.is_none() {
                msg.deadline = Some(now + msg.timeout);
            }

            msg.last_request = Some(payload.clone());

            log::trace!(
                "mailbox {:#06x}: sending {:?} message, counter {}",
                self.address,
                msg.mailbox_type,
                msg.counter
            );

            self.frame(msg.mailbox_type, msg.counter, payload)
        };

        self.pending.push(message);

        Some(frame)
    }

    fn frame(&self, mailbox_type: MailboxType, counter: u8, payload: Vec<u8>) -> Vec<u8> {
        let header = MailboxHeader {
            length: payload.len() as u16,
            address: 0,
            channel: 0,
            priority: Priority::Lowest,
            mailbox_type,
            counter,
        };

        let mut bytes = header.pack().to_vec();

        bytes.extend_from_slice(&payload);

        bytes
    }

    fn service_busy(&self, mailbox_type: MailboxType) -> bool {
        self.pending
            .iter()
            .any(|m| m.borrow().mailbox_type == mailbox_type)
    }

    /// Offer raw mailbox bytes read from the device. Returns whether they matched one of this
    /// mailbox's pending messages; unmatched bytes are left for other consumers.
    pub fn receive(&mut self, raw: &[u8]) -> bool {
        let Ok(header) = MailboxHeader::unpack_from_slice(raw) else {
            return false;
        };

        let length = usize::from(header.length);

        let Some(payload) = raw.get(MAILBOX_HEADER_LEN..MAILBOX_HEADER_LEN + length) else {
            return false;
        };

        // An error reply carries no usable counter correlation; it concerns the oldest dialog.
        if header.mailbox_type == MailboxType::Err {
            let detail = payload
                .get(2..4)
                .and_then(|bytes| bytes.try_into().ok())
                .map(u16::from_le_bytes)
                .unwrap_or(0);

            if self.pending.is_empty() {
                return false;
            }

            let message = self.pending.remove(0);

            message.borrow_mut().fail(MailboxError::ErrorReply(detail));

            return true;
        }

        // Unsolicited emergencies arrive on the CoE service; they never settle a dialog.
        if header.mailbox_type == MailboxType::Coe {
            if let Ok(coe) = CoeHeader::unpack_from_slice(payload) {
                if coe.service == CoeService::Emergency {
                    let code = payload
                        .get(2..4)
                        .and_then(|bytes| bytes.try_into().ok())
                        .map(u16::from_le_bytes)
                        .unwrap_or(0);

                    log::warn!(
                        "mailbox {:#06x}: emergency, error code {:#06x}",
                        self.address,
                        code
                    );

                    return true;
                }
            }
        }

        let position = self.pending.iter().position(|m| {
            let msg = m.borrow();

            msg.mailbox_type == header.mailbox_type && msg.counter == header.counter
        });

        let Some(position) = position else {
            return false;
        };

        let message = self.pending[position].clone();
        let send_budget = self.send_budget();
        let recv_budget = self.recv_budget();

        message
            .borrow_mut()
            .handle_response(payload, recv_budget, send_budget);

        let (terminal, has_followup) = {
            let msg = message.borrow();

            (msg.status.is_terminal(), msg.request.is_some())
        };

        if terminal {
            self.pending.remove(position);

            // A dialog may complete while still owing the device one transmission, e.g. the
            // closing FoE ACK.
            if has_followup {
                let mut msg = message.borrow_mut();

                if let Some(payload) = msg.request.take() {
                    let counter = self.counter.next();

                    let frame = self.frame(msg.mailbox_type, counter, payload);

                    self.bare_sends.push_back(frame);
                }
            }
        } else if has_followup {
            // Next round of a multi-exchange dialog goes out ahead of newly queued messages.
            self.pending.remove(position);
            self.to_send.push_front(message);
        }

        true
    }

    /// Expire pending messages whose deadline has passed.
    pub fn process_timeouts(&mut self, now: Duration) {
        let address = self.address;

        self.pending.retain(|m| {
            let mut msg = m.borrow_mut();

            let expired = msg.deadline.is_some_and(|deadline| now >= deadline);

            if expired {
                log::warn!(
                    "mailbox {:#06x}: {:?} message timed out",
                    address,
                    msg.mailbox_type
                );

                msg.status = MessageStatus::TimedOut;
                msg.request = None;
            }

            !expired
        });
    }
}

impl Message {
    fn handle_response(&mut self, payload: &[u8], recv_budget: usize, send_budget: usize) {
        match self.mailbox_type {
            MailboxType::Coe => self.handle_coe_response(payload, recv_budget),
            MailboxType::Foe => self.handle_foe_response(payload, recv_budget, send_budget),
            MailboxType::Eoe => self.handle_eoe_response(payload),
            _ => self.fail(MailboxError::InvalidResponse),
        }
    }

    fn handle_coe_response(&mut self, payload: &[u8], recv_budget: usize) {
        let coe = match CoeHeader::unpack_from_slice(payload) {
            Ok(coe) => coe,
            Err(CoeDecodeError::UnknownService) => {
                return self.fail(MailboxError::UnknownService)
            }
            Err(CoeDecodeError::Malformed) => return self.fail(MailboxError::InvalidResponse),
        };

        if coe.service != CoeService::SdoResponse {
            return self.fail(MailboxError::WrongService);
        }

        let sdo = &payload[CoeHeader::LEN..];

        // An abort is init-shaped whatever phase the transfer is in.
        if !sdo.is_empty() && InitSdoFlags::unpack(sdo[0]).command == coe::response::ABORT {
            return self.handle_abort(sdo);
        }

        if matches!(self.kind, Kind::SdoUpload { total: None, .. }) {
            self.handle_upload_init(sdo)
        } else if matches!(self.kind, Kind::SdoUpload { .. }) {
            self.handle_upload_segment(sdo, payload.len())
        } else if matches!(self.kind, Kind::SdoDownload { .. }) {
            self.handle_download_response(sdo, recv_budget)
        } else {
            self.fail(MailboxError::InvalidResponse)
        }
    }

    fn handle_abort(&mut self, sdo: &[u8]) {
        let Ok(header) = InitSdoHeader::unpack_from_slice(sdo) else {
            return self.fail(MailboxError::InvalidResponse);
        };

        let code = sdo
            .get(InitSdoHeader::LEN..InitSdoHeader::LEN + 4)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u32::from_le_bytes)
            .unwrap_or(0);

        self.fail(MailboxError::Aborted {
            code: code.into(),
            index: header.index,
            subindex: header.sub_index,
        });
    }

    fn handle_upload_init(&mut self, sdo: &[u8]) {
        let Kind::SdoUpload {
            index,
            subindex,
            complete_access,
            capacity,
            ref mut toggle,
            ref mut total,
        } = self.kind
        else {
            unreachable!()
        };

        let Ok(header) = InitSdoHeader::unpack_from_slice(sdo) else {
            return self.fail(MailboxError::InvalidResponse);
        };

        if header.flags.command != coe::response::UPLOAD
            || header.index != index
            || (!complete_access && header.sub_index != subindex)
        {
            return self.fail(MailboxError::InvalidResponse);
        }

        let body = &sdo[InitSdoHeader::LEN..];

        if header.flags.expedited_transfer {
            let size = if header.flags.size_indicator {
                4 - usize::from(header.flags.size)
            } else {
                4
            };

            let Some(value) = body.get(0..size) else {
                return self.fail(MailboxError::InvalidResponse);
            };

            if size > capacity {
                return self.fail(MailboxError::ClientBufferTooSmall);
            }

            self.data.extend_from_slice(value);
            self.status = MessageStatus::Success;

            return;
        }

        // Normal or segmented init response: complete size, then as much of the value as the
        // mailbox could carry.
        let Some(size_bytes) = body.get(0..4).and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
        else {
            return self.fail(MailboxError::InvalidResponse);
        };

        let total_size = u32::from_le_bytes(size_bytes) as usize;
        let value = &body[4..];

        if total_size > capacity {
            return self.fail(MailboxError::ClientBufferTooSmall);
        }

        if value.len() >= total_size {
            // The whole value fit into one mailbox (normal transfer).
            self.data.extend_from_slice(&value[..total_size]);
            self.status = MessageStatus::Success;

            return;
        }

        // Segmented transfer: remember the negotiated size and request the first segment.
        self.data.extend_from_slice(value);

        *total = Some(total_size);
        *toggle = false;

        self.request = Some(sdo_upload_segment_request(false));
    }

    fn handle_upload_segment(&mut self, sdo: &[u8], payload_len: usize) {
        let Kind::SdoUpload {
            capacity,
            ref mut toggle,
            total,
            ..
        } = self.kind
        else {
            unreachable!()
        };

        let Some(&first) = sdo.first() else {
            return self.fail(MailboxError::InvalidResponse);
        };

        let segment = SegmentSdoHeader::unpack(first);

        if segment.command != coe::response::UPLOAD_SEGMENT {
            return self.fail(MailboxError::InvalidResponse);
        }

        if segment.toggle != *toggle {
            return self.fail(MailboxError::BadToggleBit);
        }

        // Segment data fills the mailbox; for the canonical 7 byte rounds the meaningful length
        // comes from the size field of the header.
        let available = payload_len - CoeHeader::LEN - SegmentSdoHeader::LEN;

        let size = if available > 7 {
            available
        } else {
            usize::from(segment.segment_data_size)
        };

        let Some(chunk) = sdo.get(SegmentSdoHeader::LEN..SegmentSdoHeader::LEN + size) else {
            return self.fail(MailboxError::InvalidResponse);
        };

        if self.data.len() + size > capacity {
            return self.fail(MailboxError::ClientBufferTooSmall);
        }

        self.data.extend_from_slice(chunk);

        if segment.is_last_segment {
            if let Some(total) = total {
                if self.data.len() != total {
                    log::warn!(
                        "segmented upload ended with {} bytes, {} negotiated",
                        self.data.len(),
                        total
                    );
                }
            }

            self.status = MessageStatus::Success;
        } else {
            *toggle = !*toggle;

            self.request = Some(sdo_upload_segment_request(*toggle));
        }
    }

    fn handle_download_response(&mut self, sdo: &[u8], recv_budget: usize) {
        let Kind::SdoDownload {
            index,
            payload: ref transfer,
            ref mut cursor,
            ref mut toggle,
            segmented,
            ref mut finishing,
            ..
        } = self.kind
        else {
            unreachable!()
        };

        if !segmented {
            let Ok(header) = InitSdoHeader::unpack_from_slice(sdo) else {
                return self.fail(MailboxError::InvalidResponse);
            };

            if header.flags.command != coe::response::DOWNLOAD || header.index != index {
                return self.fail(MailboxError::InvalidResponse);
            }

            self.status = MessageStatus::Success;

            return;
        }

        // Segmented download: the init response is init-shaped, segment acks are segment-shaped.
        let expecting_init = *cursor == 0 && !*finishing;

        if expecting_init {
            let Ok(header) = InitSdoHeader::unpack_from_slice(sdo) else {
                return self.fail(MailboxError::InvalidResponse);
            };

            if header.flags.command != coe::response::DOWNLOAD || header.index != index {
                return self.fail(MailboxError::InvalidResponse);
            }
        } else {
            let Some(&first) = sdo.first() else {
                return self.fail(MailboxError::InvalidResponse);
            };

            let segment = SegmentSdoHeader::unpack(first);

            if segment.command != coe::response::DOWNLOAD_SEGMENT {
                return self.fail(MailboxError::InvalidResponse);
            }

            if segment.toggle != *toggle {
                return self.fail(MailboxError::BadToggleBit);
            }

            if *finishing {
                self.status = MessageStatus::Success;

                return;
            }

            *toggle = !*toggle;
        }

        // Hand out the next chunk.
        let chunk_budget = recv_budget.saturating_sub(CoeHeader::LEN + SegmentSdoHeader::LEN);
        let remaining = transfer.len() - *cursor;
        let chunk_len = remaining.min(chunk_budget);
        let chunk = &transfer[*cursor..*cursor + chunk_len];

        let last = chunk_len == remaining;

        // The toggle of the outgoing segment: first segment uses 0.
        let request_toggle = if expecting_init { false } else { *toggle };

        self.request = Some(sdo_download_segment_request(request_toggle, last, chunk));

        if expecting_init {
            *toggle = false;
        }

        *cursor += chunk_len;
        *finishing = last;
    }

    fn handle_foe_response(&mut self, payload: &[u8], recv_budget: usize, send_budget: usize) {
        let Ok(header) = FoeHeader::unpack_from_slice(payload) else {
            return self.fail(MailboxError::InvalidResponse);
        };

        match header.op {
            foe::opcode::ERROR => {
                self.fail(MailboxError::Foe(header.field as u16));
            }
            foe::opcode::BUSY => {
                // The device wants a pause; repeat the last transmission on the next pump.
                self.request = self.last_request.clone();
            }
            foe::opcode::DATA => self.handle_foe_data(header.field, payload, send_budget),
            foe::opcode::ACK => self.handle_foe_ack(header.field, recv_budget),
            _ => self.fail(MailboxError::InvalidResponse),
        }
    }

    fn handle_foe_data(&mut self, packet: u32, payload: &[u8], send_budget: usize) {
        let Kind::FoeRead { ref mut next_packet } = self.kind else {
            return self.fail(MailboxError::InvalidResponse);
        };

        if packet != *next_packet {
            return self.fail(MailboxError::Foe(foe::result::PACKET_NUMBER_WRONG));
        }

        let chunk = &payload[FOE_HEADER_LEN..];

        self.data.extend_from_slice(chunk);

        // A chunk shorter than the mailbox data capacity terminates the transfer; its ACK still
        // goes out as a courtesy to the device.
        let full_capacity = send_budget.saturating_sub(FOE_HEADER_LEN);

        self.request = Some(foe::ack_message(packet));

        if chunk.len() < full_capacity {
            self.status = MessageStatus::Success;
        } else {
            *next_packet += 1;
        }
    }

    fn handle_foe_ack(&mut self, packet: u32, recv_budget: usize) {
        let Kind::FoeWrite {
            payload: ref transfer,
            ref mut cursor,
            ref mut next_packet,
            ref mut opened,
            ref mut finishing,
        } = self.kind
        else {
            return self.fail(MailboxError::InvalidResponse);
        };

        if !*opened {
            // The opening ACK of the WRITE request carries packet number 0.
            if packet != 0 {
                return self.fail(MailboxError::Foe(foe::result::PACKET_NUMBER_WRONG));
            }

            *opened = true;
        } else {
            if packet != *next_packet - 1 {
                return self.fail(MailboxError::Foe(foe::result::PACKET_NUMBER_WRONG));
            }

            if *finishing {
                self.status = MessageStatus::Success;

                return;
            }
        }

        let chunk_capacity = recv_budget.saturating_sub(FOE_HEADER_LEN);
        let remaining = transfer.len() - *cursor;
        let chunk_len = remaining.min(chunk_capacity);
        let chunk = &transfer[*cursor..*cursor + chunk_len];

        self.request = Some(foe::data_message(*next_packet, chunk));

        *cursor += chunk_len;
        *next_packet += 1;

        // A final full chunk is followed by an empty DATA so the device sees a short packet.
        *finishing = chunk_len < chunk_capacity;
    }

    fn handle_eoe_response(&mut self, payload: &[u8]) {
        let Ok(header) = EoeHeader::unpack_from_slice(payload) else {
            return self.fail(MailboxError::InvalidResponse);
        };

        let body = &payload[EoeHeader::LEN..];

        match self.kind {
            Kind::EoeSetIp => {
                if header.frame_type != eoe::frame_type::SET_IP_RESPONSE {
                    return self.fail(MailboxError::InvalidResponse);
                }

                let result = body
                    .get(0..2)
                    .and_then(|bytes| bytes.try_into().ok())
                    .map(u16::from_le_bytes)
                    .unwrap_or(eoe::result::UNSPECIFIED_ERROR);

                if result == eoe::result::SUCCESS {
                    self.status = MessageStatus::Success;
                } else {
                    self.fail(MailboxError::Eoe(result));
                }
            }
            Kind::EoeGetIp => {
                if header.frame_type != eoe::frame_type::GET_IP_RESPONSE {
                    return self.fail(MailboxError::InvalidResponse);
                }

                match IpParam::unpack_from_slice(body) {
                    Ok(_) => {
                        self.data.extend_from_slice(body);
                        self.status = MessageStatus::Success;
                    }
                    Err(_) => {
                        let result = body
                            .get(0..2)
                            .and_then(|bytes| bytes.try_into().ok())
                            .map(u16::from_le_bytes)
                            .unwrap_or(eoe::result::UNSPECIFIED_ERROR);

                        self.fail(MailboxError::Eoe(result));
                    }
                }
            }
            _ => self.fail(MailboxError::InvalidResponse),
        }
    }
}

fn sdo_init(flags: InitSdoFlags, index: u16, subindex: u8, data: &[u8; 4]) -> Vec<u8> {
    let mut out = CoeHeader::new(CoeService::SdoRequest).pack().to_vec();

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

fn sdo_upload_request(index: u16, subindex: u8, complete_access: bool) -> Vec<u8> {
    sdo_init(
        InitSdoFlags {
            complete_access,
            command: coe::request::UPLOAD,
            ..Default::default()
        },
        index,
        subindex,
        &[0u8; 4],
    )
}

fn sdo_download_expedited(
    index: u16,
    subindex: u8,
    complete_access: bool,
    payload: &[u8],
) -> Vec<u8> {
    debug_assert!(payload.len() <= 4);

    let mut data = [0u8; 4];

    data[..payload.len()].copy_from_slice(payload);

    sdo_init(
        InitSdoFlags {
            size_indicator: true,
            expedited_transfer: true,
            size: (4 - payload.len()) as u8,
            complete_access,
            command: coe::request::DOWNLOAD,
        },
        index,
        subindex,
        &data,
    )
}

fn sdo_download_normal(
    index: u16,
    subindex: u8,
    complete_access: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = sdo_init(
        InitSdoFlags {
            size_indicator: true,
            complete_access,
            command: coe::request::DOWNLOAD,
            ..Default::default()
        },
        index,
        subindex,
        &(payload.len() as u32).to_le_bytes(),
    );

    out.extend_from_slice(payload);

    out
}

fn sdo_download_init_segmented(
    index: u16,
    subindex: u8,
    complete_access: bool,
    total: usize,
) -> Vec<u8> {
    sdo_init(
        InitSdoFlags {
            size_indicator: true,
            complete_access,
            command: coe::request::DOWNLOAD,
            ..Default::default()
        },
        index,
        subindex,
        &(total as u32).to_le_bytes(),
    )
}

fn sdo_upload_segment_request(toggle: bool) -> Vec<u8> {
    let mut out = CoeHeader::new(CoeService::SdoRequest).pack().to_vec();

    out.push(
        SegmentSdoHeader {
            command: coe::request::UPLOAD_SEGMENT,
            toggle,
            ..Default::default()
        }
        .pack(),
    );

    // The request still fills the canonical 7 byte segment area.
    out.extend_from_slice(&[0u8; 7]);

    out
}

fn sdo_download_segment_request(toggle: bool, last: bool, chunk: &[u8]) -> Vec<u8> {
    let mut out = CoeHeader::new(CoeService::SdoRequest).pack().to_vec();

    out.push(
        SegmentSdoHeader {
            command: coe::request::DOWNLOAD_SEGMENT,
            toggle,
            is_last_segment: last,
            segment_data_size: chunk.len().min(7) as u8,
        }
        .pack(),
    );

    out.extend_from_slice(chunk);

    // Short final chunks still fill the minimum segment area.
    if chunk.len() < 7 {
        out.resize(CoeHeader::LEN + SegmentSdoHeader::LEN + 7, 0);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::response::{
        MemoryFileStore, ResponseMailbox, SimpleDictionary,
    };
    use pretty_assertions::assert_eq;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn config() -> MailboxConfig {
        MailboxConfig {
            recv_offset: 0x1000,
            recv_size: 128,
            send_offset: 0x1080,
            send_size: 128,
        }
    }

    fn device(dictionary: SimpleDictionary, files: MemoryFileStore) -> ResponseMailbox {
        ResponseMailbox::new(config(), Box::new(dictionary), Box::new(files))
    }

    /// Shuttle frames between the master mailbox and the emulated device, optionally corrupting
    /// responses, until the dialog settles.
    fn pump(
        mailbox: &mut Mailbox,
        device: &mut ResponseMailbox,
        mut mutate: impl FnMut(usize, &mut Vec<u8>),
    ) -> usize {
        let mut exchanges = 0;
        let mut now = Duration::ZERO;

        while mailbox.is_busy() && exchanges < 64 {
            now += Duration::from_millis(1);

            let Some(frame) = mailbox.send(now) else {
                break;
            };

            device.receive(&frame);

            while let Some(mut response) = device.send() {
                mutate(exchanges, &mut response);

                mailbox.receive(&response);
            }

            exchanges += 1;
        }

        exchanges
    }

    fn no_mutation(_: usize, _: &mut Vec<u8>) {}

    #[test]
    fn expedited_sdo_upload() {
        let mut dictionary = SimpleDictionary::default();

        dictionary.insert(0x1018, 4, &[0x12, 0x34, 0x56, 0x78]);

        let mut device = device(dictionary, MemoryFileStore::default());
        let mut mailbox = Mailbox::new(0x1001, config());

        let handle = mailbox.create_sdo_upload(0x1018, 4, false, 64, TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(handle.status(), MessageStatus::Success);
        assert_eq!(handle.data(), vec![0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn expedited_response_wire_format() {
        let mut dictionary = SimpleDictionary::default();

        dictionary.insert(0x1018, 4, &[0x12, 0x34, 0x56, 0x78]);

        let mut device = device(dictionary, MemoryFileStore::default());
        let mut mailbox = Mailbox::new(0x1001, config());

        let _handle = mailbox.create_sdo_upload(0x1018, 4, false, 64, TIMEOUT);

        let frame = mailbox.send(Duration::ZERO).unwrap();

        device.receive(&frame);

        let response = device.send().unwrap();

        // CoE header: SDO response service in the top nibble.
        assert_eq!(&response[6..8], &[0x00, 0x30]);
        // Expedited upload response for 4 bytes of 0x1018:4.
        assert_eq!(&response[8..12], &[0x43, 0x18, 0x10, 0x04]);
        assert_eq!(&response[12..16], &[0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn sdo_abort_carries_code_and_text() {
        // Nothing in the dictionary: the device aborts with "object does not exist".
        let mut device = device(SimpleDictionary::default(), MemoryFileStore::default());
        let mut mailbox = Mailbox::new(0x1001, config());

        let handle = mailbox.create_sdo_upload(0x1018, 4, false, 64, TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        let code = handle.abort_code().unwrap();

        assert_eq!(u32::from(code), 0x0602_0000);
        assert!(code.description().starts_with("Object does not exist"));
        assert_eq!(
            handle.status(),
            MessageStatus::Failed(MailboxError::Aborted {
                code,
                index: 0x1018,
                subindex: 4,
            })
        );
    }

    #[test]
    fn segmented_sdo_upload() {
        let name = b"left motion controller board v2";

        assert_eq!(name.len(), 31);

        let mut dictionary = SimpleDictionary::default();

        dictionary.insert(0x1008, 0, name);

        let mut device = device(dictionary, MemoryFileStore::default());
        let mut mailbox = Mailbox::new(0x1001, config());

        let handle = mailbox.create_sdo_upload(0x1008, 0, false, 64, TIMEOUT);

        // Init exchange plus five 7,7,7,7,3 byte segments.
        let exchanges = pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(exchanges, 6);
        assert_eq!(handle.status(), MessageStatus::Success);
        assert_eq!(handle.data(), name.to_vec());
    }

    #[test]
    fn segmented_upload_bad_toggle() {
        let mut dictionary = SimpleDictionary::default();

        dictionary.insert(0x1008, 0, b"left motion controller board v2");

        let mut device = device(dictionary, MemoryFileStore::default());
        let mut mailbox = Mailbox::new(0x1001, config());

        let handle = mailbox.create_sdo_upload(0x1008, 0, false, 64, TIMEOUT);

        // Exchange 0 is the init response; flip the toggle bit of the third segment response.
        pump(&mut mailbox, &mut device, |exchange, response| {
            if exchange == 3 {
                response[8] ^= 0x10;
            }
        });

        assert_eq!(
            handle.status(),
            MessageStatus::Failed(MailboxError::BadToggleBit)
        );
    }

    #[test]
    fn upload_too_large_for_caller_buffer() {
        let mut dictionary = SimpleDictionary::default();

        dictionary.insert(0x1008, 0, b"left motion controller board v2");

        let mut device = device(dictionary, MemoryFileStore::default());
        let mut mailbox = Mailbox::new(0x1001, config());

        let handle = mailbox.create_sdo_upload(0x1008, 0, false, 16, TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(
            handle.status(),
            MessageStatus::Failed(MailboxError::ClientBufferTooSmall)
        );
    }

    #[test]
    fn expedited_sdo_download() {
        let mut device = device(SimpleDictionary::default(), MemoryFileStore::default());
        let mut mailbox = Mailbox::new(0x1001, config());

        let handle = mailbox.create_sdo_download(0x7000, 1, false, &[0xaa, 0xbb], TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(handle.status(), MessageStatus::Success);

        // Read the value back through the same pair.
        let readback = mailbox.create_sdo_upload(0x7000, 1, false, 16, TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(readback.status(), MessageStatus::Success);
        assert_eq!(readback.data(), vec![0xaa, 0xbb]);
    }

    #[test]
    fn segmented_sdo_download_round_trip() {
        let blob: Vec<u8> = (0u8..200).collect();

        let mut device = device(SimpleDictionary::default(), MemoryFileStore::default());
        let mut mailbox = Mailbox::new(0x1001, config());

        let handle = mailbox.create_sdo_download(0x8000, 0, false, &blob, TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(handle.status(), MessageStatus::Success);

        let readback = mailbox.create_sdo_upload(0x8000, 0, false, 512, TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(readback.status(), MessageStatus::Success);
        assert_eq!(readback.data(), blob);
    }

    #[test]
    fn foe_read_multi_chunk() {
        let file: Vec<u8> = (0u8..=255).cycle().take(300).collect();

        let mut files = MemoryFileStore::default();

        files.insert("firmware.bin", &file);

        let mut device = device(SimpleDictionary::default(), files);
        let mut mailbox = Mailbox::new(0x1001, config());

        let handle = mailbox.create_read_file("firmware.bin", 0, TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(handle.status(), MessageStatus::Success);
        assert_eq!(handle.data(), file);
    }

    #[test]
    fn foe_read_missing_file() {
        let mut device = device(SimpleDictionary::default(), MemoryFileStore::default());
        let mut mailbox = Mailbox::new(0x1001, config());

        let handle = mailbox.create_read_file("nope.bin", 0, TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(
            handle.status(),
            MessageStatus::Failed(MailboxError::Foe(foe::result::NOT_FOUND))
        );
    }

    #[test]
    fn foe_write_round_trip() {
        let file: Vec<u8> = (0u8..=255).cycle().take(300).collect();

        let mut device = device(SimpleDictionary::default(), MemoryFileStore::default());
        let mut mailbox = Mailbox::new(0x1001, config());

        let handle = mailbox.create_write_file("saved.bin", 0, &file, TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(handle.status(), MessageStatus::Success);

        let readback = mailbox.create_read_file("saved.bin", 0, TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(readback.status(), MessageStatus::Success);
        assert_eq!(readback.data(), file);
    }

    #[test]
    fn eoe_set_then_get_ip() {
        use crate::eoe::IpParamFlags;

        let mut device = device(SimpleDictionary::default(), MemoryFileStore::default());
        let mut mailbox = Mailbox::new(0x1001, config());

        let param = IpParam {
            flags: IpParamFlags::IP_ADDRESS | IpParamFlags::SUBNET_MASK,
            ip: [10, 0, 0, 7],
            subnet_mask: [255, 0, 0, 0],
            ..Default::default()
        };

        let set = mailbox.create_eoe_set_ip(&param, TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(set.status(), MessageStatus::Success);

        let get = mailbox.create_eoe_get_ip(TIMEOUT);

        pump(&mut mailbox, &mut device, no_mutation);

        assert_eq!(get.status(), MessageStatus::Success);

        let stored = get.ip_param().unwrap();

        assert_eq!(stored.ip, [10, 0, 0, 7]);
        assert_eq!(stored.subnet_mask, [255, 0, 0, 0]);
    }

    #[test]
    fn message_times_out() {
        let mut mailbox = Mailbox::new(0x1001, config());

        let handle = mailbox.create_sdo_upload(0x1018, 1, false, 16, TIMEOUT);

        let frame = mailbox.send(Duration::ZERO);

        assert!(frame.is_some());
        assert_eq!(handle.status(), MessageStatus::Running);

        mailbox.process_timeouts(Duration::from_millis(99));

        assert_eq!(handle.status(), MessageStatus::Running);

        mailbox.process_timeouts(Duration::from_millis(100));

        assert_eq!(handle.status(), MessageStatus::TimedOut);
        assert!(!mailbox.is_busy());
    }

    #[test]
    fn one_in_flight_per_service_fifo_within() {
        let mut mailbox = Mailbox::new(0x1001, config());

        let _first = mailbox.create_sdo_upload(0x1000, 0, false, 16, TIMEOUT);
        let _second = mailbox.create_sdo_upload(0x1001, 0, false, 16, TIMEOUT);
        let _file = mailbox.create_read_file("a.bin", 0, TIMEOUT);

        // First CoE message goes out; the second CoE message must wait, but FoE may proceed.
        let first = mailbox.send(Duration::ZERO).unwrap();

        assert_eq!(first[5] & 0x0f, MailboxType::Coe as u8);

        let next = mailbox.send(Duration::ZERO).unwrap();

        assert_eq!(next[5] & 0x0f, MailboxType::Foe as u8);

        assert!(mailbox.send(Duration::ZERO).is_none());
    }

    #[test]
    fn mismatched_counter_is_ignored() {
        let mut dictionary = SimpleDictionary::default();

        dictionary.insert(0x1018, 4, &[0x01]);

        let mut device = device(dictionary, MemoryFileStore::default());
        let mut mailbox = Mailbox::new(0x1001, config());

        let handle = mailbox.create_sdo_upload(0x1018, 4, false, 16, TIMEOUT);

        let frame = mailbox.send(Duration::ZERO).unwrap();

        device.receive(&frame);

        let mut response = device.send().unwrap();

        // Another device's response: different counter in the high nibble of byte 5.
        response[5] = (response[5] & 0x0f) | 0x70;

        assert!(!mailbox.receive(&response));
        assert_eq!(handle.status(), MessageStatus::Running);

        // The genuine response still lands.
        device.receive(&frame);

        let replay = device.send().unwrap();

        assert!(mailbox.receive(&replay));
        assert_eq!(handle.status(), MessageStatus::Success);
    }

    #[test]
    fn counters_increment_and_skip_zero() {
        let mut mailbox = Mailbox::new(0x1001, config());

        let mut seen = Vec::new();

        for n in 0..9 {
            let _ = mailbox.create_sdo_upload(0x1000 + n, 0, false, 4, TIMEOUT);
        }

        for _ in 0..9 {
            let frame = mailbox.send(Duration::ZERO).unwrap();

            seen.push((frame[5] >> 4) & 0x07);

            // Settle the dialog by hand so the next CoE message may go out.
            mailbox.pending.clear();
        }

        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7, 1, 2]);
    }
}
