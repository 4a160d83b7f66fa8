//! The in-flight datagram pipeline.
//!
//! Datagrams are appended to an outgoing frame together with a completion and an error callback,
//! keyed by a master-assigned 8 bit index. [`Link::process_datagrams`] flushes the frame, reads
//! responses back off the wire and settles every slot: exactly one of the two callbacks fires
//! per datagram, and every slot is FREE again when the call returns.
//!
//! With a redundant interface attached every frame goes out on both sockets. A device services a
//! datagram exactly once however the chain is split, so the working counters of the two returned
//! copies can be merged: equal counters mean the frame circulated whole, differing non-zero
//! counters mean each copy crossed one segment of a broken chain and their sum is the true count.

use crate::command::Command;
use crate::error::{Error, PduError};
use crate::frame::{parse_datagrams, EthercatFrame, ReceivedDatagram, FRAME_BUFFER_LEN};
use crate::pdu::DatagramHeader;
use crate::socket::{NullSocket, RawSocket};
use core::time::Duration;

/// Outcome of one datagram's round trip, as seen by the completion callbacks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DatagramState {
    /// The response arrived and the completion callback accepted it.
    Ok,
    /// The completion callback rejected the observed working counter.
    InvalidWkc,
    /// The frame carrying the datagram could not be sent.
    SendError,
    /// No response arrived before the frame deadline.
    Lost,
}

type ProcessFn = Box<dyn FnMut(&DatagramHeader, &[u8], u16) -> DatagramState>;
type ErrorFn = Box<dyn FnMut(DatagramState)>;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum SlotState {
    #[default]
    Free,
    Pending,
    Done,
    Lost,
}

#[derive(Default)]
struct Slot {
    process: Option<ProcessFn>,
    error: Option<ErrorFn>,
    state: SlotState,
}

/// Datagram pipeline over one nominal and one optional redundant interface.
pub struct Link {
    socket_nominal: Box<dyn RawSocket>,
    socket_redundancy: Box<dyn RawSocket>,
    redundancy_enabled: bool,
    on_degraded: Option<Box<dyn FnMut()>>,
    /// True while inside a degraded episode; re-armed by a fully healthy cycle.
    degraded: bool,
    next_index: u8,
    pending: usize,
    sent_frames: usize,
    frame: EthercatFrame,
    slots: [Slot; 256],
}

impl Link {
    /// A link over a single interface. Redundancy merging and the degradation callback stay off.
    pub fn new(socket: Box<dyn RawSocket>) -> Self {
        Self {
            socket_nominal: socket,
            socket_redundancy: Box::new(NullSocket),
            redundancy_enabled: false,
            on_degraded: None,
            degraded: false,
            next_index: 0,
            pending: 0,
            sent_frames: 0,
            frame: EthercatFrame::new(),
            slots: core::array::from_fn(|_| Slot::default()),
        }
    }

    /// A link over two interfaces.
    ///
    /// `on_degraded` fires exactly once per degraded episode, i.e. when a cycle first observes
    /// that only one path returned a frame or that the chain is split.
    pub fn with_redundancy(
        nominal: Box<dyn RawSocket>,
        redundant: Box<dyn RawSocket>,
        on_degraded: impl FnMut() + 'static,
    ) -> Self {
        let mut link = Self::new(nominal);

        link.socket_redundancy = redundant;
        link.redundancy_enabled = true;
        link.on_degraded = Some(Box::new(on_degraded));

        link
    }

    /// Set the receive deadline on both sockets.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.socket_nominal.set_timeout(timeout);
        self.socket_redundancy.set_timeout(timeout);
    }

    /// Number of datagrams currently awaiting a response.
    pub fn pending_datagrams(&self) -> usize {
        self.pending
    }

    /// Reserve the next index and write a datagram into the outgoing frame.
    ///
    /// If the frame has no room left it is flushed first. Fails with
    /// [`PduError::TooManyInflight`] once all 256 indices are occupied.
    pub fn add_datagram(
        &mut self,
        command: Command,
        address: u32,
        data: &[u8],
        length: u16,
        process: impl FnMut(&DatagramHeader, &[u8], u16) -> DatagramState + 'static,
        error: impl FnMut(DatagramState) + 'static,
    ) -> Result<(), Error> {
        let index = self.next_index;

        if self.slots[usize::from(index)].state != SlotState::Free {
            return Err(Error::Pdu(PduError::TooManyInflight));
        }

        match self.frame.add_datagram(command, index, address, data, length) {
            Ok(()) => {}
            Err(Error::Pdu(PduError::FrameFull)) => {
                if let Err(e) = self.flush() {
                    self.fail_all_pending(DatagramState::SendError);
                    self.reset_slots();

                    return Err(e);
                }

                self.frame.add_datagram(command, index, address, data, length)?;
            }
            Err(e) => return Err(e),
        }

        let slot = &mut self.slots[usize::from(index)];

        slot.process = Some(Box::new(process));
        slot.error = Some(Box::new(error));
        slot.state = SlotState::Pending;

        self.pending += 1;
        self.next_index = self.next_index.wrapping_add(1);

        Ok(())
    }

    /// Flush the outgoing frame, then receive until every pending datagram is settled or the
    /// socket deadline passes. Unsettled datagrams are reported LOST through their error
    /// callback. Every slot is FREE when this returns.
    pub fn process_datagrams(&mut self) -> Result<(), Error> {
        if let Err(e) = self.flush() {
            self.fail_all_pending(DatagramState::SendError);
            self.reset_slots();

            return Err(e);
        }

        let mut frames_left = self.sent_frames;
        let mut cycle_degraded = false;
        let mut hard_error = None;

        while self.pending > 0 && frames_left > 0 {
            match self.receive_one() {
                Ok(degraded) => {
                    cycle_degraded |= degraded;
                    frames_left -= 1;
                }
                Err(Error::Timeout) => break,
                Err(e) => {
                    log::error!("receive failed: {}", e);

                    hard_error = Some(e);

                    break;
                }
            }
        }

        if cycle_degraded {
            if !self.degraded {
                self.degraded = true;

                log::warn!("redundancy degraded: running on a split or single path");

                if let Some(cb) = self.on_degraded.as_mut() {
                    cb();
                }
            }
        } else {
            self.degraded = false;
        }

        self.fail_all_pending(DatagramState::Lost);
        self.reset_slots();

        match hard_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Synchronous round trip of one caller-built frame over the nominal interface, falling back
    /// to the redundant one. Used during early bring-up before the index pool is in play.
    pub fn write_then_read(&mut self, frame: &mut EthercatFrame) -> Result<(), Error> {
        {
            let wire = frame.finalize()?;

            let sent = self.socket_nominal.write(wire)?;

            if sent != wire.len() {
                return Err(Error::Pdu(PduError::PartialSend));
            }

            if self.redundancy_enabled {
                self.socket_redundancy.write(wire)?;
            }
        }

        match self.read_valid_frame(frame, false) {
            Ok(()) => Ok(()),
            Err(Error::Timeout) if self.redundancy_enabled => {
                self.read_valid_frame(frame, true)
            }
            Err(e) => Err(e),
        }
    }

    fn read_valid_frame(
        &mut self,
        frame: &mut EthercatFrame,
        redundant: bool,
    ) -> Result<(), Error> {
        let socket = if redundant {
            &mut self.socket_redundancy
        } else {
            &mut self.socket_nominal
        };

        let read = socket.read(frame.buffer_mut())?;

        if read == 0 {
            return Err(Error::Timeout);
        }

        frame.datagrams().map(|_| ())
    }

    fn flush(&mut self) -> Result<(), Error> {
        if self.frame.is_empty() {
            return Ok(());
        }

        let wire = self.frame.finalize()?;

        let sent = self.socket_nominal.write(wire)?;

        if sent != wire.len() {
            return Err(Error::Pdu(PduError::PartialSend));
        }

        if self.redundancy_enabled {
            let sent = self.socket_redundancy.write(wire)?;

            if sent != wire.len() {
                return Err(Error::Pdu(PduError::PartialSend));
            }
        }

        self.frame.clear();
        self.sent_frames += 1;

        Ok(())
    }

    /// Receive one frame (one copy per attached interface), merge the copies and settle the
    /// datagrams they carry. Returns whether this frame saw a degraded path.
    fn receive_one(&mut self) -> Result<bool, Error> {
        let mut buf_nominal = [0u8; FRAME_BUFFER_LEN];
        let mut buf_redundant = [0u8; FRAME_BUFFER_LEN];

        let got_nominal = match self.socket_nominal.read(&mut buf_nominal) {
            Ok(n) => n > 0,
            Err(Error::Timeout) => false,
            Err(e) => return Err(e),
        };

        let got_redundant = if self.redundancy_enabled {
            match self.socket_redundancy.read(&mut buf_redundant) {
                Ok(n) => n > 0,
                Err(Error::Timeout) => false,
                Err(e) => return Err(e),
            }
        } else {
            false
        };

        if got_nominal && got_redundant {
            self.dispatch_frame(&mut buf_nominal, Some(&buf_redundant), false)
        } else if got_nominal || got_redundant {
            let primary = if got_nominal {
                &mut buf_nominal
            } else {
                &mut buf_redundant
            };

            self.dispatch_frame(primary, None, self.redundancy_enabled)
        } else {
            Err(Error::Timeout)
        }
    }

    /// Walk the datagrams of one received frame, folding in the redundant copy when present, and
    /// settle the matching slots. Returns whether this frame saw a degraded path.
    fn dispatch_frame(
        &mut self,
        primary: &mut [u8],
        secondary_buf: Option<&[u8]>,
        one_path_missing: bool,
    ) -> Result<bool, Error> {
        let mut datagrams: heapless::Vec<ReceivedDatagram, 128> = heapless::Vec::new();

        for datagram in parse_datagrams(primary)? {
            if datagrams.push(datagram).is_err() {
                log::warn!("frame carries more datagrams than the pipeline tracks");

                break;
            }
        }

        // Both copies of one frame share a layout, so the secondary copy is walked by the same
        // offsets. A copy that turns out to be a different frame is treated as absent.
        let secondary: Option<heapless::Vec<ReceivedDatagram, 128>> = match secondary_buf {
            Some(buf) => {
                let mut items = heapless::Vec::new();

                for datagram in parse_datagrams(buf)? {
                    if items.push(datagram).is_err() {
                        break;
                    }
                }

                let paired = items.len() == datagrams.len()
                    && items
                        .iter()
                        .zip(datagrams.iter())
                        .all(|(a, b)| a.header.index == b.header.index);

                if paired {
                    Some(items)
                } else {
                    log::warn!("redundant interface returned an unrelated frame");

                    None
                }
            }
            None => None,
        };

        let mut frame_degraded =
            one_path_missing || (secondary_buf.is_some() && secondary.is_none());

        for (nth, datagram) in datagrams.iter().enumerate() {
            let mut wkc = datagram.wkc;

            if let (Some(items), Some(other_buf)) = (secondary.as_ref(), secondary_buf) {
                let other = items[nth];

                if other.wkc != wkc {
                    // A split chain: each copy carries the data written by one segment's
                    // devices, so payloads are merged bit-wise alongside the counters.
                    for offset in 0..datagram.payload_len {
                        primary[datagram.payload_start + offset] |=
                            other_buf[other.payload_start + offset];
                    }

                    if wkc != 0 && other.wkc != 0 {
                        wkc += other.wkc;
                        frame_degraded = true;
                    } else {
                        wkc = wkc.max(other.wkc);
                    }
                }
            }

            self.settle(datagram, primary, wkc);
        }

        Ok(frame_degraded)
    }

    fn settle(&mut self, datagram: &ReceivedDatagram, buf: &[u8], wkc: u16) {
        let slot = &mut self.slots[usize::from(datagram.header.index)];

        if slot.state != SlotState::Pending {
            log::warn!(
                "response for index {} does not match a pending datagram",
                datagram.header.index
            );

            return;
        }

        slot.state = SlotState::Done;
        self.pending -= 1;

        let payload =
            &buf[datagram.payload_start..datagram.payload_start + datagram.payload_len];

        let result = match slot.process.take() {
            Some(mut process) => process(&datagram.header, payload, wkc),
            None => DatagramState::Ok,
        };

        if result != DatagramState::Ok {
            if let Some(mut error) = slot.error.take() {
                error(result);
            }
        }
    }

    /// Fire the error callback of every still-pending slot with the given state.
    fn fail_all_pending(&mut self, state: DatagramState) {
        for slot in self.slots.iter_mut() {
            if slot.state == SlotState::Pending {
                slot.state = SlotState::Lost;
                self.pending -= 1;

                slot.process = None;

                if let Some(mut error) = slot.error.take() {
                    error(state);
                }
            }
        }
    }

    fn reset_slots(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.process = None;
            slot.error = None;
            slot.state = SlotState::Free;
        }

        self.pending = 0;
        self.sent_frames = 0;
    }
}
