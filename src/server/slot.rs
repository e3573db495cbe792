//! Per-connection slot records.
//!
//! The server owns a fixed table of slots, one per potential concurrent
//! connection, allocated once at startup. A slot's `id` equals its
//! index in the table and never changes; everything else cycles with
//! the connection it currently hosts.

use crate::frame::{Codec, FrameHeader, HEADER_SIZE};
use std::os::unix::io::RawFd;
use std::time::Instant;

/// Lifecycle tag of a slot.
///
/// A request walks `Idle → HeaderRead → Payload → PayloadRead →
/// Available`; the application moves it `Available → Processing →
/// Ready`; the reply walks `Ready → Writing → WriteDone → Idle`.
/// `Doomed` slots are closed and return to `Vacant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No connection; an accept is kept armed for this slot.
    Vacant,
    /// Connected, between requests; the next step reads header bytes.
    Idle,
    /// A header read was issued; completeness is checked on the next
    /// visit and short reads fall back to `Idle` to resume.
    HeaderRead,
    /// Header decoded; the next step reads payload bytes.
    Payload,
    /// A payload read was issued; short reads fall back to `Payload`.
    PayloadRead,
    /// Full request assembled, parked for the application.
    Available,
    /// Claimed by the application.
    Processing,
    /// Response attached; the write phase starts on the next visit.
    Ready,
    /// The next step writes response bytes.
    Writing,
    /// A write was issued; short writes fall back to `Writing`.
    WriteDone,
    /// Connection condemned; the next visit closes and vacates it.
    Doomed,
}

impl SlotState {
    /// States in which progress depends on the peer. Slots stuck here
    /// past the idle deadline are reaped.
    pub(crate) fn awaits_peer(self) -> bool {
        matches!(
            self,
            SlotState::Idle
                | SlotState::HeaderRead
                | SlotState::Payload
                | SlotState::PayloadRead
                | SlotState::Writing
                | SlotState::WriteDone
        )
    }
}

/// One entry in the fixed client table.
#[derive(Debug)]
pub struct ClientSlot {
    pub(crate) id: u64,
    pub(crate) sock: Option<RawFd>,
    pub(crate) state: SlotState,
    /// Header of the inbound message being read or processed.
    pub(crate) header: FrameHeader,
    /// Staging area for the 9 raw header bytes.
    pub(crate) header_buf: [u8; HEADER_SIZE],
    /// Inbound payload buffer. Reused across requests on the same
    /// connection; regrown only when a header announces more than its
    /// current capacity.
    pub(crate) request: Option<Vec<u8>>,
    pub(crate) recv_offset: usize,
    /// Outbound framed message (header plus payload), fresh per reply.
    pub(crate) response: Option<Vec<u8>>,
    pub(crate) write_offset: usize,
    /// Instant of the last successful read or write completion.
    pub(crate) activity: Instant,
    /// True while a submission authored by this slot is in the kernel.
    pub(crate) in_flight: bool,
    /// Bumped every time the slot is vacated, so completions belonging
    /// to a previous occupant are recognized and dropped.
    pub(crate) gen: u32,
}

impl ClientSlot {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            sock: None,
            state: SlotState::Vacant,
            header: FrameHeader::default(),
            header_buf: [0u8; HEADER_SIZE],
            request: None,
            recv_offset: 0,
            response: None,
            write_offset: 0,
            activity: Instant::now(),
            in_flight: false,
            gen: 0,
        }
    }

    /// Stable index of this slot in the table.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Header of the request currently held by this slot.
    pub fn header(&self) -> FrameHeader {
        self.header
    }

    /// The request's codec tag, if it names a known codec.
    pub fn codec(&self) -> Option<Codec> {
        Codec::from_tag(self.header.codec)
    }

    /// Payload of the assembled request. Meaningful once the slot is
    /// `Available` or `Processing`; empty otherwise.
    pub fn payload(&self) -> &[u8] {
        let size = self.header.size as usize;
        match &self.request {
            Some(buf) if buf.len() >= size => &buf[..size],
            _ => &[],
        }
    }

    /// Take possession of a freshly accepted connection, zeroing
    /// everything but `id` and `gen`.
    pub(crate) fn open(&mut self, fd: RawFd, now: Instant) {
        self.sock = Some(fd);
        self.state = SlotState::Idle;
        self.header = FrameHeader::default();
        self.request = None;
        self.recv_offset = 0;
        self.response = None;
        self.write_offset = 0;
        self.activity = now;
    }

    /// Vacate the slot and drop its buffers. Bumps the generation so
    /// any completion still in the kernel for the old occupant is
    /// discarded on arrival.
    pub(crate) fn release(&mut self) {
        self.sock = None;
        self.state = SlotState::Vacant;
        self.header = FrameHeader::default();
        self.request = None;
        self.recv_offset = 0;
        self.response = None;
        self.write_offset = 0;
        self.in_flight = false;
        self.gen = self.gen.wrapping_add(1);
    }

    /// Make sure the request buffer can hold the announced payload.
    pub(crate) fn reserve_request(&mut self) {
        let size = self.header.size as usize;
        if self.request.as_ref().map_or(true, |buf| buf.len() < size) {
            self.request = Some(vec![0u8; size]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_resets_transfer_state() {
        let mut slot = ClientSlot::new(3);
        slot.recv_offset = 5;
        slot.write_offset = 7;
        slot.response = Some(vec![1, 2, 3]);
        slot.header = FrameHeader::new(99, Codec::Gzip);

        slot.open(10, Instant::now());

        assert_eq!(slot.id(), 3);
        assert_eq!(slot.sock, Some(10));
        assert_eq!(slot.state(), SlotState::Idle);
        assert_eq!(slot.recv_offset, 0);
        assert_eq!(slot.write_offset, 0);
        assert!(slot.request.is_none());
        assert!(slot.response.is_none());
    }

    #[test]
    fn test_release_vacates_and_bumps_generation() {
        let mut slot = ClientSlot::new(0);
        slot.open(10, Instant::now());
        slot.request = Some(vec![0u8; 16]);
        slot.response = Some(vec![0u8; 16]);
        let gen = slot.gen;

        slot.release();

        assert_eq!(slot.state(), SlotState::Vacant);
        assert!(slot.sock.is_none());
        assert!(slot.request.is_none());
        assert!(slot.response.is_none());
        assert_eq!(slot.gen, gen + 1);
    }

    #[test]
    fn test_reserve_request_reuses_large_enough_buffer() {
        let mut slot = ClientSlot::new(0);
        slot.header.size = 8;
        slot.reserve_request();
        assert_eq!(slot.request.as_ref().map(Vec::len), Some(8));

        // A smaller request reuses the existing allocation.
        slot.header.size = 4;
        slot.reserve_request();
        assert_eq!(slot.request.as_ref().map(Vec::len), Some(8));

        // A larger one regrows it.
        slot.header.size = 32;
        slot.reserve_request();
        assert_eq!(slot.request.as_ref().map(Vec::len), Some(32));
    }

    #[test]
    fn test_payload_respects_announced_size() {
        let mut slot = ClientSlot::new(0);
        slot.header.size = 3;
        slot.request = Some(vec![b'a', b'b', b'c', 0, 0]);
        assert_eq!(slot.payload(), b"abc");

        slot.header.size = 0;
        assert_eq!(slot.payload(), b"");

        slot.request = None;
        assert_eq!(slot.payload(), b"");
    }
}
