//! Completion-driven TCP server core.
//!
//! The server owns a fixed slot table, a listening socket, and an
//! io_uring instance. [`Networker::cycle`] is the sole progress
//! function: phase A walks the table once and queues at most one
//! submission per slot according to its state, phase B submits the
//! batch and harvests completions, pairing each with its authoring
//! slot through the token packed into `user_data`. Between cycles the
//! application observes finished requests and injects responses
//! through the handoff API (`get_available` / `claim` /
//! `apply_response` / `kill`).
//!
//! Everything runs on the thread that calls `cycle`; the handoff API
//! must not be invoked concurrently with it.

mod ring;
mod slot;

pub use slot::{ClientSlot, SlotState};

use crate::error::NetError;
use crate::frame::{Codec, FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use ring::{Op, Ring, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connections with no successful read or write completion for this
/// long are closed and their slot vacated.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(1200);

/// Server bootstrap settings.
///
/// `host` must be an IPv4 dotted-quad literal; hostname resolution is
/// out of scope. `max_clients` sizes both the slot table and the ring.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub max_queue: u16,
    pub max_clients: u16,
}

/// The server core: listener, slot table, and ring.
pub struct Networker {
    listener: Option<TcpListener>,
    ring: Option<Ring>,
    slots: Vec<ClientSlot>,
}

impl Networker {
    /// A fresh, un-initiated server. Call [`start`](Self::start) before
    /// anything else.
    pub fn new() -> Self {
        Self {
            listener: None,
            ring: None,
            slots: Vec::new(),
        }
    }

    /// Bind, listen, and allocate the slot table and ring.
    ///
    /// Idempotent: a second call on a started server returns success
    /// without side effects. On failure every partially acquired
    /// resource is released and the server stays un-initiated.
    pub fn start(&mut self, settings: &Settings) -> Result<(), NetError> {
        if self.ring.is_some() {
            return Ok(());
        }

        let host: Ipv4Addr = settings
            .host
            .parse()
            .map_err(|_| NetError::BadAddress(settings.host.clone()))?;
        let addr = SocketAddr::from((host, settings.port));

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(i32::from(settings.max_queue))?;
        let listener: TcpListener = socket.into();

        let count = usize::from(settings.max_clients);
        let mut slots = Vec::with_capacity(count);
        for id in 0..count {
            slots.push(ClientSlot::new(id as u64));
        }

        // Twice the table size leaves room for closes queued alongside
        // the per-slot operations.
        let ring = Ring::new(u32::from(settings.max_clients) * 2)?;

        info!(
            addr = %listener.local_addr()?,
            max_clients = settings.max_clients,
            backlog = settings.max_queue,
            "server listening"
        );

        self.slots = slots;
        self.listener = Some(listener);
        self.ring = Some(ring);
        Ok(())
    }

    /// Address the listener is bound to. Useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        let listener = self.listener.as_ref().ok_or(NetError::Contract)?;
        Ok(listener.local_addr()?)
    }

    /// Number of slots in the table.
    pub fn max_clients(&self) -> usize {
        self.slots.len()
    }

    /// Run one scheduler cycle. Refuses to run before a successful
    /// [`start`](Self::start).
    ///
    /// Per-connection I/O failures doom only the affected slot; an
    /// error returned here is a ring failure and the server must be
    /// restarted.
    pub fn cycle(&mut self) -> Result<(), NetError> {
        if self.ring.is_none() || self.listener.is_none() {
            return Err(NetError::Contract);
        }
        self.drive()
    }

    fn drive(&mut self) -> Result<(), NetError> {
        let listener_fd = match &self.listener {
            Some(listener) => listener.as_raw_fd(),
            None => return Err(NetError::Contract),
        };
        let Some(ring) = self.ring.as_mut() else {
            return Err(NetError::Contract);
        };
        let now = Instant::now();

        // Phase A: queue at most one submission per slot.
        let mut moved = 0usize;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            moved += prepare_slot(slot, ring, idx, listener_fd, now)?;
        }

        // Phase B: submit the batch, then harvest whatever completed.
        ring.submit()?;

        let mut harvested = 0usize;
        while let Some((data, res)) = ring.pop() {
            complete(&mut self.slots, data, res, now);
            harvested += 1;
        }

        // Nothing progressed locally and nothing completed: block for
        // one completion so the caller's loop does not spin hot while
        // all slots wait on the kernel.
        if moved == 0 && harvested == 0 && self.slots.iter().any(|slot| slot.in_flight) {
            ring.wait()?;
            while let Some((data, res)) = ring.pop() {
                complete(&mut self.slots, data, res, now);
            }
        }

        Ok(())
    }

    /// First slot holding a fully assembled request, in slot-index
    /// order, or `None` when no request is waiting.
    pub fn get_available(&self) -> Option<&ClientSlot> {
        self.slots
            .iter()
            .find(|slot| slot.state == SlotState::Available)
    }

    /// Take ownership of an `Available` slot for processing.
    pub fn claim(&mut self, client_id: u64) -> Result<(), NetError> {
        let slot = self
            .slots
            .get_mut(client_id as usize)
            .ok_or(NetError::Contract)?;
        if slot.state != SlotState::Available {
            return Err(NetError::Contract);
        }
        slot.state = SlotState::Processing;
        Ok(())
    }

    /// Attach a response to a `Processing` slot and queue it for
    /// writing. The payload bytes are copied into a freshly framed
    /// buffer; the caller keeps ownership of `payload`.
    pub fn apply_response(
        &mut self,
        client_id: u64,
        payload: &[u8],
        codec: Codec,
    ) -> Result<(), NetError> {
        let slot = self
            .slots
            .get_mut(client_id as usize)
            .ok_or(NetError::Contract)?;
        if slot.state != SlotState::Processing {
            return Err(NetError::Contract);
        }

        let mut framed = Vec::with_capacity(HEADER_SIZE + payload.len());
        FrameHeader::new(payload.len() as u64, codec).encode_into(&mut framed);
        framed.extend_from_slice(payload);

        slot.response = Some(framed);
        slot.state = SlotState::Ready;
        Ok(())
    }

    /// Condemn a connection. The next cycle closes it and vacates the
    /// slot. Only the id is validated.
    pub fn kill(&mut self, client_id: u64) -> Result<(), NetError> {
        let slot = self
            .slots
            .get_mut(client_id as usize)
            .ok_or(NetError::Contract)?;
        slot.state = SlotState::Doomed;
        Ok(())
    }
}

impl Default for Networker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Networker {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(fd) = slot.sock.take() {
                unsafe { libc::close(fd) };
            }
        }
    }
}

/// Phase A dispatch for one slot. Returns the number of bookkeeping
/// transitions made (used to decide whether the cycle may block).
fn prepare_slot(
    slot: &mut ClientSlot,
    ring: &mut Ring,
    idx: usize,
    listener_fd: RawFd,
    now: Instant,
) -> Result<usize, NetError> {
    // Reap peers that stalled past the idle deadline, whatever phase
    // of a transfer they stalled in.
    if slot.sock.is_some()
        && slot.state.awaits_peer()
        && now.duration_since(slot.activity) > IDLE_TIMEOUT
    {
        debug!(id = slot.id, "idle timeout");
        slot.state = SlotState::Doomed;
    }

    if slot.state == SlotState::Doomed {
        if let Some(fd) = slot.sock.take() {
            ring.push_close(fd, Token::new(Op::Close, idx, slot.gen))?;
        }
        if slot.in_flight {
            // An operation still references this slot's buffers; keep
            // them until its completion drains, then vacate.
            return Ok(0);
        }
        slot.release();
        return Ok(1);
    }

    if slot.in_flight {
        return Ok(0);
    }

    let mut moved = 0usize;
    loop {
        match slot.state {
            SlotState::Vacant => {
                ring.push_accept(listener_fd, Token::new(Op::Accept, idx, slot.gen))?;
                slot.in_flight = true;
                break;
            }
            SlotState::Idle => {
                let Some(fd) = slot.sock else {
                    slot.release();
                    break;
                };
                let offset = slot.recv_offset;
                let ptr = slot.header_buf[offset..].as_mut_ptr();
                unsafe {
                    ring.push_read(
                        fd,
                        ptr,
                        (HEADER_SIZE - offset) as u32,
                        Token::new(Op::Read, idx, slot.gen),
                    )?;
                }
                slot.state = SlotState::HeaderRead;
                slot.in_flight = true;
                break;
            }
            SlotState::HeaderRead => {
                moved += 1;
                if slot.recv_offset == HEADER_SIZE {
                    slot.header = FrameHeader::decode(&slot.header_buf);
                    slot.recv_offset = 0;
                    slot.state = SlotState::Payload;
                    // A finished header flows straight into the payload
                    // read; the slot must not idle for a whole cycle.
                    continue;
                }
                slot.state = SlotState::Idle;
                break;
            }
            SlotState::Payload => {
                let Some(fd) = slot.sock else {
                    slot.release();
                    break;
                };
                if slot.header.size > MAX_PAYLOAD_SIZE {
                    debug!(id = slot.id, size = slot.header.size, "oversized request");
                    slot.state = SlotState::Doomed;
                    moved += 1;
                    break;
                }
                let size = slot.header.size as usize;
                if size == 0 {
                    slot.recv_offset = 0;
                    slot.state = SlotState::Available;
                    moved += 1;
                    break;
                }
                slot.reserve_request();
                let offset = slot.recv_offset;
                let Some(buf) = slot.request.as_mut() else {
                    slot.state = SlotState::Doomed;
                    break;
                };
                let ptr = buf[offset..].as_mut_ptr();
                unsafe {
                    ring.push_read(
                        fd,
                        ptr,
                        (size - offset) as u32,
                        Token::new(Op::Read, idx, slot.gen),
                    )?;
                }
                slot.state = SlotState::PayloadRead;
                slot.in_flight = true;
                break;
            }
            SlotState::PayloadRead => {
                moved += 1;
                if slot.recv_offset == slot.header.size as usize {
                    slot.recv_offset = 0;
                    slot.state = SlotState::Available;
                    debug!(id = slot.id, size = slot.header.size, "request assembled");
                } else {
                    slot.state = SlotState::Payload;
                }
                break;
            }
            SlotState::Available | SlotState::Processing => break,
            SlotState::Ready => {
                slot.write_offset = 0;
                slot.activity = now;
                slot.state = SlotState::Writing;
                moved += 1;
                // Flow straight into the write submission; the reply
                // must not wait for an unrelated completion.
                continue;
            }
            SlotState::Writing => {
                let Some(fd) = slot.sock else {
                    slot.release();
                    break;
                };
                let offset = slot.write_offset;
                let Some(response) = slot.response.as_ref() else {
                    slot.state = SlotState::Doomed;
                    break;
                };
                let len = (response.len() - offset) as u32;
                let ptr = response[offset..].as_ptr();
                unsafe {
                    ring.push_write(fd, ptr, len, Token::new(Op::Write, idx, slot.gen))?;
                }
                slot.state = SlotState::WriteDone;
                slot.in_flight = true;
                break;
            }
            SlotState::WriteDone => {
                moved += 1;
                let total = slot.response.as_ref().map_or(0, Vec::len);
                if slot.write_offset >= total {
                    slot.write_offset = 0;
                    slot.response = None;
                    slot.state = SlotState::Idle;
                    debug!(id = slot.id, bytes = total, "response written");
                } else {
                    slot.state = SlotState::Writing;
                }
                break;
            }
            // Handled before the loop.
            SlotState::Doomed => break,
        }
    }
    Ok(moved)
}

/// Phase B dispatch for one harvested completion.
fn complete(slots: &mut [ClientSlot], data: u64, res: i32, now: Instant) {
    let Some(token) = Token::decode(data) else {
        warn!(user_data = data, "unknown completion token");
        return;
    };
    let Some(slot) = slots.get_mut(token.slot) else {
        warn!(slot = token.slot, "completion for out-of-range slot");
        return;
    };

    if token.gen != slot.gen {
        // Left over from a previous occupant of the slot. An accepted
        // connection nobody will ever own must be closed here.
        if token.op == Op::Accept && res >= 0 {
            unsafe { libc::close(res) };
        }
        return;
    }

    match token.op {
        Op::Accept | Op::Read | Op::Write => slot.in_flight = false,
        // Closes are fire-and-forget and never marked in flight.
        Op::Close => {}
    }

    if res < 0 {
        let err = io::Error::from_raw_os_error(-res);
        match token.op {
            Op::Accept => warn!(error = %err, "accept failed"),
            Op::Close => debug!(id = slot.id, error = %err, "close failed"),
            Op::Read | Op::Write => {
                debug!(id = slot.id, error = %err, "io error, dooming slot");
                slot.state = SlotState::Doomed;
            }
        }
    } else {
        match token.op {
            Op::Accept => {
                if slot.state == SlotState::Doomed {
                    // The slot was condemned while the accept was in
                    // flight; nobody will ever own this connection.
                    unsafe { libc::close(res) };
                    slot.release();
                } else {
                    slot.open(res as RawFd, now);
                    debug!(id = slot.id, fd = res, "accepted connection");
                }
            }
            Op::Read => {
                if res == 0 {
                    debug!(id = slot.id, "peer closed");
                    slot.state = SlotState::Doomed;
                } else {
                    slot.recv_offset += res as usize;
                    slot.activity = now;
                }
            }
            Op::Write => {
                slot.write_offset += res as usize;
                slot.activity = now;
            }
            Op::Close => {}
        }
    }

    // A doomed slot whose socket is already closed was only waiting
    // for this completion before its buffers could be dropped.
    if slot.state == SlotState::Doomed && slot.sock.is_none() && !slot.in_flight {
        slot.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> Networker {
        let mut net = Networker::new();
        net.start(&Settings {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_queue: 4,
            max_clients: 4,
        })
        .expect("start");
        net
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut net = started();
        let addr = net.local_addr().unwrap();
        net.start(&Settings {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_queue: 4,
            max_clients: 8,
        })
        .unwrap();
        // Second start changed nothing.
        assert_eq!(net.local_addr().unwrap(), addr);
        assert_eq!(net.max_clients(), 4);
    }

    #[test]
    fn test_start_rejects_non_ipv4_literal() {
        let mut net = Networker::new();
        let err = net
            .start(&Settings {
                host: "localhost".to_string(),
                port: 0,
                max_queue: 4,
                max_clients: 4,
            })
            .unwrap_err();
        assert!(matches!(err, NetError::BadAddress(_)));
        // Still un-initiated.
        assert!(matches!(net.cycle(), Err(NetError::Contract)));
    }

    #[test]
    fn test_cycle_requires_start() {
        let mut net = Networker::new();
        assert!(matches!(net.cycle(), Err(NetError::Contract)));
    }

    #[test]
    fn test_claim_requires_available_state() {
        let mut net = started();
        assert!(matches!(net.claim(0), Err(NetError::Contract)));
        assert!(matches!(net.claim(99), Err(NetError::Contract)));

        net.slots[2].state = SlotState::Available;
        net.claim(2).unwrap();
        assert_eq!(net.slots[2].state, SlotState::Processing);

        // A second claim finds it already taken.
        assert!(matches!(net.claim(2), Err(NetError::Contract)));
    }

    #[test]
    fn test_get_available_returns_lowest_index() {
        let mut net = started();
        assert!(net.get_available().is_none());

        net.slots[3].state = SlotState::Available;
        net.slots[1].state = SlotState::Available;
        assert_eq!(net.get_available().map(ClientSlot::id), Some(1));
    }

    #[test]
    fn test_apply_response_frames_and_readies() {
        let mut net = started();
        net.slots[0].state = SlotState::Available;
        net.claim(0).unwrap();
        net.apply_response(0, b"WORLD", Codec::Zstd).unwrap();

        let slot = &net.slots[0];
        assert_eq!(slot.state, SlotState::Ready);
        let framed = slot.response.as_ref().unwrap();
        assert_eq!(framed.len(), HEADER_SIZE + 5);
        let header = FrameHeader::decode(&framed[..HEADER_SIZE]);
        assert_eq!(header.size, 5);
        assert_eq!(header.codec, Codec::Zstd.tag());
        assert_eq!(&framed[HEADER_SIZE..], b"WORLD");
    }

    #[test]
    fn test_apply_response_requires_processing_state() {
        let mut net = started();
        assert!(matches!(
            net.apply_response(0, b"x", Codec::None),
            Err(NetError::Contract)
        ));
        assert!(matches!(
            net.apply_response(99, b"x", Codec::None),
            Err(NetError::Contract)
        ));

        net.slots[0].state = SlotState::Available;
        assert!(matches!(
            net.apply_response(0, b"x", Codec::None),
            Err(NetError::Contract)
        ));
        assert!(net.slots[0].response.is_none());
    }

    #[test]
    fn test_kill_validates_range_only() {
        let mut net = started();
        assert!(matches!(net.kill(99), Err(NetError::Contract)));

        net.kill(1).unwrap();
        assert_eq!(net.slots[1].state, SlotState::Doomed);
    }

    #[test]
    fn test_zero_size_header_parks_slot_without_read() {
        // A header announcing an empty payload must go straight to
        // Available; a zero-length ring read would be mistaken for EOF.
        let mut net = started();
        let slot = &mut net.slots[0];
        slot.sock = Some(1);
        slot.state = SlotState::Payload;
        slot.header = FrameHeader::new(0, Codec::None);

        net.cycle().unwrap();
        assert_eq!(net.slots[0].state, SlotState::Available);
        assert_eq!(net.slots[0].payload(), b"");

        // Undo the fake socket so Drop does not close a real fd.
        net.slots[0].sock = None;
    }
}
