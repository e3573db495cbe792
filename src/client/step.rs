//! Stepwise non-blocking framing client.
//!
//! One request/response exchange is a five-state machine driven by
//! [`StepClient::step`], each call performing at most one read or
//! write attempt on the non-blocking socket. `WouldBlock` is simply no
//! progress; the host event loop decides when to step again and owns
//! deadline enforcement.

use crate::client::{resolve, ClientSettings, MAX_PAYLOAD_SIZE};
use crate::error::NetError;
use crate::frame::{Codec, FrameHeader, HEADER_SIZE};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::debug;

/// Phase of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// No exchange in progress; seed one with
    /// [`begin`](StepClient::begin).
    Inactive,
    /// Writing the 9 outbound header bytes.
    SendHeader,
    /// Writing the outbound payload.
    SendPayload,
    /// Reading the 9 inbound header bytes.
    RecvHeader,
    /// Reading the inbound payload.
    RecvPayload,
    /// Response fully assembled; collect it with
    /// [`take`](StepClient::take).
    Done,
}

/// Non-blocking framing client for an external event loop.
pub struct StepClient {
    stream: TcpStream,
    state: Step,
    out_header: FrameHeader,
    input: Vec<u8>,
    written: usize,
    staged: [u8; HEADER_SIZE],
    read_n: usize,
    in_header: FrameHeader,
    output: Vec<u8>,
    timeout: Option<Duration>,
}

impl StepClient {
    /// Connect and switch the socket to non-blocking mode.
    pub fn connect(settings: &ClientSettings) -> Result<Self, NetError> {
        let stream = TcpStream::connect(resolve(&settings.host, settings.port)?)?;
        stream.set_nonblocking(true)?;
        debug!(host = %settings.host, port = settings.port, "connected (non-blocking)");
        Ok(Self {
            stream,
            state: Step::Inactive,
            out_header: FrameHeader::default(),
            input: Vec::new(),
            written: 0,
            staged: [0u8; HEADER_SIZE],
            read_n: 0,
            in_header: FrameHeader::default(),
            output: Vec::new(),
            timeout: None,
        })
    }

    /// Current phase of the machine.
    pub fn state(&self) -> Step {
        self.state
    }

    /// Store a deadline for the host event loop to enforce. No timer
    /// is scheduled here.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Seed the machine with an outbound request and perform one step
    /// immediately. Rejected while an exchange is in progress.
    pub fn begin(&mut self, codec: Codec, payload: Vec<u8>) -> Result<Step, NetError> {
        if self.state != Step::Inactive {
            return Err(NetError::Contract);
        }
        self.out_header = FrameHeader::new(payload.len() as u64, codec);
        self.input = payload;
        self.written = 0;
        self.read_n = 0;
        self.state = Step::SendHeader;
        self.step()
    }

    /// Advance the exchange by at most one I/O attempt and return the
    /// resulting phase. `WouldBlock` leaves the phase untouched; any
    /// other I/O failure cancels the exchange and resets the machine.
    pub fn step(&mut self) -> Result<Step, NetError> {
        match self.state {
            Step::Inactive | Step::Done => {}
            Step::SendHeader => {
                // Rebuilt on every entry from a transient stack buffer;
                // this state is almost always left after one write.
                let staged = self.out_header.encode();
                match self.stream.write(&staged[self.written..]) {
                    Ok(n) => {
                        self.written += n;
                        if self.written == HEADER_SIZE {
                            self.written = 0;
                            self.state = if self.out_header.size == 0 {
                                Step::RecvHeader
                            } else {
                                Step::SendPayload
                            };
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(self.cancel(e)),
                }
            }
            Step::SendPayload => match self.stream.write(&self.input[self.written..]) {
                Ok(n) => {
                    self.written += n;
                    if self.written == self.input.len() {
                        self.written = 0;
                        self.state = Step::RecvHeader;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(self.cancel(e)),
            },
            Step::RecvHeader => match self.stream.read(&mut self.staged[self.read_n..]) {
                Ok(0) => {
                    return Err(self.cancel(io::ErrorKind::UnexpectedEof.into()));
                }
                Ok(n) => {
                    self.read_n += n;
                    if self.read_n == HEADER_SIZE {
                        self.in_header = FrameHeader::decode(&self.staged);
                        self.read_n = 0;
                        if self.in_header.size > MAX_PAYLOAD_SIZE {
                            let size = self.in_header.size;
                            self.reset();
                            return Err(NetError::Oversized(size));
                        }
                        if self.in_header.size == 0 {
                            self.output = Vec::new();
                            self.state = Step::Done;
                        } else {
                            self.output = vec![0u8; self.in_header.size as usize];
                            self.state = Step::RecvPayload;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(self.cancel(e)),
            },
            Step::RecvPayload => match self.stream.read(&mut self.output[self.read_n..]) {
                Ok(0) => {
                    return Err(self.cancel(io::ErrorKind::UnexpectedEof.into()));
                }
                Ok(n) => {
                    self.read_n += n;
                    if self.read_n == self.output.len() {
                        self.read_n = 0;
                        self.state = Step::Done;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(self.cancel(e)),
            },
        }
        Ok(self.state)
    }

    /// Hand over the assembled response and return the machine to
    /// `Inactive`. Legal only in `Done`.
    pub fn take(&mut self) -> Result<(FrameHeader, Vec<u8>), NetError> {
        if self.state != Step::Done {
            return Err(NetError::Contract);
        }
        let header = self.in_header;
        let output = std::mem::take(&mut self.output);
        self.input = Vec::new();
        self.state = Step::Inactive;
        Ok((header, output))
    }

    fn cancel(&mut self, err: io::Error) -> NetError {
        debug!(error = %err, "exchange cancelled");
        self.reset();
        NetError::Io(err)
    }

    fn reset(&mut self) {
        self.written = 0;
        self.read_n = 0;
        self.input = Vec::new();
        self.output = Vec::new();
        self.state = Step::Inactive;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    fn pair() -> (StepClient, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = StepClient::connect(&ClientSettings {
            host: addr.ip().to_string(),
            port: addr.port(),
        })
        .expect("connect");
        let (peer, _) = listener.accept().expect("accept");
        (client, peer)
    }

    fn drive(client: &mut StepClient) -> Result<Step, NetError> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let state = client.step()?;
            if state == Step::Done {
                return Ok(state);
            }
            if Instant::now() > deadline {
                return Ok(state);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_take_requires_done() {
        let (mut client, _peer) = pair();
        assert!(matches!(client.take(), Err(NetError::Contract)));
    }

    #[test]
    fn test_timeout_is_stored_not_scheduled() {
        let (mut client, _peer) = pair();
        assert_eq!(client.timeout(), None);

        client.set_timeout(Duration::from_micros(1));
        assert_eq!(client.timeout(), Some(Duration::from_micros(1)));

        // No deadline is enforced here: a fresh exchange still makes
        // progress long after the stored timeout elapsed.
        thread::sleep(Duration::from_millis(5));
        let state = client.begin(Codec::None, b"PING".to_vec()).unwrap();
        assert_ne!(state, Step::Inactive);
    }

    #[test]
    fn test_begin_rejects_exchange_in_progress() {
        let (mut client, _peer) = pair();
        client.begin(Codec::None, b"PING".to_vec()).unwrap();
        assert!(matches!(
            client.begin(Codec::None, b"PING".to_vec()),
            Err(NetError::Contract)
        ));
    }

    #[test]
    fn test_full_exchange() {
        let (mut client, mut peer) = pair();
        client.begin(Codec::Lz4, b"PING".to_vec()).unwrap();

        // Echo a reply from the peer side.
        let handle = thread::spawn(move || {
            let mut reply = FrameHeader::new(4, Codec::Lz4).encode().to_vec();
            reply.extend_from_slice(b"PONG");
            peer.write_all(&reply).expect("reply");
            peer
        });

        assert_eq!(drive(&mut client).unwrap(), Step::Done);
        let (header, payload) = client.take().unwrap();
        assert_eq!(header.size, 4);
        assert_eq!(header.codec, Codec::Lz4.tag());
        assert_eq!(payload, b"PONG");
        assert_eq!(client.state(), Step::Inactive);
        let _ = handle.join();
    }

    #[test]
    fn test_zero_size_request_skips_payload_phase() {
        let (mut client, mut peer) = pair();
        let state = client.begin(Codec::None, Vec::new()).unwrap();
        // The header write is one-shot on a fresh socket, and an empty
        // request has no payload phase.
        assert_eq!(state, Step::RecvHeader);

        peer.write_all(&FrameHeader::new(0, Codec::None).encode())
            .expect("reply");
        assert_eq!(drive(&mut client).unwrap(), Step::Done);
        let (header, payload) = client.take().unwrap();
        assert_eq!(header.size, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_oversized_reply_rejected_before_allocation() {
        let (mut client, mut peer) = pair();
        client.begin(Codec::None, b"x".to_vec()).unwrap();

        peer.write_all(&FrameHeader::new(MAX_PAYLOAD_SIZE + 1, Codec::None).encode())
            .expect("reply");

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match client.step() {
                Ok(_) if Instant::now() > deadline => panic!("no rejection"),
                Ok(_) => thread::sleep(Duration::from_millis(1)),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, NetError::Oversized(_)));
        assert_eq!(client.state(), Step::Inactive);
    }

    #[test]
    fn test_peer_close_cancels_exchange() {
        let (mut client, peer) = pair();
        client.begin(Codec::None, b"x".to_vec()).unwrap();
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match client.step() {
                Ok(_) if Instant::now() > deadline => panic!("no cancellation"),
                Ok(_) => thread::sleep(Duration::from_millis(1)),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, NetError::Io(_)));
        assert_eq!(client.state(), Step::Inactive);
    }
}
