//! kestrel: a length-prefixed request/response TCP server.
//!
//! The server multiplexes many connections over one io_uring instance
//! and a fixed client slot table; completed requests are handed to the
//! application through a small claim/respond API. The companion
//! clients speak the same framing over a blocking socket (plaintext or
//! TLS 1.3) or as a stepwise non-blocking state machine for external
//! event loops.
//!
//! One framed message is a 9-byte little-endian header `{size, codec}`
//! followed by `size` payload bytes. A connection carries strictly
//! alternating requests and responses; the only backpressure is the
//! fixed slot table.

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod server;

pub use client::{Client, ClientSettings, PlainClient, Step, StepClient, TlsClient, TlsSettings};
pub use error::NetError;
pub use frame::{Codec, FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use server::{ClientSlot, Networker, Settings, SlotState};
