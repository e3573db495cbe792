//! Crate-wide error type.

use std::io;

/// Errors surfaced by the server core and the framing clients.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The caller broke an API contract: wrong slot state, out-of-range
    /// id, stepping a client in the wrong phase, or cycling a server
    /// that was never started. Nothing was mutated.
    #[error("operation not valid in the current state")]
    Contract,

    /// A peer announced a frame larger than the receive cap; refused
    /// before any allocation.
    #[error("announced payload of {0} bytes exceeds the receive cap")]
    Oversized(u64),

    /// Host string is not an IPv4 dotted-quad literal. Hostname
    /// resolution is out of scope.
    #[error("host is not an IPv4 literal: {0}")]
    BadAddress(String),

    /// TLS session setup failed.
    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),

    /// Propagated system error from socket or ring operations.
    #[error(transparent)]
    Io(#[from] io::Error),
}
