//! Framing clients.
//!
//! [`Client`] speaks the length-prefixed protocol over any blocking
//! byte stream; the transport seam is the plain `Read + Write` pair, so
//! the plaintext and TLS variants differ only in how the stream is
//! built. [`StepClient`] is the non-blocking variant for integration
//! into an external event loop.

mod step;

pub use step::{Step, StepClient};

use crate::error::NetError;
use crate::frame::{Codec, FrameHeader, HEADER_SIZE};
pub use crate::frame::MAX_PAYLOAD_SIZE;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Plaintext connection settings.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
}

/// TLS connection settings. `domain` is the SNI name the peer
/// certificate is verified against.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub host: String,
    pub port: u16,
    pub domain: String,
}

pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| NetError::BadAddress(host.to_string()))?;
    Ok(SocketAddr::from((ip, port)))
}

/// Blocking framing client over a byte stream `S`.
pub struct Client<S> {
    stream: S,
}

/// Plaintext client.
pub type PlainClient = Client<TcpStream>;

/// Client running over a TLS 1.3 session.
pub type TlsClient = Client<StreamOwned<ClientConnection, TcpStream>>;

impl Client<TcpStream> {
    /// Connect a plaintext client.
    pub fn connect(settings: &ClientSettings) -> Result<Self, NetError> {
        let stream = TcpStream::connect(resolve(&settings.host, settings.port)?)?;
        debug!(host = %settings.host, port = settings.port, "connected");
        Ok(Self { stream })
    }

    /// Install receive and send timeouts on the socket.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), NetError> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))?;
        Ok(())
    }
}

impl Client<StreamOwned<ClientConnection, TcpStream>> {
    /// Connect and wrap the socket in a TLS 1.3 session, verifying the
    /// peer against the bundled trust roots under the SNI name from
    /// `settings.domain`.
    pub fn connect_tls(settings: &TlsSettings) -> Result<Self, NetError> {
        let sock = TcpStream::connect(resolve(&settings.host, settings.port)?)?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_root_certificates(roots)
            .with_no_client_auth();

        let name = ServerName::try_from(settings.domain.clone())
            .map_err(|_| NetError::BadAddress(settings.domain.clone()))?;
        let conn = ClientConnection::new(Arc::new(config), name)?;
        debug!(domain = %settings.domain, "tls session created");

        Ok(Self {
            stream: StreamOwned::new(conn, sock),
        })
    }

    /// Install receive and send timeouts on the underlying socket.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), NetError> {
        self.stream.sock.set_read_timeout(Some(timeout))?;
        self.stream.sock.set_write_timeout(Some(timeout))?;
        Ok(())
    }
}

impl<S: Read + Write> Client<S> {
    /// Send one framed message: the 9 header bytes, then the payload.
    /// Short writes are absorbed; an underlying error propagates
    /// immediately.
    pub fn send(&mut self, codec: Codec, payload: &[u8]) -> Result<(), NetError> {
        let header = FrameHeader::new(payload.len() as u64, codec).encode();
        self.stream.write_all(&header)?;
        self.stream.write_all(payload)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Receive one framed message: exactly 9 header bytes, then exactly
    /// `size` payload bytes. A short read or EOF aborts.
    pub fn recv(&mut self) -> Result<(FrameHeader, Vec<u8>), NetError> {
        let mut staged = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut staged)?;
        let header = FrameHeader::decode(&staged);

        if header.size > MAX_PAYLOAD_SIZE {
            return Err(NetError::Oversized(header.size));
        }

        let mut payload = vec![0u8; header.size as usize];
        self.stream.read_exact(&mut payload)?;
        Ok((header, payload))
    }

    /// Send every request, then receive one reply per request, in
    /// order. The first error stops further progress.
    pub fn roundtrip(
        &mut self,
        requests: &[(Codec, &[u8])],
    ) -> Result<Vec<(FrameHeader, Vec<u8>)>, NetError> {
        for (codec, payload) in requests {
            self.send(*codec, payload)?;
        }
        let mut replies = Vec::with_capacity(requests.len());
        for _ in requests {
            replies.push(self.recv()?);
        }
        Ok(replies)
    }

    /// Consume the client and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}
