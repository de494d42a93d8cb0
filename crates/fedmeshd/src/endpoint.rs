//! Datagram endpoint — one bound UDP socket, one JSON frame per datagram.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use fedmesh_core::config::NetworkConfig;
use fedmesh_core::wire::{Frame, WireError, RECV_BUFFER};

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot resolve address {0:?}")]
    Address(String),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

pub struct Endpoint {
    socket: UdpSocket,
    local: SocketAddr,
    /// `local` rendered once; used as the `source` of every outbound frame.
    address: String,
}

impl Endpoint {
    pub async fn bind(config: &NetworkConfig) -> Result<Self, EndpointError> {
        let bind_err = |source| EndpointError::Bind {
            addr: config.bind_addr.clone(),
            source,
        };
        let addr = resolve(&config.bind_addr).await?;

        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
        if config.recv_buffer_bytes > 0 {
            // Best effort; the kernel may clamp it.
            if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_bytes) {
                tracing::debug!(error = %e, "SO_RCVBUF not applied");
            }
        }
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;

        let socket = UdpSocket::from_std(socket.into()).map_err(bind_err)?;
        let local = socket.local_addr()?;
        tracing::info!(%local, "endpoint bound");

        Ok(Self {
            socket,
            local,
            address: local.to_string(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn send(&self, destination: &str, frame: &Frame) -> Result<(), EndpointError> {
        let bytes = frame.encode()?;
        let peer = resolve(destination).await?;
        let written = self.socket.send_to(&bytes, peer).await?;
        if written != bytes.len() {
            return Err(EndpointError::ShortWrite {
                written,
                expected: bytes.len(),
            });
        }
        tracing::trace!(%peer, kind = %frame.kind, len = written, "frame sent");
        Ok(())
    }

    /// Wait for the next datagram. Undecodable datagrams surface as
    /// [`EndpointError::Wire`]; the caller decides whether to keep going.
    pub async fn recv(&self) -> Result<(Frame, SocketAddr), EndpointError> {
        let mut buf = vec![0u8; RECV_BUFFER];
        let (len, peer) = self.socket.recv_from(&mut buf).await?;
        let frame = Frame::decode(&buf[..len])?;
        tracing::trace!(%peer, kind = %frame.kind, len, "frame received");
        Ok((frame, peer))
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, EndpointError> {
    if let Ok(parsed) = addr.parse() {
        return Ok(parsed);
    }
    tokio::net::lookup_host(addr)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| EndpointError::Address(addr.to_string()))
}
