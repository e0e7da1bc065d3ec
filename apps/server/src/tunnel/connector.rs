//! Destination connector
//!
//! Resolves a `PipeInfo` and opens the outbound TCP connection for a session.

use std::net::SocketAddr;

use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;
use ws_pipe_common::{PipeError, PipeInfo, Result};

/// Opens TCP connections to handshake destinations
#[derive(Debug, Clone, Copy, Default)]
pub struct DestinationConnector;

impl DestinationConnector {
    pub fn new() -> Self {
        Self
    }

    /// Resolve `info` and connect to it, enabling `SO_KEEPALIVE` on request
    ///
    /// The socket is dropped (and so closed) on every failure path; on
    /// success the caller owns the connected stream.
    pub async fn connect(&self, info: &mut PipeInfo) -> Result<TcpStream> {
        let ip = info.resolve().await?;
        let addr = SocketAddr::new(ip, info.port());
        debug!(destination = %info, "Connecting");

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| PipeError::connect(addr, e))?;

        if info.keep_alive() {
            socket
                .set_keepalive(true)
                .map_err(|e| PipeError::connect(addr, e))?;
        }

        let stream = socket
            .connect(addr)
            .await
            .map_err(|e| PipeError::connect(addr, e))?;

        // A stream without a peer is not usable as a destination
        stream
            .peer_addr()
            .map_err(|e| PipeError::connect(addr, e))?;

        Ok(stream)
    }
}
