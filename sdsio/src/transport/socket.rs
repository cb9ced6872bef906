//! TCP socket transport

use std::io;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::Transport;

/// Default SDSIO server port
pub const DEFAULT_PORT: u16 = 5050;

#[derive(Debug, Clone)]
pub struct SocketTransport {
    addr: String,
}

impl SocketTransport {
    /// `addr` is anything `TcpStream::connect` accepts, e.g. `"192.168.1.7:5050"`.
    #[must_use]
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }
}

impl Transport for SocketTransport {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    async fn open(&mut self) -> io::Result<(Self::Reader, Self::Writer)> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "socket transport connected");
        Ok(stream.into_split())
    }

    fn describe(&self) -> String {
        format!("socket {}", self.addr)
    }
}
