//! In-process transport over a tokio duplex pipe

use std::io;

use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

use super::Transport;

/// One end of an in-memory duplex channel
///
/// The other end is a plain [`DuplexStream`] that the peer (normally an
/// [`crate::server::SdsioServer`]) serves.
#[derive(Debug)]
pub struct MemTransport {
    stream: Option<DuplexStream>,
}

impl MemTransport {
    /// Create a connected pair: the client transport and the server end.
    #[must_use]
    pub fn pair(buffer_size: usize) -> (Self, DuplexStream) {
        let (client, server) = tokio::io::duplex(buffer_size);
        (
            Self {
                stream: Some(client),
            },
            server,
        )
    }
}

impl Transport for MemTransport {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    async fn open(&mut self) -> io::Result<(Self::Reader, Self::Writer)> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "memory transport already opened")
            })?;
        Ok(tokio::io::split(stream))
    }

    fn describe(&self) -> String {
        "mem".to_string()
    }
}
