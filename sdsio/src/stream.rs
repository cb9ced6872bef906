//! `embedded_io_async` adapters for open client streams
//!
//! Lets code written against the embedded byte-stream traits (codecs,
//! loggers) run unchanged on top of an SDSIO stream.

use embedded_io_async::{ErrorType, Read, Write};

use crate::client::{SdsioClient, StreamId};
use crate::error::SdsioError;

/// One open stream of a client, as an async byte reader/writer
///
/// The adapter does not own the stream; close it through the client.
#[derive(Debug, Clone, Copy)]
pub struct SdsioStream<'a> {
    client: &'a SdsioClient,
    id: StreamId,
}

impl<'a> SdsioStream<'a> {
    #[must_use]
    pub fn new(client: &'a SdsioClient, id: StreamId) -> Self {
        Self { client, id }
    }

    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }
}

impl ErrorType for SdsioStream<'_> {
    type Error = SdsioError;
}

impl Read for SdsioStream<'_> {
    /// End of stream reads as `Ok(0)`.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.client.read(self.id, buf).await {
            Err(SdsioError::Eos) => Ok(0),
            other => other,
        }
    }
}

impl Write for SdsioStream<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.client.write(self.id, buf).await
    }

    /// Frames are queued in order; nothing is acknowledged, so there is
    /// nothing to wait for.
    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
