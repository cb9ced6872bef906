//! SDSIO frame codec
//!
//! ```text
//! +-------------+-------------+--------------+---------------+------------------+
//! | command u32 | stream u32  | argument u32 | data_size u32 | data[data_size]  |
//! +-------------+-------------+--------------+---------------+------------------+
//!   all header fields little-endian, 16 bytes total
//! ```
//!
//! | command | request argument | reply argument        | reply payload |
//! |---------|------------------|-----------------------|---------------|
//! | Open    | mode             | mode (stream 0=fail)  | -             |
//! | Close   | 0                | status                | -             |
//! | Write   | 0                | (no reply)            | -             |
//! | Read    | requested length | status                | bytes read    |
//! | Eos     | -                | 0                     | -             |

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Mode;

pub const HEADER_SIZE: usize = 16;

/// Stream id meaning "no stream"; never assigned by the server
pub const INVALID_STREAM: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Open = 1,
    Close = 2,
    Write = 3,
    Read = 4,
    Eos = 5,
}

impl Command {
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Open),
            2 => Some(Self::Close),
            3 => Some(Self::Write),
            4 => Some(Self::Read),
            5 => Some(Self::Eos),
            _ => None,
        }
    }
}

/// Errors raised while decoding the byte stream
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown command {0}")]
    UnknownCommand(u32),

    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("channel closed")]
    Closed,

    #[error("channel closed inside a frame, {0} bytes dropped")]
    Truncated(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub stream: u32,
    pub argument: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn open(name: &str, mode: Mode) -> Self {
        let mut payload = Vec::with_capacity(name.len() + 1);
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        Self {
            command: Command::Open,
            stream: INVALID_STREAM,
            argument: mode.as_u32(),
            payload,
        }
    }

    #[must_use]
    pub fn open_reply(stream: u32, mode: u32) -> Self {
        Self {
            command: Command::Open,
            stream,
            argument: mode,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn close(stream: u32) -> Self {
        Self {
            command: Command::Close,
            stream,
            argument: 0,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn close_reply(stream: u32, status: i32) -> Self {
        Self {
            command: Command::Close,
            stream,
            argument: status_to_wire(status),
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn write(stream: u32, data: &[u8]) -> Self {
        Self {
            command: Command::Write,
            stream,
            argument: 0,
            payload: data.to_vec(),
        }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn read(stream: u32, len: usize) -> Self {
        Self {
            command: Command::Read,
            stream,
            argument: len as u32,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn read_reply(stream: u32, status: i32, data: Vec<u8>) -> Self {
        Self {
            command: Command::Read,
            stream,
            argument: status_to_wire(status),
            payload: data,
        }
    }

    #[must_use]
    pub fn eos(stream: u32) -> Self {
        Self {
            command: Command::Eos,
            stream,
            argument: 0,
            payload: Vec::new(),
        }
    }

    /// Status carried in the argument of a Read/Close reply
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn status(&self) -> i32 {
        self.argument as i32
    }

    /// Stream name of an Open request, up to the first NUL
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        let end = self
            .payload
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.payload.len());
        std::str::from_utf8(&self.payload[..end]).ok()
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&(self.command as u32).to_le_bytes());
        buf.extend_from_slice(&self.stream.to_le_bytes());
        buf.extend_from_slice(&self.argument.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

#[allow(clippy::cast_sign_loss)]
fn status_to_wire(status: i32) -> u32 {
    status as u32
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Incremental frame decoder
///
/// Bytes arrive in arbitrary chunks from the transport; `push` them in and
/// `next_frame` out once a whole header plus payload has accumulated.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::with_capacity(HEADER_SIZE + max_payload),
            max_payload,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame.
    ///
    /// # Errors
    /// A malformed header (unknown command, oversized payload) is a
    /// transport error; the decoder must not be used afterwards.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let raw_command = le_u32(&self.buf[0..4]);
        let command =
            Command::from_u32(raw_command).ok_or(FrameError::UnknownCommand(raw_command))?;
        let size = le_u32(&self.buf[12..16]) as usize;
        if size > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: self.max_payload,
            });
        }
        if self.buf.len() < HEADER_SIZE + size {
            return Ok(None);
        }

        let frame = Frame {
            command,
            stream: le_u32(&self.buf[4..8]),
            argument: le_u32(&self.buf[8..12]),
            payload: self.buf[HEADER_SIZE..HEADER_SIZE + size].to_vec(),
        };
        self.buf.drain(..HEADER_SIZE + size);
        Ok(Some(frame))
    }

    /// Number of buffered bytes not yet returned as a frame
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Pulls frames off an `AsyncRead`, using a [`FrameDecoder`] internally
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: tokio::io::AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_payload: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(max_payload),
            chunk: vec![0u8; 8192],
        }
    }

    /// Wait for the next frame.
    ///
    /// # Errors
    /// `FrameError::Closed` once the peer disconnected between frames,
    /// `FrameError::Truncated` if it disconnected inside one, or any
    /// decode/IO error.
    pub async fn next(&mut self) -> Result<Frame, FrameError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }
            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                return match self.decoder.pending() {
                    0 => Err(FrameError::Closed),
                    partial => Err(FrameError::Truncated(partial)),
                };
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }
}

/// Transmit one frame completely before returning
///
/// # Errors
/// Returns the underlying IO error.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await
}
