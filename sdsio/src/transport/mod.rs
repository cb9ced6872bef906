//! Transport byte channels
//!
//! A transport is the capability set {open, close, send, receive} over one
//! duplex byte stream. `open` hands back the two halves; send/receive are
//! the halves' `AsyncWrite`/`AsyncRead`, close is shutting the writer down.
//! The concrete transport is a generic parameter chosen when the client is
//! built, not a trait object.

mod mem;
#[cfg(feature = "serial")]
mod serial;
mod socket;

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

pub use mem::MemTransport;
#[cfg(feature = "serial")]
pub use serial::SerialTransport;
pub use socket::{SocketTransport, DEFAULT_PORT};

pub trait Transport: Send {
    /// Receive half
    type Reader: AsyncRead + Unpin + Send + 'static;
    /// Send half
    type Writer: AsyncWrite + Unpin + Send + 'static;

    /// Establish the channel.
    ///
    /// Fails when the peer cannot be reached.
    fn open(&mut self) -> impl Future<Output = io::Result<(Self::Reader, Self::Writer)>> + Send;

    /// Human-readable endpoint, for logs
    fn describe(&self) -> String;
}
