//! SDS I/O: record and play back sensor data streams over one channel
//!
//! - [`ring_buffer`]: lock-free SPSC byte ring between the real-time side
//!   and the I/O side
//! - [`client`]: Open/Close/Read/Write over a framed, multiplexed channel
//! - [`server`]: host-side demultiplexer storing streams through [`io`]
//! - [`recplay`]: slots binding a ring buffer to a stream

pub mod client;
pub mod config;
pub mod error;
pub mod idgen;
pub mod io;
pub mod protocol;
pub mod record;
pub mod recplay;
pub mod ring_buffer;
pub mod server;
pub mod stream;
pub mod transport;

pub use client::{SdsioClient, StreamId};
pub use config::{Config, ConfigError, RecPlayConfig, SdsioConfig, SlotConfig};
pub use error::{Mode, SdsioError, SdsioResult, SDSIO_OK};
pub use io::{Buffer, DirFile, DirKV, KVBuffers, KVError, MemKV, OpenMode, Resource};
pub use protocol::{Command, Frame, FrameError};
pub use record::RecordHeader;
pub use recplay::{Direction, Player, RecPlay, Recorder, SlotState, SlotStats};
pub use ring_buffer::{
    Consumer, OverrunPolicy, Producer, RingBuffer, RingBufferConfig, RingBufferError,
};
pub use server::{SdsioServer, ServerError};
pub use stream::SdsioStream;
pub use transport::{MemTransport, SocketTransport, Transport};
#[cfg(feature = "serial")]
pub use transport::SerialTransport;
