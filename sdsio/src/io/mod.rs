//! Backing storage for server-side streams
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  SdsioServer (demultiplexer)        │
//! │  - stream id -> resource + cursor   │
//! └─────────────────────────────────────┘
//!          ▲
//!          │ append() for Write frames
//!          │ read_at() for Read frames
//!          ▼
//! ┌─────────────────────────────────────┐
//! │  Resource (one stored stream)       │
//! │  - Buffer: Arc<Mutex<Vec<u8>>>      │
//! │  - DirFile: open file on disk       │
//! └─────────────────────────────────────┘
//!          ▲
//!          │ created by
//!          ▼
//! ┌─────────────────────────────────────┐
//! │  KVBuffers (storage registry)       │
//! │  - names resources by path          │
//! └─────────────────────────────────────┘
//!      ▲              ▲
//!      │              │
//!   MemKV           DirKV
//! ```

pub mod buffer;
pub mod dirkv;
pub mod memkv;
pub mod types;

pub use buffer::{Buffer, BufferReadGuard};
pub use dirkv::{DirFile, DirKV};
pub use memkv::MemKV;
pub use types::{KVBuffers, KVError, OpenMode, Resource};
