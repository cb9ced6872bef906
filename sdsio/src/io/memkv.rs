//! In-memory implementation of KVBuffers

use super::buffer::Buffer;
use super::types::{KVBuffers, KVError, OpenMode, Resource};
use parking_lot::Mutex;
use std::collections::HashMap;

/// In-memory implementation of KVBuffers
///
/// Simple hash map based storage, useful for testing and for embedding a
/// server in the same process as the client. Opened resources are shared
/// [`Buffer`] views, so a recording is visible to readers while it grows.
#[derive(Debug, Default)]
pub struct MemKV {
    buffers: Mutex<HashMap<String, Buffer>>,
}

impl MemKV {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KVBuffers for MemKV {
    type Resource = Buffer;

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Buffer, KVError> {
        let mut buffers = self.buffers.lock();

        match mode {
            OpenMode::Read => buffers
                .get(path)
                .cloned()
                .ok_or_else(|| KVError::NotFound(path.to_string())),
            OpenMode::Write => {
                if buffers.contains_key(path) {
                    return Err(KVError::Exists(path.to_string()));
                }
                let buffer = Buffer::new();
                buffers.insert(path.to_string(), buffer.clone());
                Ok(buffer)
            }
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, KVError> {
        Ok(self.buffers.lock().contains_key(path))
    }
}

impl Resource for Buffer {
    fn append(&mut self, data: &[u8]) -> Result<(), KVError> {
        Buffer::append(self, data);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, out: &mut [u8]) -> Result<usize, KVError> {
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        Ok(Buffer::read_at(self, offset, out))
    }

    fn len(&self) -> u64 {
        Buffer::len(self) as u64
    }

    fn sync(&mut self) -> Result<(), KVError> {
        Ok(())
    }
}
