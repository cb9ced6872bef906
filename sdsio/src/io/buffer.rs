//! Shared buffer with internal locking

use parking_lot::{Mutex, MutexGuard};
use std::ops::Deref;
use std::sync::Arc;

/// Read-only guard to buffer contents
///
/// The lock is released when the guard is dropped.
pub struct BufferReadGuard<'a>(MutexGuard<'a, Vec<u8>>);

impl Deref for BufferReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for BufferReadGuard<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Shared byte buffer holding the contents of one stored resource
///
/// Backed by `Arc<Mutex<Vec<u8>>>`; clones share the same data. The content
/// is the raw byte sequence of the stream, no framing is ever stored.
///
/// # Example
///
/// ```
/// use sdsio::io::Buffer;
///
/// let buffer = Buffer::new();
/// buffer.append(b"hello");
///
/// let mut out = [0u8; 3];
/// assert_eq!(buffer.read_at(2, &mut out), 3);
/// assert_eq!(&out, b"llo");
/// ```
#[derive(Clone, Default)]
pub struct Buffer(Arc<Mutex<Vec<u8>>>);

impl Buffer {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    /// Append data to the end of the buffer
    pub fn append(&self, data: &[u8]) {
        self.0.lock().extend_from_slice(data);
    }

    /// Copy bytes starting at `offset` into `out`.
    ///
    /// Returns the number of bytes copied, 0 once `offset` is at or past the end.
    #[must_use]
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> usize {
        let data = self.0.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = out.len().min(data.len() - offset);
        out[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Lock the buffer for reading
    ///
    /// The lock is held until the guard is dropped.
    #[must_use]
    pub fn lock(&self) -> BufferReadGuard<'_> {
        BufferReadGuard(self.0.lock())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len()).finish()
    }
}
