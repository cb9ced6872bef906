//! Key-value storage types and traits

use std::future::Future;

/// Mode for opening a stored resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read an existing resource, error if not found
    Read,
    /// Create a new empty resource, error if one exists
    Write,
}

/// Errors that can occur in KV operations
#[derive(Debug, thiserror::Error)]
pub enum KVError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("path already exists: {0}")]
    Exists(String),

    #[error("storage error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// One stored resource, opened through a [`KVBuffers`] store
///
/// Holds the raw stream bytes; appends land in the backing store as they
/// arrive, `sync` makes them durable.
pub trait Resource: Send {
    /// Append `data` at the end.
    fn append(&mut self, data: &[u8]) -> Result<(), KVError>;

    /// Copy bytes starting at `offset` into `out`.
    ///
    /// Returns the number of bytes copied, 0 at or past the end.
    fn read_at(&mut self, offset: u64, out: &mut [u8]) -> Result<usize, KVError>;

    /// Bytes stored so far
    fn len(&self) -> u64;

    /// Flush appended data to the backing store.
    ///
    /// No-op for in-memory stores.
    fn sync(&mut self) -> Result<(), KVError>;
}

/// Trait for key-value storage backends
///
/// Each resource is identified by a flat string path.
pub trait KVBuffers: Send + Sync {
    type Resource: Resource;

    /// Open a resource at path with given mode.
    ///
    /// - Read: returns the existing resource, error if not found
    /// - Write: creates a new empty resource, error if it exists
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
    ) -> impl Future<Output = Result<Self::Resource, KVError>> + Send;

    /// Whether a resource exists at path
    fn exists(&self, path: &str) -> impl Future<Output = Result<bool, KVError>> + Send;
}
