//! Directory-backed implementation of `KVBuffers`
//!
//! Every path is one flat file under the root directory holding the raw
//! stream bytes. A write-mode resource keeps its file open in append mode
//! and hands each payload to the file as it arrives, so an interrupted
//! recording keeps everything received up to that point.

use super::types::{KVBuffers, KVError, OpenMode, Resource};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

fn io_error(path: &str, source: std::io::Error) -> KVError {
    KVError::Io {
        path: path.to_string(),
        source,
    }
}

#[derive(Debug)]
pub struct DirKV {
    root: PathBuf,
}

impl DirKV {
    /// Create a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, KVError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| io_error(&root.display().to_string(), e))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl KVBuffers for DirKV {
    type Resource = DirFile;

    async fn open(&self, path: &str, mode: OpenMode) -> Result<DirFile, KVError> {
        let file_path = self.file_path(path);
        let opened = match mode {
            OpenMode::Read => File::open(&file_path),
            OpenMode::Write => OpenOptions::new()
                .append(true)
                .create_new(true)
                .open(&file_path),
        };
        let file = opened.map_err(|e| match e.kind() {
            ErrorKind::NotFound => KVError::NotFound(path.to_string()),
            ErrorKind::AlreadyExists => KVError::Exists(path.to_string()),
            _ => io_error(path, e),
        })?;
        let len = file.metadata().map_err(|e| io_error(path, e))?.len();
        debug!(path, ?mode, len, "file opened");
        Ok(DirFile {
            path: path.to_string(),
            file,
            len,
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, KVError> {
        self.file_path(path)
            .try_exists()
            .map_err(|e| io_error(path, e))
    }
}

/// An open file of a [`DirKV`] store
#[derive(Debug)]
pub struct DirFile {
    path: String,
    file: File,
    len: u64,
}

impl Resource for DirFile {
    fn append(&mut self, data: &[u8]) -> Result<(), KVError> {
        self.file
            .write_all(data)
            .map_err(|e| io_error(&self.path, e))?;
        self.len += data.len() as u64;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, out: &mut [u8]) -> Result<usize, KVError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| io_error(&self.path, e))?;
        let mut filled = 0;
        while filled < out.len() {
            match self.file.read(&mut out[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(io_error(&self.path, e)),
            }
        }
        Ok(filled)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn sync(&mut self) -> Result<(), KVError> {
        self.file.sync_data().map_err(|e| io_error(&self.path, e))
    }
}
