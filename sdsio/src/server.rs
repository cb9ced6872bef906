//! SDSIO server demultiplexer
//!
//! Host-side counterpart of the client. Maps stream ids to stored
//! resources and answers each request frame on its own; replies are keyed
//! by stream id, so the client can have requests outstanding on many
//! streams at once. Read never waits for data: it answers with what is
//! stored, or EOS, straight away.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace, warn};

use crate::error::{Mode, SdsioError, SDSIO_OK};
use crate::idgen::IdGen;
use crate::io::{KVBuffers, KVError, OpenMode, Resource};
use crate::protocol::{write_frame, Command, Frame, FrameError, FrameReader, INVALID_STREAM};

/// Extension of stored stream files
pub const SDS_EXTENSION: &str = "sds";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("failed to send reply: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] KVError),
}

/// Whether `name` may be used as a stream name
///
/// Names become file names, so control characters and characters that are
/// special in paths are rejected.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    const INVALID: &[char] = &['"', '*', '/', ':', '<', '>', '?', '\\', '|'];
    !name.is_empty() && !name.chars().any(|c| c.is_ascii_control() || INVALID.contains(&c))
}

/// Resource path of recording `index` of stream `name`
#[must_use]
pub fn resource_path(name: &str, index: u32) -> String {
    format!("{name}.{index}.{SDS_EXTENSION}")
}

struct ServerStream<R> {
    name: String,
    mode: Mode,
    path: String,
    resource: R,
    cursor: u64,
    /// A payload could not be stored; Close reports it
    failed: bool,
}

pub struct SdsioServer<K: KVBuffers> {
    kv: K,
    streams: HashMap<u32, ServerStream<K::Resource>>,
    ids: IdGen,
    /// Read-mode opens per name so far; selects the next recording to play
    playback: HashMap<String, u32>,
    max_payload: usize,
}

impl<K: KVBuffers> SdsioServer<K> {
    #[must_use]
    pub fn new(kv: K, max_payload: usize) -> Self {
        Self {
            kv,
            streams: HashMap::new(),
            ids: IdGen::new(),
            playback: HashMap::new(),
            max_payload,
        }
    }

    #[must_use]
    pub fn kv(&self) -> &K {
        &self.kv
    }

    /// Number of currently open streams
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Handle one request frame, returning the reply if the command has one.
    pub async fn execute(&mut self, frame: Frame) -> Option<Frame> {
        trace!(
            command = ?frame.command,
            stream = frame.stream,
            size = frame.payload.len(),
            "request"
        );
        match frame.command {
            Command::Open => Some(self.open(&frame).await),
            Command::Write => {
                self.write(&frame);
                None
            }
            Command::Read => Some(self.read(&frame)),
            Command::Close => Some(self.close(frame.stream).await),
            Command::Eos => {
                warn!(stream = frame.stream, "ignoring EOS sent by client");
                None
            }
        }
    }

    async fn open(&mut self, frame: &Frame) -> Frame {
        let refuse = Frame::open_reply(INVALID_STREAM, frame.argument);
        let Some(mode) = Mode::from_u32(frame.argument) else {
            warn!(mode = frame.argument, "open with unknown mode");
            return refuse;
        };
        let Some(name) = frame.name().filter(|n| is_valid_name(n)) else {
            warn!("open with invalid stream name");
            return refuse;
        };

        let opened = match mode {
            Mode::Write => self.open_for_write(name).await,
            Mode::Read => self.open_for_read(name).await,
        };
        match opened {
            Ok((path, resource)) => {
                let id = self.ids.get_next();
                info!(stream = name, %mode, id, path = %path, "stream opened");
                self.streams.insert(
                    id,
                    ServerStream {
                        name: name.to_string(),
                        mode,
                        path,
                        resource,
                        cursor: 0,
                        failed: false,
                    },
                );
                Frame::open_reply(id, frame.argument)
            }
            Err(e) => {
                warn!(stream = name, %mode, error = %e, "open failed");
                refuse
            }
        }
    }

    /// Create the first free `<name>.<index>.sds`, never overwriting.
    async fn open_for_write(&self, name: &str) -> Result<(String, K::Resource), KVError> {
        let mut index = 0;
        loop {
            let path = resource_path(name, index);
            let taken = self.kv.exists(&path).await?
                || self.streams.values().any(|s| s.path == path);
            if !taken {
                match self.kv.open(&path, OpenMode::Write).await {
                    Ok(resource) => return Ok((path, resource)),
                    // Created behind our back since `exists`.
                    Err(KVError::Exists(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            index += 1;
        }
    }

    /// Open the recording after the one played last for this name.
    async fn open_for_read(&mut self, name: &str) -> Result<(String, K::Resource), KVError> {
        let index = self.playback.get(name).copied().unwrap_or(0);
        let path = resource_path(name, index);
        let resource = self.kv.open(&path, OpenMode::Read).await?;
        self.playback.insert(name.to_string(), index + 1);
        Ok((path, resource))
    }

    fn write(&mut self, frame: &Frame) {
        match self.streams.get_mut(&frame.stream) {
            Some(stream) if stream.mode == Mode::Write => {
                if stream.failed {
                    return;
                }
                match stream.resource.append(&frame.payload) {
                    Ok(()) => {
                        trace!(stream = %stream.name, bytes = frame.payload.len(), "appended");
                    }
                    Err(e) => {
                        warn!(stream = %stream.name, error = %e, "append failed");
                        stream.failed = true;
                    }
                }
            }
            Some(stream) => warn!(stream = %stream.name, "write to a read stream dropped"),
            None => warn!(stream = frame.stream, "write to unknown stream dropped"),
        }
    }

    fn read(&mut self, frame: &Frame) -> Frame {
        let Some(stream) = self.streams.get_mut(&frame.stream) else {
            warn!(stream = frame.stream, "read from unknown stream");
            return Frame::read_reply(frame.stream, SdsioError::Parameter.code(), Vec::new());
        };
        if stream.mode != Mode::Read {
            warn!(stream = %stream.name, "read from a write stream");
            return Frame::read_reply(frame.stream, SdsioError::Parameter.code(), Vec::new());
        }

        let len = (frame.argument as usize).min(self.max_payload);
        let mut data = vec![0u8; len];
        let n = match stream.resource.read_at(stream.cursor, &mut data) {
            Ok(n) => n,
            Err(e) => {
                warn!(stream = %stream.name, error = %e, "read failed");
                return Frame::read_reply(frame.stream, SdsioError::Error.code(), Vec::new());
            }
        };
        if n == 0 && len > 0 {
            debug!(stream = %stream.name, "end of stream");
            return Frame::eos(frame.stream);
        }
        data.truncate(n);
        stream.cursor += n as u64;
        Frame::read_reply(frame.stream, SDSIO_OK, data)
    }

    async fn close(&mut self, id: u32) -> Frame {
        let Some(mut stream) = self.streams.remove(&id) else {
            warn!(stream = id, "close of unknown stream");
            return Frame::close_reply(id, SdsioError::Parameter.code());
        };
        let synced = match stream.mode {
            Mode::Write => stream.resource.sync(),
            Mode::Read => Ok(()),
        };
        let bytes = stream.resource.len();
        match synced {
            Ok(()) if !stream.failed => {
                info!(stream = %stream.name, id, bytes, "stream closed");
                Frame::close_reply(id, SDSIO_OK)
            }
            Ok(()) => {
                warn!(stream = %stream.name, id, bytes, "stream closed with lost data");
                Frame::close_reply(id, SdsioError::Error.code())
            }
            Err(e) => {
                warn!(stream = %stream.name, error = %e, "sync on close failed");
                Frame::close_reply(id, SdsioError::Error.code())
            }
        }
    }

    /// Close every open stream, flushing recordings.
    pub async fn clear(&mut self) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            self.close(id).await;
        }
        self.playback.clear();
    }

    /// Serve one client connection until it disconnects.
    ///
    /// All streams are closed when the connection ends, whatever the reason.
    ///
    /// # Errors
    /// A malformed frame or a failed reply ends the session with an error.
    pub async fn serve<R, W>(&mut self, reader: R, mut writer: W) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut frames = FrameReader::new(reader, self.max_payload);
        let result = loop {
            let frame = match frames.next().await {
                Ok(frame) => frame,
                Err(FrameError::Closed) => break Ok(()),
                Err(e) => break Err(ServerError::from(e)),
            };
            if let Some(reply) = self.execute(frame).await {
                if let Err(e) = write_frame(&mut writer, &reply).await {
                    break Err(ServerError::from(e));
                }
            }
        };
        if !self.streams.is_empty() {
            info!(open = self.streams.len(), "client gone, closing streams");
        }
        self.clear().await;
        result
    }
}
