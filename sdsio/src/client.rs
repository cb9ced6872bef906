//! SDSIO client protocol
//!
//! Turns Open/Close/Read/Write calls into frames on one transport channel
//! shared by many logical streams. The client owns two background tasks:
//! - a writer task that drains a bounded frame queue, one whole frame at a
//!   time, so frames from different streams never interleave on the wire
//! - a reader task that decodes replies and hands each one to the waiter
//!   registered for its stream id
//!
//! Open replies carry no correlation key besides arrival order, so at most
//! one Open is in flight per channel. Read and Close replies are matched by
//! stream id, so a slow Read on one stream does not hold up other streams.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::SdsioConfig;
use crate::error::{status_to_result, Mode, SdsioError, SdsioResult};
use crate::protocol::{write_frame, Command, Frame, FrameError, FrameReader, INVALID_STREAM};
use crate::transport::Transport;

/// Set while a client context is alive; at most one per process
static LIVE: AtomicBool = AtomicBool::new(false);

struct LiveGuard;

impl LiveGuard {
    fn acquire() -> Option<Self> {
        LIVE.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        LIVE.store(false, Ordering::Release);
    }
}

/// Handle of an open stream
///
/// An index into the client's fixed stream table plus the generation of
/// that table entry. Closing a stream bumps the generation, so a handle kept
/// after Close is rejected with [`SdsioError::Parameter`] instead of
/// aliasing whatever stream reuses the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    index: u16,
    generation: u16,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct OpenStream {
    server_id: u32,
    mode: Mode,
    name: String,
    /// A Read timed out; only Close is allowed now
    poisoned: bool,
    /// An unexpected frame arrived; the client already sent Close
    desynced: bool,
}

#[derive(Debug, Default)]
struct Entry {
    generation: u16,
    stream: Option<OpenStream>,
}

struct Waiter {
    expect: Command,
    reply: oneshot::Sender<Frame>,
}

impl Waiter {
    fn accepts(&self, command: Command) -> bool {
        command == self.expect || (self.expect == Command::Read && command == Command::Eos)
    }
}

#[derive(Default)]
struct OpenWaiter {
    waiter: Option<oneshot::Sender<Frame>>,
    /// Open replies still owed for requests that already timed out
    stale: usize,
}

/// State shared with the reader and writer tasks
struct Shared {
    streams: Mutex<Vec<Entry>>,
    pending: Mutex<HashMap<u32, Waiter>>,
    open: Mutex<OpenWaiter>,
    link_up: AtomicBool,
}

impl Shared {
    fn link_lost(&self) {
        if self.link_up.swap(false, Ordering::AcqRel) {
            info!("sdsio link lost");
        }
        // Dropping the senders wakes every waiter with a closed channel.
        self.pending.lock().clear();
        self.open.lock().waiter = None;
    }

    fn dispatch(&self, frame: Frame, tx: &mpsc::WeakSender<Frame>) {
        trace!(
            command = ?frame.command,
            stream = frame.stream,
            size = frame.payload.len(),
            "reply"
        );
        if frame.command == Command::Open {
            self.dispatch_open(frame, tx);
            return;
        }

        let waiter = {
            let mut pending = self.pending.lock();
            match pending.get(&frame.stream) {
                Some(w) if w.accepts(frame.command) => pending.remove(&frame.stream),
                _ => None,
            }
        };
        match waiter {
            Some(w) => {
                // The caller may have timed out in the meantime.
                let _ = w.reply.send(frame);
            }
            None => self.unexpected(&frame, tx),
        }
    }

    fn dispatch_open(&self, frame: Frame, tx: &mpsc::WeakSender<Frame>) {
        let waiter = {
            let mut open = self.open.lock();
            if open.stale > 0 {
                open.stale -= 1;
                None
            } else {
                open.waiter.take()
            }
        };
        let orphan = match waiter {
            Some(w) => w.send(frame).err(),
            None => Some(frame),
        };
        if let Some(frame) = orphan {
            if frame.stream != INVALID_STREAM {
                debug!(server_id = frame.stream, "reclaiming stream from late open reply");
                send_now(tx, Frame::close(frame.stream));
            }
        }
    }

    /// A frame nobody waits for: a late reply, or a protocol desync.
    fn unexpected(&self, frame: &Frame, tx: &mpsc::WeakSender<Frame>) {
        let desync = {
            let mut streams = self.streams.lock();
            let Some(stream) = streams
                .iter_mut()
                .filter_map(|e| e.stream.as_mut())
                .find(|s| s.server_id == frame.stream)
            else {
                debug!(
                    command = ?frame.command,
                    server_id = frame.stream,
                    "frame for unknown stream dropped"
                );
                return;
            };
            if stream.poisoned && matches!(frame.command, Command::Read | Command::Eos) {
                debug!(stream = %stream.name, "late read reply dropped");
                return;
            }
            if stream.desynced {
                return;
            }
            warn!(
                stream = %stream.name,
                command = ?frame.command,
                "unexpected frame, closing stream"
            );
            stream.desynced = true;
            true
        };
        if desync {
            // Wake a pending caller with a closed channel.
            self.pending.lock().remove(&frame.stream);
            send_now(tx, Frame::close(frame.stream));
        }
    }
}

/// Wait until `deadline` for room in the frame queue.
///
/// `closed` is reported when the writer task has gone away.
async fn reserve_until(
    tx: &mpsc::Sender<Frame>,
    deadline: Instant,
    closed: SdsioError,
) -> SdsioResult<mpsc::Permit<'_, Frame>> {
    match timeout_at(deadline, tx.reserve()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_)) => Err(closed),
        Err(_) => Err(SdsioError::Timeout),
    }
}

fn send_now(tx: &mpsc::WeakSender<Frame>, frame: Frame) {
    if let Some(tx) = tx.upgrade() {
        if let Err(e) = tx.try_send(frame) {
            warn!(error = %e, "could not queue frame");
        }
    }
}

async fn reader_loop<R>(
    mut frames: FrameReader<R>,
    shared: Arc<Shared>,
    tx: mpsc::WeakSender<Frame>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match frames.next().await {
            Ok(frame) => shared.dispatch(frame, &tx),
            Err(FrameError::Closed) => {
                debug!("server closed the channel");
                break;
            }
            Err(e) => {
                warn!(error = %e, "transport receive failed");
                break;
            }
        }
    }
    shared.link_lost();
}

async fn writer_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Frame>, shared: Arc<Shared>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!(error = %e, "transport send failed");
            shared.link_lost();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// The SDSIO client context
///
/// Created by [`SdsioClient::init`], torn down by [`SdsioClient::uninit`]
/// (or on drop). Only one context may be alive per process. All calls take
/// `&self`; share the context with `Arc` to use it from several tasks.
pub struct SdsioClient {
    config: SdsioConfig,
    transport: String,
    shared: Arc<Shared>,
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    open_lock: tokio::sync::Mutex<()>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    guard: Mutex<Option<LiveGuard>>,
}

impl SdsioClient {
    /// Set up the I/O layer over `transport`.
    ///
    /// # Errors
    /// - `Error` if another context is alive or the configuration is invalid
    /// - `NoServer` if the transport cannot be opened within the connect timeout
    pub async fn init<T: Transport>(mut transport: T, config: SdsioConfig) -> SdsioResult<Self> {
        config.validate().map_err(|e| {
            warn!(error = %e, "rejecting client configuration");
            SdsioError::Error
        })?;
        let guard = LiveGuard::acquire().ok_or_else(|| {
            warn!("sdsio client already initialised");
            SdsioError::Error
        })?;

        let name = transport.describe();
        let (reader, writer) = match timeout(config.connect_timeout(), transport.open()).await {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                warn!(transport = %name, error = %e, "transport open failed");
                return Err(SdsioError::NoServer);
            }
            Err(_) => {
                warn!(transport = %name, "transport open timed out");
                return Err(SdsioError::NoServer);
            }
        };

        let shared = Arc::new(Shared {
            streams: Mutex::new((0..config.max_streams).map(|_| Entry::default()).collect()),
            pending: Mutex::new(HashMap::new()),
            open: Mutex::new(OpenWaiter::default()),
            link_up: AtomicBool::new(true),
        });
        let (tx, rx) = mpsc::channel(config.tx_queue_depth);
        let writer_task = tokio::spawn(writer_loop(writer, rx, Arc::clone(&shared)));
        let reader_task = tokio::spawn(reader_loop(
            FrameReader::new(reader, config.max_payload),
            Arc::clone(&shared),
            tx.downgrade(),
        ));
        info!(transport = %name, "sdsio client ready");

        Ok(Self {
            config,
            transport: name,
            shared,
            tx: Mutex::new(Some(tx)),
            open_lock: tokio::sync::Mutex::new(()),
            reader_task: Mutex::new(Some(reader_task)),
            writer_task: Mutex::new(Some(writer_task)),
            guard: Mutex::new(Some(guard)),
        })
    }

    /// Close every open stream and release the transport.
    ///
    /// Calling it again is a no-op.
    pub async fn uninit(&self) {
        let open: Vec<StreamId> = {
            let streams = self.shared.streams.lock();
            streams
                .iter()
                .enumerate()
                .filter(|(_, e)| e.stream.is_some())
                .filter_map(|(index, e)| {
                    Some(StreamId {
                        index: u16::try_from(index).ok()?,
                        generation: e.generation,
                    })
                })
                .collect()
        };
        for id in open {
            if let Err(e) = self.close(id).await {
                debug!(stream = %id, error = %e, "close during uninit failed");
            }
        }

        drop(self.tx.lock().take());
        let writer = self.writer_task.lock().take();
        if let Some(mut writer) = writer {
            if timeout(self.config.close_timeout(), &mut writer).await.is_err() {
                warn!(transport = %self.transport, "transport stalled, dropping queued frames");
                writer.abort();
            }
        }
        if let Some(reader) = self.reader_task.lock().take() {
            reader.abort();
        }
        self.shared.link_lost();
        if self.guard.lock().take().is_some() {
            info!(transport = %self.transport, "sdsio client shut down");
        }
    }

    #[must_use]
    pub fn config(&self) -> &SdsioConfig {
        &self.config
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.link_up.load(Ordering::Acquire) && self.tx.lock().is_some()
    }

    fn sender(&self) -> Option<mpsc::Sender<Frame>> {
        if !self.shared.link_up.load(Ordering::Acquire) {
            return None;
        }
        self.tx.lock().clone()
    }

    /// Open stream `name` for reading or writing.
    ///
    /// # Errors
    /// - `Parameter` for an empty name, one with NUL, or one too long for a frame
    /// - `Error` if the server refused or the stream table is full
    /// - `Timeout` if no reply arrived within the open timeout, counted from
    ///   the call, including the wait for other Opens and for queue space
    /// - `NoServer` if the channel is down or dropped before the reply
    pub async fn open(&self, name: &str, mode: Mode) -> SdsioResult<StreamId> {
        if name.is_empty() || name.contains('\0') || name.len() >= self.config.max_payload {
            return Err(SdsioError::Parameter);
        }
        let deadline = Instant::now() + self.config.open_timeout();
        let Ok(_serial) = timeout_at(deadline, self.open_lock.lock()).await else {
            warn!(stream = name, %mode, "open timed out behind another open");
            return Err(SdsioError::Timeout);
        };
        let tx = self.sender().ok_or(SdsioError::NoServer)?;

        let index = {
            let streams = self.shared.streams.lock();
            streams.iter().position(|e| e.stream.is_none())
        };
        let Some(index) = index else {
            warn!(stream = name, "stream table full");
            return Err(SdsioError::Error);
        };
        let index_u16 = u16::try_from(index).map_err(|_| SdsioError::Error)?;

        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.shared.open.lock().waiter = Some(reply_tx);
        // `link_lost` clears waiters after dropping the flag; check after registering.
        if !self.shared.link_up.load(Ordering::Acquire) {
            self.shared.open.lock().waiter = None;
            return Err(SdsioError::NoServer);
        }
        match reserve_until(&tx, deadline, SdsioError::NoServer).await {
            Ok(permit) => permit.send(Frame::open(name, mode)),
            Err(e) => {
                // Nothing was queued, so no reply is owed.
                self.shared.open.lock().waiter = None;
                warn!(stream = name, %mode, error = %e, "open request not queued");
                return Err(e);
            }
        }

        let reply = match timeout_at(deadline, &mut reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(SdsioError::NoServer),
            Err(_) => {
                let still_waiting = {
                    let mut open = self.shared.open.lock();
                    let waiting = open.waiter.take().is_some();
                    if waiting {
                        open.stale += 1;
                    }
                    waiting
                };
                if !still_waiting {
                    // The reply raced the deadline; give the id back.
                    if let Ok(reply) = reply_rx.try_recv() {
                        if reply.stream != INVALID_STREAM {
                            let _ = tx.try_send(Frame::close(reply.stream));
                        }
                    }
                }
                warn!(stream = name, %mode, "open timed out");
                return Err(SdsioError::Timeout);
            }
        };

        if reply.stream == INVALID_STREAM {
            debug!(stream = name, %mode, "server refused open");
            return Err(SdsioError::Error);
        }

        let mut streams = self.shared.streams.lock();
        let entry = &mut streams[index];
        entry.stream = Some(OpenStream {
            server_id: reply.stream,
            mode,
            name: name.to_string(),
            poisoned: false,
            desynced: false,
        });
        let id = StreamId {
            index: index_u16,
            generation: entry.generation,
        };
        debug!(stream = name, %mode, %id, server_id = reply.stream, "opened");
        Ok(id)
    }

    /// Resolve a handle to its server id, checking it may do `mode` I/O.
    fn lookup(&self, id: StreamId, mode: Mode) -> SdsioResult<u32> {
        let streams = self.shared.streams.lock();
        let stream = streams
            .get(usize::from(id.index))
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.stream.as_ref())
            .ok_or(SdsioError::Parameter)?;
        if stream.mode != mode {
            return Err(SdsioError::Parameter);
        }
        if stream.desynced {
            return Err(SdsioError::Interface);
        }
        if stream.poisoned {
            return Err(SdsioError::Error);
        }
        Ok(stream.server_id)
    }

    fn poison(&self, id: StreamId) {
        let mut streams = self.shared.streams.lock();
        if let Some(stream) = streams
            .get_mut(usize::from(id.index))
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.stream.as_mut())
        {
            stream.poisoned = true;
        }
    }

    /// Queue `data` for stream `id`.
    ///
    /// Data longer than the maximum payload goes out as several frames. No
    /// acknowledgement is awaited; returns once every frame is queued.
    ///
    /// # Errors
    /// - `Parameter` for a stale handle, a read stream or empty data
    /// - `Error` after a timed-out call poisoned the stream
    /// - `Timeout` if the frames could not be queued within the write
    ///   timeout; if only part of `data` went out the stream is poisoned
    /// - `Interface` if the channel failed or the stream desynchronized
    pub async fn write(&self, id: StreamId, data: &[u8]) -> SdsioResult<usize> {
        if data.is_empty() {
            return Err(SdsioError::Parameter);
        }
        let server_id = self.lookup(id, Mode::Write)?;
        let tx = self.sender().ok_or(SdsioError::Interface)?;
        let deadline = Instant::now() + self.config.write_timeout();
        let mut queued = 0;
        for chunk in data.chunks(self.config.max_payload) {
            match reserve_until(&tx, deadline, SdsioError::Interface).await {
                Ok(permit) => permit.send(Frame::write(server_id, chunk)),
                Err(e) => {
                    if e == SdsioError::Timeout {
                        warn!(stream = %id, queued, bytes = data.len(), "write timed out");
                        if queued > 0 {
                            self.poison(id);
                        }
                    }
                    return Err(e);
                }
            }
            queued += chunk.len();
        }
        trace!(stream = %id, bytes = data.len(), "write queued");
        Ok(data.len())
    }

    /// Read up to `buf.len()` bytes from stream `id`.
    ///
    /// Returns fewer bytes than asked when the server has fewer available.
    ///
    /// # Errors
    /// - `Eos` once the stored stream is exhausted
    /// - `Timeout` if no reply arrived in time; the stream is then unusable
    ///   until closed
    /// - `Parameter`, `Error`, `Interface` as for [`Self::write`]
    pub async fn read(&self, id: StreamId, buf: &mut [u8]) -> SdsioResult<usize> {
        if buf.is_empty() {
            return Err(SdsioError::Parameter);
        }
        let server_id = self.lookup(id, Mode::Read)?;
        let tx = self.sender().ok_or(SdsioError::Interface)?;
        let len = buf.len().min(self.config.max_payload);

        let deadline = Instant::now() + self.config.read_timeout();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.contains_key(&server_id) {
                return Err(SdsioError::Parameter);
            }
            pending.insert(
                server_id,
                Waiter {
                    expect: Command::Read,
                    reply: reply_tx,
                },
            );
        }
        if !self.shared.link_up.load(Ordering::Acquire) {
            self.shared.pending.lock().remove(&server_id);
            return Err(SdsioError::Interface);
        }
        match reserve_until(&tx, deadline, SdsioError::Interface).await {
            Ok(permit) => permit.send(Frame::read(server_id, len)),
            Err(e) => {
                // Not sent, so the stream stays usable.
                self.shared.pending.lock().remove(&server_id);
                warn!(stream = %id, error = %e, "read request not queued");
                return Err(e);
            }
        }

        let reply = match timeout_at(deadline, &mut reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(SdsioError::Interface),
            Err(_) => {
                self.shared.pending.lock().remove(&server_id);
                self.poison(id);
                warn!(stream = %id, "read timed out");
                return Err(SdsioError::Timeout);
            }
        };

        if reply.command == Command::Eos {
            debug!(stream = %id, "end of stream");
            return Err(SdsioError::Eos);
        }
        status_to_result(reply.status())?;
        let n = reply.payload.len().min(buf.len());
        buf[..n].copy_from_slice(&reply.payload[..n]);
        trace!(stream = %id, bytes = n, "read");
        Ok(n)
    }

    /// Close stream `id`.
    ///
    /// The handle is invalid afterwards whatever the outcome.
    ///
    /// # Errors
    /// - `Parameter` for a stale handle
    /// - `Timeout` if the server did not confirm in time
    /// - `Interface` if the channel failed or the stream had desynchronized
    /// - the status the server reported
    pub async fn close(&self, id: StreamId) -> SdsioResult<()> {
        let stream = {
            let mut streams = self.shared.streams.lock();
            let entry = streams
                .get_mut(usize::from(id.index))
                .filter(|e| e.generation == id.generation && e.stream.is_some())
                .ok_or(SdsioError::Parameter)?;
            entry.generation = entry.generation.wrapping_add(1);
            entry.stream.take().ok_or(SdsioError::Parameter)?
        };
        debug!(stream = %stream.name, %id, "closing");
        if stream.desynced {
            return Err(SdsioError::Interface);
        }
        let tx = self.sender().ok_or(SdsioError::Interface)?;
        let deadline = Instant::now() + self.config.close_timeout();

        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.shared.pending.lock().insert(
            stream.server_id,
            Waiter {
                expect: Command::Close,
                reply: reply_tx,
            },
        );
        if !self.shared.link_up.load(Ordering::Acquire) {
            self.shared.pending.lock().remove(&stream.server_id);
            return Err(SdsioError::Interface);
        }
        match reserve_until(&tx, deadline, SdsioError::Interface).await {
            Ok(permit) => permit.send(Frame::close(stream.server_id)),
            Err(e) => {
                self.shared.pending.lock().remove(&stream.server_id);
                warn!(stream = %stream.name, error = %e, "close request not queued");
                return Err(e);
            }
        }

        match timeout_at(deadline, &mut reply_rx).await {
            Ok(Ok(reply)) => status_to_result(reply.status()),
            Ok(Err(_)) => Err(SdsioError::Interface),
            Err(_) => {
                self.shared.pending.lock().remove(&stream.server_id);
                warn!(stream = %stream.name, "close timed out");
                Err(SdsioError::Timeout)
            }
        }
    }
}

impl Drop for SdsioClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader_task.get_mut().take() {
            reader.abort();
        }
        if let Some(writer) = self.writer_task.get_mut().take() {
            writer.abort();
        }
    }
}

impl fmt::Debug for SdsioClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdsioClient")
            .field("transport", &self.transport)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
