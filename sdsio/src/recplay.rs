//! Recorder/player orchestrator
//!
//! Binds ring buffers to client streams. Each slot runs as its own task
//! that services the buffer on a fixed interval, and earlier when a
//! recorder's threshold callback fires. The application only ever touches
//! its end of the ring, which never blocks; all protocol I/O (and its
//! timeouts) happens in the slot task.
//!
//! ```text
//!            Idle ──► Opening ──► Active ──► Closing ──► Idle
//!                        │           │          │
//!                        └───────────┴──────────┴──────► Error
//! ```
//!
//! A slot that fails stops touching its buffer and stream and keeps the
//! error code for [`Recorder::last_error`]; other slots carry on.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{SdsioClient, StreamId};
use crate::config::{RecPlayConfig, SlotConfig};
use crate::error::{Mode, SdsioError, SdsioResult, SDSIO_OK};
use crate::record::{RecordHeader, RECORD_HEADER_SIZE};
use crate::ring_buffer::{Consumer, Producer, RingBuffer, RingMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotState {
    Idle = 0,
    Opening = 1,
    Active = 2,
    Closing = 3,
    Error = 4,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Opening,
            2 => Self::Active,
            3 => Self::Closing,
            _ => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Record,
    Play,
}

impl Direction {
    fn mode(self) -> Mode {
        match self {
            Self::Record => Mode::Write,
            Self::Play => Mode::Read,
        }
    }
}

/// Snapshot of one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStats {
    pub name: String,
    pub direction: Direction,
    pub state: SlotState,
    /// Last error code, `SDSIO_OK` if none
    pub last_error: i32,
    /// Bytes moved between ring and stream
    pub bytes: u64,
    /// Ring buffer overruns
    pub overruns: u64,
}

struct Slot {
    name: String,
    direction: Direction,
    stream: Mutex<Option<StreamId>>,
    monitor: RingMonitor,
    state: AtomicU8,
    last_error: AtomicI32,
    bytes: AtomicU64,
    eos: AtomicBool,
    closing: AtomicBool,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Slot {
    fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn fail(&self, error: SdsioError) {
        self.last_error.store(error.code(), Ordering::Release);
        self.set_state(SlotState::Error);
        warn!(slot = %self.name, direction = ?self.direction, error = %error, "slot failed");
    }

    fn last_error(&self) -> Option<SdsioError> {
        SdsioError::from_code(self.last_error.load(Ordering::Acquire))
    }

    fn stats(&self) -> SlotStats {
        SlotStats {
            name: self.name.clone(),
            direction: self.direction,
            state: self.state(),
            last_error: self.last_error.load(Ordering::Acquire),
            bytes: self.bytes.load(Ordering::Relaxed),
            overruns: self.monitor.overruns(),
        }
    }

    /// Stop the slot task, then close the stream.
    ///
    /// The task gets one write and one close timeout to finish its last
    /// drain; after that it is aborted and the slot fails with `Timeout`.
    /// Only the first caller does the work; later callers get the outcome
    /// from the slot state.
    async fn shutdown(&self, client: &SdsioClient) -> SdsioResult<()> {
        self.closing.store(true, Ordering::Release);
        self.wake.notify_one();
        let task = self.task.lock().take();
        let Some(mut task) = task else {
            return self.outcome();
        };
        let grace = client.config().write_timeout() + client.config().close_timeout();
        match timeout(grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(slot = %self.name, error = %e, "slot task panicked");
                self.fail(SdsioError::Error);
            }
            Err(_) => {
                task.abort();
                self.fail(SdsioError::Timeout);
            }
        }

        let Some(stream) = self.stream.lock().take() else {
            return self.outcome();
        };
        if self.state() == SlotState::Error {
            // Release the handle so the server can reclaim the stream.
            let _ = client.close(stream).await;
            return self.outcome();
        }
        self.set_state(SlotState::Closing);
        match client.close(stream).await {
            Ok(()) => {
                self.set_state(SlotState::Idle);
                info!(slot = %self.name, bytes = self.bytes.load(Ordering::Relaxed), "slot closed");
            }
            Err(e) => self.fail(e),
        }
        self.outcome()
    }

    fn outcome(&self) -> SdsioResult<()> {
        match self.state() {
            SlotState::Error => Err(self.last_error().unwrap_or(SdsioError::Error)),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

type SlotTable = Arc<Mutex<Vec<Option<Arc<Slot>>>>>;

/// Orchestrator context
///
/// Owns the client context; slots are created with [`RecPlay::recorder_open`]
/// and [`RecPlay::player_open`].
pub struct RecPlay {
    client: Arc<SdsioClient>,
    config: RecPlayConfig,
    slots: SlotTable,
}

impl RecPlay {
    #[must_use]
    pub fn new(client: SdsioClient, config: RecPlayConfig) -> Self {
        let slots = (0..config.max_slots).map(|_| None).collect();
        Self {
            client: Arc::new(client),
            config,
            slots: Arc::new(Mutex::new(slots)),
        }
    }

    #[must_use]
    pub fn client(&self) -> &SdsioClient {
        &self.client
    }

    /// Statistics of every slot in use
    #[must_use]
    pub fn stats(&self) -> Vec<SlotStats> {
        self.slots.lock().iter().flatten().map(|s| s.stats()).collect()
    }

    /// Open a recorder slot: the application writes into the returned
    /// [`Recorder`], the slot task forwards the data to stream `config.name`.
    ///
    /// # Errors
    /// `Parameter` for an invalid ring configuration, `Error` if all slots
    /// are taken, or the error of the stream Open.
    pub async fn recorder_open(&self, config: SlotConfig) -> SdsioResult<Recorder> {
        let ring = ring_for(&config)?;
        let slot = self.register(&config.name, Direction::Record, ring.monitor())?;
        let stream = self.open_stream(&slot, &config.name).await?;

        let (mut producer, consumer) = ring.split();
        let notify = Arc::clone(&slot);
        producer.register_threshold_callback(move || notify.wake.notify_one());

        let task = tokio::spawn(run_recorder(
            Arc::clone(&self.client),
            stream,
            consumer,
            Arc::clone(&slot),
            self.config.service_interval(),
            config.max_staleness(),
        ));
        *slot.task.lock() = Some(task);
        Ok(Recorder {
            producer,
            handle: SlotHandle::new(self, slot),
        })
    }

    /// Open a player slot: the slot task fills the ring from stream
    /// `config.name`, the application reads from the returned [`Player`].
    ///
    /// # Errors
    /// As for [`RecPlay::recorder_open`].
    pub async fn player_open(&self, config: SlotConfig) -> SdsioResult<Player> {
        let ring = ring_for(&config)?;
        let slot = self.register(&config.name, Direction::Play, ring.monitor())?;
        let stream = self.open_stream(&slot, &config.name).await?;

        let (producer, consumer) = ring.split();
        let task = tokio::spawn(run_player(
            Arc::clone(&self.client),
            stream,
            producer,
            Arc::clone(&slot),
            self.config.service_interval(),
        ));
        *slot.task.lock() = Some(task);
        Ok(Player {
            consumer,
            handle: SlotHandle::new(self, slot),
        })
    }

    fn register(
        &self,
        name: &str,
        direction: Direction,
        monitor: RingMonitor,
    ) -> SdsioResult<Arc<Slot>> {
        let mut slots = self.slots.lock();
        let Some(free) = slots.iter_mut().find(|s| s.is_none()) else {
            warn!(slot = name, "no free recorder/player slot");
            return Err(SdsioError::Error);
        };
        let slot = Arc::new(Slot {
            name: name.to_string(),
            direction,
            stream: Mutex::new(None),
            monitor,
            state: AtomicU8::new(SlotState::Idle as u8),
            last_error: AtomicI32::new(SDSIO_OK),
            bytes: AtomicU64::new(0),
            eos: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            wake: Notify::new(),
            task: Mutex::new(None),
        });
        *free = Some(Arc::clone(&slot));
        Ok(slot)
    }

    async fn open_stream(&self, slot: &Arc<Slot>, name: &str) -> SdsioResult<StreamId> {
        slot.set_state(SlotState::Opening);
        match self.client.open(name, slot.direction.mode()).await {
            Ok(stream) => {
                *slot.stream.lock() = Some(stream);
                slot.set_state(SlotState::Active);
                debug!(slot = name, direction = ?slot.direction, %stream, "slot active");
                Ok(stream)
            }
            Err(e) => {
                slot.fail(e);
                release(&self.slots, slot);
                Err(e)
            }
        }
    }

    /// Close every slot still open, then shut the client down.
    pub async fn uninit(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.lock().iter().flatten().cloned().collect();
        let client = &*self.client;
        join_all(slots.iter().map(|slot| slot.shutdown(client))).await;
        for slot in &slots {
            release(&self.slots, slot);
        }
        self.client.uninit().await;
    }
}

impl fmt::Debug for RecPlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecPlay")
            .field("client", &self.client)
            .field("slots", &self.stats().len())
            .finish()
    }
}

fn ring_for(config: &SlotConfig) -> SdsioResult<RingBuffer> {
    RingBuffer::new(config.buffer).map_err(|e| {
        warn!(slot = %config.name, error = %e, "invalid ring buffer configuration");
        SdsioError::Parameter
    })
}

fn release(table: &SlotTable, slot: &Arc<Slot>) {
    let mut slots = table.lock();
    if let Some(entry) = slots
        .iter_mut()
        .find(|s| s.as_ref().is_some_and(|s| Arc::ptr_eq(s, slot)))
    {
        *entry = None;
    }
}

/// What recorder and player share: the slot and the way back to the client
struct SlotHandle {
    client: Arc<SdsioClient>,
    table: SlotTable,
    slot: Arc<Slot>,
}

impl SlotHandle {
    fn new(recplay: &RecPlay, slot: Arc<Slot>) -> Self {
        Self {
            client: Arc::clone(&recplay.client),
            table: Arc::clone(&recplay.slots),
            slot,
        }
    }

    async fn close(&self) -> SdsioResult<()> {
        let result = self.slot.shutdown(&self.client).await;
        release(&self.table, &self.slot);
        result
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        // The stream itself is closed by `RecPlay::uninit`.
        self.slot.closing.store(true, Ordering::Release);
        self.slot.wake.notify_one();
    }
}

/// Application end of a recorder slot
pub struct Recorder {
    producer: Producer,
    handle: SlotHandle,
}

impl Recorder {
    /// Queue raw bytes for recording, never blocking.
    ///
    /// Returns the bytes accepted by the ring, per its overrun policy.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.producer.write(data)
    }

    /// Queue one timestamped record, whole or not at all.
    ///
    /// Returns the bytes queued (header included), or 0 after counting an
    /// overrun when the record does not fit.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_record(&mut self, timestamp: u32, data: &[u8]) -> usize {
        let header = RecordHeader {
            timestamp,
            size: data.len() as u32,
        };
        if self.producer.try_write_all(&[&header.encode(), data]) {
            header.record_len()
        } else {
            0
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.handle.slot.name
    }

    #[must_use]
    pub fn state(&self) -> SlotState {
        self.handle.slot.state()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<SdsioError> {
        self.handle.slot.last_error()
    }

    #[must_use]
    pub fn stats(&self) -> SlotStats {
        self.handle.slot.stats()
    }

    /// Flush what is buffered, then close the stream.
    ///
    /// # Errors
    /// The error that put the slot into `Error`, if any.
    pub async fn close(self) -> SdsioResult<()> {
        self.handle.close().await
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder").field("slot", &self.handle.slot).finish()
    }
}

/// Application end of a player slot
pub struct Player {
    consumer: Consumer,
    handle: SlotHandle,
}

impl Player {
    /// Take up to `buf.len()` played-back bytes, never blocking.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.consumer.read(buf)
    }

    /// Take the next record once it is completely buffered.
    ///
    /// Returns the record header with the data copied into `buf`, or `None`
    /// if the record is still incomplete.
    ///
    /// # Errors
    /// `Parameter` if the record does not fit into `buf`; it stays buffered.
    pub fn read_record(&mut self, buf: &mut [u8]) -> SdsioResult<Option<RecordHeader>> {
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        if self.consumer.peek(&mut raw) < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        let header = RecordHeader::decode(&raw);
        let size = header.size as usize;
        if size > buf.len() {
            return Err(SdsioError::Parameter);
        }
        if self.consumer.available() < header.record_len() {
            return Ok(None);
        }
        let _ = self.consumer.read(&mut raw);
        let n = self.consumer.read(&mut buf[..size]);
        debug_assert_eq!(n, size);
        Ok(Some(header))
    }

    /// The server reported end of stream and everything was consumed
    #[must_use]
    pub fn is_eos(&self) -> bool {
        self.handle.slot.eos.load(Ordering::Acquire) && self.consumer.is_empty()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.handle.slot.name
    }

    #[must_use]
    pub fn state(&self) -> SlotState {
        self.handle.slot.state()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<SdsioError> {
        self.handle.slot.last_error()
    }

    #[must_use]
    pub fn stats(&self) -> SlotStats {
        self.handle.slot.stats()
    }

    /// Stop refilling and close the stream.
    ///
    /// # Errors
    /// The error that put the slot into `Error`, if any.
    pub async fn close(self) -> SdsioResult<()> {
        self.handle.close().await
    }
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player").field("slot", &self.handle.slot).finish()
    }
}

fn service_timer(period: Duration) -> tokio::time::Interval {
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

/// Recorder slot task: drain the ring into the stream.
///
/// Drains when the threshold is reached, when the oldest buffered byte has
/// waited `max_staleness`, and once more when closing. A Write that cannot
/// be queued within the write timeout fails the slot.
async fn run_recorder(
    client: Arc<SdsioClient>,
    stream: StreamId,
    mut consumer: Consumer,
    slot: Arc<Slot>,
    period: Duration,
    max_staleness: Duration,
) {
    let mut timer = service_timer(period);
    let mut chunk = vec![0u8; consumer.capacity()];
    let threshold = consumer.threshold().max(1);
    let mut pending_since: Option<Instant> = None;

    loop {
        tokio::select! {
            () = slot.wake.notified() => {}
            _ = timer.tick() => {}
        }
        let closing = slot.closing.load(Ordering::Acquire);
        let available = consumer.available();
        if available == 0 {
            pending_since = None;
        } else {
            let now = Instant::now();
            let since = *pending_since.get_or_insert(now);
            if closing || available >= threshold || now.duration_since(since) >= max_staleness {
                loop {
                    let n = consumer.read(&mut chunk);
                    if n == 0 {
                        break;
                    }
                    if let Err(e) = client.write(stream, &chunk[..n]).await {
                        slot.fail(e);
                        return;
                    }
                    slot.bytes.fetch_add(n as u64, Ordering::Relaxed);
                }
                pending_since = None;
            }
        }
        if closing {
            debug!(slot = %slot.name, "recorder drained");
            return;
        }
    }
}

/// Player slot task: refill the ring from the stream.
async fn run_player(
    client: Arc<SdsioClient>,
    stream: StreamId,
    mut producer: Producer,
    slot: Arc<Slot>,
    period: Duration,
) {
    let mut timer = service_timer(period);
    let mut chunk = vec![0u8; producer.capacity()];
    let threshold = producer.threshold().max(1);

    loop {
        tokio::select! {
            () = slot.wake.notified() => {}
            _ = timer.tick() => {}
        }
        if slot.closing.load(Ordering::Acquire) {
            return;
        }
        if slot.eos.load(Ordering::Acquire) {
            continue;
        }

        let mut free = producer.free();
        while free >= threshold {
            match client.read(stream, &mut chunk[..free]).await {
                Ok(0) => break,
                Ok(n) => {
                    producer.write(&chunk[..n]);
                    slot.bytes.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(SdsioError::Eos) => {
                    debug!(slot = %slot.name, "playback reached end of stream");
                    slot.eos.store(true, Ordering::Release);
                    break;
                }
                Err(e) => {
                    slot.fail(e);
                    return;
                }
            }
            if slot.closing.load(Ordering::Acquire) {
                return;
            }
            free = producer.free();
        }
    }
}
