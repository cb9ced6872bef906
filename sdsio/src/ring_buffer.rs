//! Lock-free single-producer/single-consumer byte ring
//!
//! A [`RingBuffer`] is created once with a fixed capacity, threshold and
//! [`OverrunPolicy`], then split into a [`Producer`] and a [`Consumer`].
//! Neither side ever blocks or takes a lock, so both may be driven from
//! interrupt-like contexts (a sampling thread, a signal-driven callback).
//!
//! # Indices
//!
//! `write_index` and `read_index` are free-running byte counters; a position
//! maps into the data region modulo the capacity. Only the producer stores
//! `write_index`, only the consumer stores `read_index`. Bytes available to
//! read are `min(write - read, capacity)`.
//!
//! # Memory ordering
//!
//! ```text
//! producer                              consumer
//! --------                              --------
//! read_index.load(Acquire)              write_index.load(Acquire)
//! write_claim.store(end, Relaxed)       copy bytes (Relaxed loads)
//! fence(Release)                        fence(Acquire)
//! store bytes (Relaxed)                 write_claim.load(Relaxed)
//! write_index.store(end, Release)       read_index.store(pos, Release)
//! ```
//!
//! The Acquire/Release pairs on the two indices make the payload visible to
//! the consumer before the new write index, and keep the producer from
//! reusing space the consumer has not finished copying.
//!
//! Under [`OverrunPolicy::DropOldest`] the producer never waits for the
//! consumer and may overwrite bytes the consumer is copying at that moment.
//! The producer announces how far it is about to write in `write_claim`
//! before touching any byte; after copying, the consumer re-reads the claim
//! and drops the prefix of its copy that was lapped (seqlock-style). Data
//! bytes are `AtomicU8`, so the overlap is a defined race rather than UB.

use std::fmt;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// What `write` does once the ring is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Truncate incoming data; `write` returns fewer bytes than offered
    DropNewest,
    /// Accept everything, overwriting the oldest unread bytes first
    DropOldest,
}

/// Creation parameters; fixed for the lifetime of the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingBufferConfig {
    /// Size of the data region in bytes
    pub capacity: usize,
    /// Fill level whose upward crossing fires the threshold callback
    pub threshold: usize,
    /// Behaviour on overrun
    pub overrun_policy: OverrunPolicy,
}

/// Configuration errors reported by [`RingBuffer::new`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingBufferError {
    #[error("ring buffer capacity must be greater than zero")]
    ZeroCapacity,

    #[error("threshold {threshold} is outside [0, {capacity}]")]
    ThresholdOutOfRange { threshold: usize, capacity: usize },
}

struct Shared {
    data: Box<[AtomicU8]>,
    capacity: usize,
    threshold: usize,
    policy: OverrunPolicy,
    write_index: AtomicUsize,
    write_claim: AtomicUsize,
    read_index: AtomicUsize,
    overruns: AtomicU64,
    dropped_bytes: AtomicU64,
}

impl Shared {
    #[inline]
    fn slot(&self, pos: usize) -> &AtomicU8 {
        &self.data[pos % self.capacity]
    }

    #[inline]
    fn available(&self, write: usize, read: usize) -> usize {
        write.wrapping_sub(read).min(self.capacity)
    }
}

/// A configured ring, not yet split into its two ends
pub struct RingBuffer {
    shared: Arc<Shared>,
}

impl RingBuffer {
    /// Create a ring.
    ///
    /// # Errors
    /// Fails on a zero capacity or a threshold above the capacity.
    pub fn new(config: RingBufferConfig) -> Result<Self, RingBufferError> {
        if config.capacity == 0 {
            return Err(RingBufferError::ZeroCapacity);
        }
        if config.threshold > config.capacity {
            return Err(RingBufferError::ThresholdOutOfRange {
                threshold: config.threshold,
                capacity: config.capacity,
            });
        }

        let data = (0..config.capacity).map(|_| AtomicU8::new(0)).collect();
        Ok(Self {
            shared: Arc::new(Shared {
                data,
                capacity: config.capacity,
                threshold: config.threshold,
                policy: config.overrun_policy,
                write_index: AtomicUsize::new(0),
                write_claim: AtomicUsize::new(0),
                read_index: AtomicUsize::new(0),
                overruns: AtomicU64::new(0),
                dropped_bytes: AtomicU64::new(0),
            }),
        })
    }

    #[must_use]
    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Split into the producer and consumer ends.
    #[must_use]
    pub fn split(self) -> (Producer, Consumer) {
        let producer = Producer {
            shared: Arc::clone(&self.shared),
            write_pos: 0,
            armed: self.shared.threshold > 0,
            on_threshold: None,
        };
        let consumer = Consumer {
            shared: self.shared,
            read_pos: 0,
        };
        (producer, consumer)
    }
}

/// Read-only view of a ring's counters, safe to hold from any context
#[derive(Clone)]
pub struct RingMonitor {
    shared: Arc<Shared>,
}

impl RingMonitor {
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Bytes buffered; may be stale by the time it is used
    #[must_use]
    pub fn available(&self) -> usize {
        let read = self.shared.read_index.load(Ordering::Acquire);
        let write = self.shared.write_index.load(Ordering::Acquire);
        self.shared.available(write, read)
    }

    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_bytes(&self) -> u64 {
        self.shared.dropped_bytes.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for RingMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingMonitor")
            .field("capacity", &self.shared.capacity)
            .field("overruns", &self.overruns())
            .finish()
    }
}

/// Writing end of the ring. Exactly one context may own it.
pub struct Producer {
    shared: Arc<Shared>,
    write_pos: usize,
    /// Availability was last seen below the threshold and the callback has
    /// not fired since.
    armed: bool,
    on_threshold: Option<Box<dyn FnMut() + Send>>,
}

impl Producer {
    /// Register the threshold callback, replacing any previous one.
    ///
    /// The callback runs synchronously inside [`Producer::write`], once per
    /// crossing of the threshold from below. It must not block.
    pub fn register_threshold_callback<F>(&mut self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.on_threshold = Some(Box::new(callback));
    }

    /// Write bytes, never blocking.
    ///
    /// Returns the number of bytes accepted. Under `DropNewest` this is less
    /// than `data.len()` when the ring fills up; under `DropOldest` it is
    /// always `data.len()`.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let shared = &*self.shared;
        let capacity = shared.capacity;
        let read = shared.read_index.load(Ordering::Acquire);
        let before = shared.available(self.write_pos, read);
        if before < shared.threshold {
            self.armed = true;
        }

        let (accepted, skip) = match shared.policy {
            OverrunPolicy::DropNewest => {
                let accepted = data.len().min(capacity - before);
                if accepted < data.len() {
                    self.record_overrun(data.len() - accepted);
                }
                (accepted, 0)
            }
            OverrunPolicy::DropOldest => {
                let end = self.write_pos.wrapping_add(data.len());
                let lost = end.wrapping_sub(read).saturating_sub(capacity);
                if lost > 0 {
                    self.record_overrun(lost);
                }
                (data.len(), data.len().saturating_sub(capacity))
            }
        };
        if accepted == 0 {
            return 0;
        }

        let end = self.write_pos.wrapping_add(accepted);
        shared.write_claim.store(end, Ordering::Relaxed);
        fence(Ordering::Release);
        let start = self.write_pos.wrapping_add(skip);
        for (i, byte) in data[skip..accepted].iter().enumerate() {
            shared.slot(start.wrapping_add(i)).store(*byte, Ordering::Relaxed);
        }
        shared.write_index.store(end, Ordering::Release);
        self.write_pos = end;

        let after = shared.available(end, read);
        if self.armed && after >= shared.threshold {
            self.armed = false;
            if let Some(callback) = self.on_threshold.as_mut() {
                callback();
            }
        }
        accepted
    }

    /// Write `parts` back to back if all of them fit, otherwise nothing.
    ///
    /// A rejected write counts as one overrun of the combined length,
    /// whatever the policy. Used to keep records whole.
    pub fn try_write_all(&mut self, parts: &[&[u8]]) -> bool {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total > self.free() {
            self.record_overrun(total);
            return false;
        }
        for part in parts {
            self.write(part);
        }
        true
    }

    fn record_overrun(&self, bytes: usize) {
        self.shared.overruns.fetch_add(1, Ordering::Relaxed);
        self.shared
            .dropped_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes currently buffered, as seen from the producer side
    #[must_use]
    pub fn available(&self) -> usize {
        let read = self.shared.read_index.load(Ordering::Acquire);
        self.shared.available(self.write_pos, read)
    }

    /// Bytes that can be written without an overrun
    #[must_use]
    pub fn free(&self) -> usize {
        self.shared.capacity - self.available()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.shared.threshold
    }

    #[must_use]
    pub fn overrun_policy(&self) -> OverrunPolicy {
        self.shared.policy
    }

    /// Number of `write` calls that lost data
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    /// Total bytes truncated or overwritten
    #[must_use]
    pub fn dropped_bytes(&self) -> u64 {
        self.shared.dropped_bytes.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &self.shared.capacity)
            .field("available", &self.available())
            .field("armed", &self.armed)
            .field("has_callback", &self.on_threshold.is_some())
            .finish()
    }
}

/// Reading end of the ring. Exactly one context may own it.
pub struct Consumer {
    shared: Arc<Shared>,
    read_pos: usize,
}

impl Consumer {
    /// Copy up to `buf.len()` bytes out of the ring, never blocking.
    ///
    /// Returns 0 when the ring is empty.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.copy_out(buf, true)
    }

    /// Like [`Consumer::read`] but leaves the bytes in the ring.
    pub fn peek(&mut self, buf: &mut [u8]) -> usize {
        self.copy_out(buf, false)
    }

    fn copy_out(&mut self, buf: &mut [u8], consume: bool) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let shared = &*self.shared;
        let capacity = shared.capacity;

        loop {
            let write = shared.write_index.load(Ordering::Acquire);
            let mut start = self.read_pos;
            if write.wrapping_sub(start) > capacity {
                // lapped by a DropOldest producer
                start = write.wrapping_sub(capacity);
            }
            let mut n = buf.len().min(write.wrapping_sub(start));
            if n == 0 {
                if consume {
                    self.commit(start);
                }
                return 0;
            }

            for (i, byte) in buf[..n].iter_mut().enumerate() {
                *byte = shared.slot(start.wrapping_add(i)).load(Ordering::Relaxed);
            }
            fence(Ordering::Acquire);
            let claim = shared.write_claim.load(Ordering::Relaxed);
            let overwritten = claim.wrapping_sub(start).saturating_sub(capacity);
            if overwritten >= n {
                continue;
            }
            if overwritten > 0 {
                buf.copy_within(overwritten..n, 0);
                n -= overwritten;
                start = start.wrapping_add(overwritten);
            }

            if consume {
                self.commit(start.wrapping_add(n));
            }
            return n;
        }
    }

    fn commit(&mut self, pos: usize) {
        self.read_pos = pos;
        self.shared.read_index.store(pos, Ordering::Release);
    }

    /// Bytes available to read
    #[must_use]
    pub fn available(&self) -> usize {
        let write = self.shared.write_index.load(Ordering::Acquire);
        self.shared.available(write, self.read_pos)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.shared.threshold
    }

    /// Number of producer `write` calls that lost data
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &self.shared.capacity)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ring(capacity: usize, threshold: usize, policy: OverrunPolicy) -> (Producer, Consumer) {
        RingBuffer::new(RingBufferConfig {
            capacity,
            threshold,
            overrun_policy: policy,
        })
        .unwrap()
        .split()
    }

    #[test]
    fn test_try_write_all_is_all_or_nothing() {
        let (mut producer, mut consumer) = ring(10, 0, OverrunPolicy::DropOldest);
        assert!(producer.try_write_all(&[b"head", b"body"]));
        assert!(!producer.try_write_all(&[b"head", b"body"]));
        assert_eq!(producer.overruns(), 1);
        assert_eq!(producer.dropped_bytes(), 8);

        let mut out = [0u8; 16];
        assert_eq!(consumer.read(&mut out), 8);
        assert_eq!(&out[..8], b"headbody");
    }

    fn counter(producer: &mut Producer) -> Arc<AtomicUsize> {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        producer.register_threshold_callback(move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });
        fired
    }

    #[test]
    fn test_config_errors() {
        let zero = RingBuffer::new(RingBufferConfig {
            capacity: 0,
            threshold: 0,
            overrun_policy: OverrunPolicy::DropNewest,
        });
        assert_eq!(zero.err(), Some(RingBufferError::ZeroCapacity));

        let high = RingBuffer::new(RingBufferConfig {
            capacity: 8,
            threshold: 9,
            overrun_policy: OverrunPolicy::DropOldest,
        });
        assert_eq!(
            high.err(),
            Some(RingBufferError::ThresholdOutOfRange {
                threshold: 9,
                capacity: 8
            })
        );

        assert!(RingBuffer::new(RingBufferConfig {
            capacity: 8,
            threshold: 8,
            overrun_policy: OverrunPolicy::DropNewest,
        })
        .is_ok());
    }

    #[test]
    fn test_read_empty_returns_zero() {
        let (_producer, mut consumer) = ring(16, 4, OverrunPolicy::DropNewest);
        let mut buf = [0u8; 4];
        assert_eq!(consumer.read(&mut buf), 0);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_short_read() {
        let (mut producer, mut consumer) = ring(16, 4, OverrunPolicy::DropNewest);
        assert_eq!(producer.write(b"abc"), 3);
        let mut buf = [0u8; 8];
        assert_eq!(consumer.read(&mut buf), 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn test_drop_newest_truncates() {
        let (mut producer, mut consumer) = ring(8, 4, OverrunPolicy::DropNewest);
        assert_eq!(producer.write(b"012345"), 6);
        assert_eq!(producer.write(b"6789"), 2);
        assert_eq!(producer.overruns(), 1);
        assert_eq!(producer.dropped_bytes(), 2);
        assert_eq!(producer.free(), 0);

        let mut buf = [0u8; 16];
        assert_eq!(consumer.read(&mut buf), 8);
        assert_eq!(&buf[..8], b"01234567");
        assert_eq!(producer.write(b"xy"), 2);
    }

    #[test]
    fn test_drop_oldest_keeps_suffix() {
        let (mut producer, mut consumer) = ring(8, 4, OverrunPolicy::DropOldest);
        assert_eq!(producer.write(b"012345"), 6);
        assert_eq!(producer.write(b"6789"), 4);
        assert_eq!(producer.overruns(), 1);
        assert_eq!(producer.dropped_bytes(), 2);

        let mut buf = [0u8; 16];
        assert_eq!(consumer.read(&mut buf), 8);
        assert_eq!(&buf[..8], b"23456789");
        assert_eq!(consumer.read(&mut buf), 0);
    }

    #[test]
    fn test_drop_oldest_single_write_larger_than_capacity() {
        let (mut producer, mut consumer) = ring(4, 0, OverrunPolicy::DropOldest);
        assert_eq!(producer.write(b"abcdefghij"), 10);
        let mut buf = [0u8; 8];
        assert_eq!(consumer.read(&mut buf), 4);
        assert_eq!(&buf[..4], b"ghij");
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let (mut producer, mut consumer) = ring(5, 0, OverrunPolicy::DropNewest);
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        for chunk in [b"abc", b"def", b"ghi", b"jkl"] {
            assert_eq!(producer.write(chunk), 3);
            let n = consumer.read(&mut buf);
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdefghijkl");
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (mut producer, mut consumer) = ring(8, 0, OverrunPolicy::DropNewest);
        producer.write(b"hello");
        let mut buf = [0u8; 2];
        assert_eq!(consumer.peek(&mut buf), 2);
        assert_eq!(&buf, b"he");
        assert_eq!(consumer.available(), 5);
        let mut all = [0u8; 8];
        assert_eq!(consumer.read(&mut all), 5);
        assert_eq!(&all[..5], b"hello");
    }

    #[test]
    fn test_threshold_fires_once_per_upward_crossing() {
        let (mut producer, mut consumer) = ring(16, 4, OverrunPolicy::DropNewest);
        let fired = counter(&mut producer);

        producer.write(b"ab");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        producer.write(b"cd");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        producer.write(b"ef");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Downward crossing never fires
        let mut buf = [0u8; 16];
        consumer.read(&mut buf);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        producer.write(b"0123456789");
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_threshold_single_large_write_fires_once() {
        let (mut producer, _consumer) = ring(64, 2, OverrunPolicy::DropOldest);
        let fired = counter(&mut producer);
        producer.write(&[7u8; 60]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_threshold_zero_never_fires() {
        let (mut producer, _consumer) = ring(8, 0, OverrunPolicy::DropNewest);
        let fired = counter(&mut producer);
        producer.write(b"abc");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_spsc_threads_in_order() {
        const TOTAL: usize = 200_000;
        let (mut producer, mut consumer) = ring(1024, 256, OverrunPolicy::DropNewest);

        let writer = std::thread::spawn(move || {
            let mut next = 0usize;
            while next < TOTAL {
                let end = (next + 97).min(TOTAL);
                let chunk: Vec<u8> = (next..end).map(|i| (i % 251) as u8).collect();
                let n = producer.write(&chunk);
                next += n;
                if n == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let mut received = 0usize;
        let mut buf = [0u8; 300];
        while received < TOTAL {
            let n = consumer.read(&mut buf);
            for byte in &buf[..n] {
                assert_eq!(*byte, (received % 251) as u8);
                received += 1;
            }
            if n == 0 {
                std::thread::yield_now();
            }
        }
        writer.join().unwrap();
        assert_eq!(consumer.overruns(), 0);
    }

    #[test]
    fn test_spsc_threads_drop_oldest_yields_increasing_suffixes() {
        const TOTAL: u32 = 100_000;
        let (mut producer, mut consumer) = ring(4 * 64, 0, OverrunPolicy::DropOldest);

        let writer = std::thread::spawn(move || {
            for i in 0..TOTAL {
                producer.write(&i.to_le_bytes());
            }
        });

        // Every word that survives must come out whole and in increasing order
        let mut last: Option<u32> = None;
        let mut buf = [0u8; 4];
        let mut pending = Vec::new();
        loop {
            let n = consumer.read(&mut buf);
            pending.extend_from_slice(&buf[..n]);
            if n == 0 && writer.is_finished() && consumer.is_empty() {
                break;
            }
            if pending.len() >= 4 {
                let aligned = pending.len() - pending.len() % 4;
                for word in pending[..aligned].chunks_exact(4) {
                    let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                    if let Some(prev) = last {
                        assert!(value > prev, "{value} after {prev}");
                    }
                    last = Some(value);
                }
                pending.drain(..aligned);
            }
        }
        writer.join().unwrap();
        assert_eq!(last, Some(TOTAL - 1));
    }
}
