use std::sync::atomic::{AtomicU32, Ordering};

use crate::protocol::INVALID_STREAM;

/// Thread-safe generator of server stream ids
///
/// Ids are monotonic and never handed out twice in one server session;
/// `INVALID_STREAM` is skipped.
#[derive(Debug)]
pub struct IdGen {
    next_id: AtomicU32,
}

impl IdGen {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
        }
    }

    /// Get the next unique ID
    pub fn get_next(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != INVALID_STREAM {
                return id;
            }
        }
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}
