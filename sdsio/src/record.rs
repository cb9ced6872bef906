//! SDS record framing inside a stream
//!
//! A recorded SDS stream is a sequence of records, each an 8-byte header
//! followed by `size` data bytes:
//!
//! ```text
//! +---------------+----------+-------------+
//! | timestamp u32 | size u32 | data[size]  |
//! +---------------+----------+-------------+
//!   little-endian
//! ```
//!
//! This framing belongs to the data, not the wire protocol: the server
//! stores it verbatim.

pub const RECORD_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub timestamp: u32,
    pub size: u32,
}

impl RecordHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut out = [0u8; RECORD_HEADER_SIZE];
        out[..4].copy_from_slice(&self.timestamp.to_le_bytes());
        out[4..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    #[must_use]
    pub fn decode(bytes: &[u8; RECORD_HEADER_SIZE]) -> Self {
        Self {
            timestamp: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Header plus data length
    #[must_use]
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.size as usize
    }
}

/// Build a complete record in one buffer
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_record(timestamp: u32, data: &[u8]) -> Vec<u8> {
    let header = RecordHeader {
        timestamp,
        size: data.len() as u32,
    };
    let mut out = Vec::with_capacity(header.record_len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(data);
    out
}
