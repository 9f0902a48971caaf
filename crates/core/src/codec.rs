//! Record framing: `[magic | version | flags | len | body | crc32]`.
//!
//! The body is a binary serialization of [`RecordBody`]; bodies at or above
//! the compression threshold are deflated.  The CRC always covers the
//! *uncompressed* body, so corruption is caught even when the compressed
//! stream happens to inflate cleanly.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::record::Memory;

pub const FRAME_MAGIC: [u8; 4] = *b"MCR1";
pub const FRAME_VERSION: u8 = 1;
/// magic(4) + version(1) + flags(1) + body len(4)
pub const FRAME_HEADER_LEN: usize = 10;
/// crc32 of the uncompressed body
pub const FRAME_TRAILER_LEN: usize = 4;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    Put,
    Tombstone,
    Access,
}

/// Marks a prior record id as deleted.  Carries the owning principal and
/// session so index removal can replay from the frame alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: String,
}

/// Advisory access-metadata advance, batched and flushed periodically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessUpdate {
    pub id: Uuid,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordBody {
    Put(Memory),
    Tombstone(Tombstone),
    Access(AccessUpdate),
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Put(_) => RecordKind::Put,
            Self::Tombstone(_) => RecordKind::Tombstone,
            Self::Access(_) => RecordKind::Access,
        }
    }

    pub fn record_id(&self) -> Uuid {
        match self {
            Self::Put(memory) => memory.id,
            Self::Tombstone(tombstone) => tombstone.id,
            Self::Access(access) => access.id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Codec {
    pub enable_compression: bool,
    pub compression_threshold: usize,
}

impl Codec {
    pub fn new(enable_compression: bool, compression_threshold: usize) -> Self {
        Self {
            enable_compression,
            compression_threshold,
        }
    }

    /// Encode a record body into a complete frame.
    pub fn encode(&self, body: &RecordBody) -> Result<Vec<u8>> {
        let raw = bincode::serde::encode_to_vec(body, bincode::config::standard())
            .map_err(|err| MemoryError::Internal(format!("record encode failed: {err}")))?;
        let crc = crc32fast::hash(&raw);

        let mut flags = 0u8;
        let payload = if self.enable_compression && raw.len() >= self.compression_threshold {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw)?;
            let compressed = encoder.finish()?;
            flags |= FLAG_COMPRESSED;
            compressed
        } else {
            raw
        };

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len() + FRAME_TRAILER_LEN);
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.push(FRAME_VERSION);
        frame.push(flags);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    /// Decode a complete frame read from `segment_id` at `offset`; the
    /// location only feeds error reporting.
    pub fn decode(frame: &[u8], segment_id: u64, offset: u64) -> Result<RecordBody> {
        let corrupt = |reason: String| MemoryError::CorruptRecord {
            segment: segment_id,
            offset,
            reason,
        };

        if frame.len() < FRAME_HEADER_LEN + FRAME_TRAILER_LEN {
            return Err(corrupt(format!("frame truncated at {} bytes", frame.len())));
        }
        if frame[..4] != FRAME_MAGIC {
            return Err(corrupt("bad frame magic".into()));
        }
        if frame[4] != FRAME_VERSION {
            return Err(corrupt(format!("unsupported frame version {}", frame[4])));
        }
        let flags = frame[5];
        let body_len = u32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]) as usize;
        if frame.len() != FRAME_HEADER_LEN + body_len + FRAME_TRAILER_LEN {
            return Err(corrupt(format!(
                "frame length {} disagrees with header body length {body_len}",
                frame.len()
            )));
        }

        let payload = &frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len];
        let crc_bytes = &frame[FRAME_HEADER_LEN + body_len..];
        let expected_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

        let raw;
        let raw_slice: &[u8] = if flags & FLAG_COMPRESSED != 0 {
            let mut decoder = ZlibDecoder::new(payload);
            let mut inflated = Vec::new();
            decoder
                .read_to_end(&mut inflated)
                .map_err(|err| corrupt(format!("decompression failed: {err}")))?;
            raw = inflated;
            &raw
        } else {
            payload
        };

        let actual_crc = crc32fast::hash(raw_slice);
        if actual_crc != expected_crc {
            return Err(corrupt(format!(
                "crc mismatch: stored {expected_crc:#010x}, computed {actual_crc:#010x}"
            )));
        }

        let (body, consumed): (RecordBody, usize) =
            bincode::serde::decode_from_slice(raw_slice, bincode::config::standard())
                .map_err(|err| corrupt(format!("body decode failed: {err}")))?;
        if consumed != raw_slice.len() {
            return Err(corrupt(format!(
                "body decode consumed {consumed} of {} bytes",
                raw_slice.len()
            )));
        }
        Ok(body)
    }
}
