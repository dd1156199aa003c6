//! On-disk layout of a database file
//!
//! Each database is a single append-only file:
//!
//! - 8-byte magic header
//! - checksummed batch frames, one per committed transaction
//!
//! ## Frame layout
//!
//! - crc32 (u32 le) over length + payload
//! - payload length (u32 le)
//! - payload: bincode-encoded `Vec<Record>`
//!
//! ## Recovery
//!
//! Frames are replayed in order. A frame that is cut short or fails its
//! checksum marks a torn tail from an interrupted write; the caller
//! truncates the file back to the last good frame. A frame whose checksum
//! holds but whose payload will not decode is reported as corruption
//! instead, since truncating there would discard intact data.

use crate::error::{Result, StoreError};
use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

pub const MAGIC: &[u8; 8] = b"BODEGA01";

const FRAME_HEADER_LEN: usize = 8;

// Sanity bound on a single frame's payload; anything larger is garbage
// from a torn length field.
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// One mutation inside a committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    CreateBucket { bucket: String },
    DeleteBucket { bucket: String },
    Put { bucket: String, key: Vec<u8>, value: Vec<u8> },
    Delete { bucket: String, key: Vec<u8> },
}

/// Outcome of reading one frame during replay.
#[derive(Debug)]
pub enum FrameRead {
    /// A complete, checksummed batch
    Frame(Vec<Record>),
    /// Clean end of file
    Eof,
    /// Partial or checksum-failed frame at the tail
    Torn,
}

/// Write the file magic at the start of an empty file.
pub fn write_header(file: &mut File) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(MAGIC)?;
    file.sync_all()?;
    Ok(())
}

/// Verify the file magic, leaving the cursor at the first frame.
pub fn check_header(file: &mut File) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(StoreError::Corruption(
            "not a bodega database file".to_string(),
        ));
    }
    Ok(())
}

/// Encode a committed batch as a single frame.
pub fn encode_frame(records: &[Record]) -> Result<Vec<u8>> {
    let payload = bincode::serialize(records)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(StoreError::Storage("transaction too large".to_string()));
    }

    let mut hasher = Hasher::new();
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(&payload);
    let checksum = hasher.finalize();

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u32_le(checksum);
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(&payload);

    Ok(frame.to_vec())
}

/// Append an encoded frame and force it to disk.
pub fn append_frame(file: &mut File, frame: &[u8]) -> Result<()> {
    file.write_all(frame)?;
    file.sync_all()?;
    Ok(())
}

/// Read the next frame at the file cursor.
pub fn read_frame(file: &mut File) -> Result<FrameRead> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let n = read_full(file, &mut header)?;
    if n == 0 {
        return Ok(FrameRead::Eof);
    }
    if n < FRAME_HEADER_LEN {
        return Ok(FrameRead::Torn);
    }

    let mut buf = &header[..];
    let checksum = buf.get_u32_le();
    let length = buf.get_u32_le();
    if length > MAX_FRAME_LEN {
        return Ok(FrameRead::Torn);
    }

    let mut payload = vec![0u8; length as usize];
    let n = read_full(file, &mut payload)?;
    if n < payload.len() {
        return Ok(FrameRead::Torn);
    }

    let mut hasher = Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(&payload);
    if hasher.finalize() != checksum {
        return Ok(FrameRead::Torn);
    }

    let records = bincode::deserialize(&payload)
        .map_err(|e| StoreError::Corruption(format!("undecodable batch: {e}")))?;
    Ok(FrameRead::Frame(records))
}

/// Read until the buffer is full or EOF, returning how much was read.
fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
