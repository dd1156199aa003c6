//! Value codec applied at the storage boundary.
//!
//! Every stored value carries a one-byte tag ahead of the payload so a
//! reader can always tell how the bytes were written, even when the store
//! was later reopened with a different compression setting.

use crate::error::{Result, StoreError};

const TAG_PLAIN: u8 = 0x00;
const TAG_SNAPPY: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Values stored as-is
    Plain,
    /// Values run through snappy before hitting disk
    Snappy,
}

impl Codec {
    pub fn new(compress: bool) -> Self {
        if compress {
            Codec::Snappy
        } else {
            Codec::Plain
        }
    }

    /// Encode a value for storage, prefixing the codec tag.
    pub fn encode(&self, value: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Plain => {
                let mut out = Vec::with_capacity(value.len() + 1);
                out.push(TAG_PLAIN);
                out.extend_from_slice(value);
                Ok(out)
            }
            Codec::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(value)
                    .map_err(|e| StoreError::Storage(format!("compression failed: {e}")))?;
                let mut out = Vec::with_capacity(compressed.len() + 1);
                out.push(TAG_SNAPPY);
                out.extend(compressed);
                Ok(out)
            }
        }
    }

    /// Decode a stored value. The tag decides how to read it, not the
    /// codec's own mode, so mixed-mode files stay readable.
    pub fn decode(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let (tag, payload) = stored
            .split_first()
            .ok_or_else(|| StoreError::Corruption("empty stored value".to_string()))?;
        match *tag {
            TAG_PLAIN => Ok(payload.to_vec()),
            TAG_SNAPPY => snap::raw::Decoder::new()
                .decompress_vec(payload)
                .map_err(|e| StoreError::Corruption(format!("decompression failed: {e}"))),
            other => Err(StoreError::Corruption(format!(
                "unknown value tag 0x{other:02x}"
            ))),
        }
    }

    /// Decode a stored value that is expected to be UTF-8 text.
    pub fn decode_str(&self, stored: &[u8]) -> Result<String> {
        let raw = self.decode(stored)?;
        String::from_utf8(raw)
            .map_err(|_| StoreError::Corruption("stored value is not UTF-8".to_string()))
    }
}
