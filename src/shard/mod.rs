//! Self-describing tensor container
//!
//! A shard is a flat concatenation of tensor records, little-endian
//! throughout, with no padding, trailer, or checksum:
//!
//! ```text
//! u32 name_len | name bytes | u8 dtype | u8 ndim | u32 x ndim shape
//! | u32 data_len | data bytes
//! ```
//!
//! For Q4/Q8 the data region is `nBlocks x f32` scales followed by the
//! packed quantized bytes. Shards live in the local object store and are
//! re-downloadable from the model source, so integrity is delegated to the
//! filesystem.

use crate::quant::Dtype;
use crate::utils::error::{AccelError, Result};

/// One decoded tensor record
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<u32>,
    pub data: Vec<u8>,
}

impl TensorRecord {
    pub fn n_elems(&self) -> usize {
        self.shape.iter().map(|&d| d as usize).product()
    }

    /// Rows of a rank >= 2 tensor (leading dimensions collapsed)
    pub fn rows(&self) -> usize {
        if self.shape.len() < 2 {
            1
        } else {
            self.shape[..self.shape.len() - 1]
                .iter()
                .map(|&d| d as usize)
                .product()
        }
    }

    /// Trailing (contraction) dimension
    pub fn cols(&self) -> usize {
        self.shape.last().map(|&d| d as usize).unwrap_or(0)
    }
}

/// Serialize a single tensor record
pub fn pack_tensor(name: &str, dtype: Dtype, shape: &[u32], data: &[u8]) -> Result<Vec<u8>> {
    if shape.is_empty() || shape.len() > 4 {
        return Err(AccelError::Unsupported(format!(
            "tensor {} has unsupported rank {}",
            name,
            shape.len()
        )));
    }
    let name_bytes = name.as_bytes();
    let mut out = Vec::with_capacity(4 + name_bytes.len() + 2 + shape.len() * 4 + 4 + data.len());

    out.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(name_bytes);
    out.push(dtype.code());
    out.push(shape.len() as u8);
    for &dim in shape {
        out.extend_from_slice(&dim.to_le_bytes());
    }
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);

    Ok(out)
}

/// Parse a whole shard into its tensor records.
///
/// Fails if any length field would run past the remaining bytes or a dtype
/// code is unknown; a truncated or corrupt shard never yields partial data.
pub fn parse_shard(bytes: &[u8]) -> Result<Vec<TensorRecord>> {
    let mut records = Vec::new();
    let mut cursor = Cursor::new(bytes);

    while !cursor.is_empty() {
        let name_len = cursor.read_u32()? as usize;
        let name_bytes = cursor.read_bytes(name_len)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| AccelError::SourceMalformed("tensor name is not UTF-8".into()))?
            .to_string();

        let dtype = Dtype::from_code(cursor.read_u8()?)?;
        let ndim = cursor.read_u8()? as usize;
        if ndim == 0 || ndim > 4 {
            return Err(AccelError::SourceMalformed(format!(
                "tensor {} has invalid rank {}",
                name, ndim
            )));
        }

        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            shape.push(cursor.read_u32()?);
        }

        let data_len = cursor.read_u32()? as usize;
        let data = cursor.read_bytes(data_len)?.to_vec();

        records.push(TensorRecord {
            name,
            dtype,
            shape,
            data,
        });
    }

    Ok(records)
}

/// Bounds-checked little-endian reader over a byte slice
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(|| {
            AccelError::SourceMalformed("record length overflows the shard".into())
        })?;
        if end > self.bytes.len() {
            return Err(AccelError::SourceMalformed(format!(
                "record needs {} bytes but only {} remain",
                len,
                self.bytes.len() - self.pos
            )));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
