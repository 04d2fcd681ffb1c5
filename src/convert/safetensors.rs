//! Streaming safetensors reader
//!
//! The archive layout is an 8-byte little-endian header length, a JSON
//! header mapping tensor names to `{dtype, shape, data_offsets}`, then the
//! raw data region. The reader parses the header once and serves one
//! bounded slice per tensor on demand, so the working set stays at a single
//! tensor no matter how large the archive is.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::utils::error::{AccelError, Result};

/// Upper bound sanity check: the 8-byte length field must fit in 32 bits
const HEADER_LEN_MAX: u64 = u32::MAX as u64;

/// Random-access byte provider backing a source archive
pub trait ByteSource {
    fn source_len(&self) -> u64;
    fn read_slice(&self, start: u64, end: u64) -> Result<&[u8]>;
}

/// Memory-mapped file source; the OS pages tensor slices in lazily
pub struct MmapSource {
    mmap: Mmap,
}

impl MmapSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap })
    }
}

impl ByteSource for MmapSource {
    fn source_len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_slice(&self, start: u64, end: u64) -> Result<&[u8]> {
        bounds_check(start, end, self.mmap.len() as u64)?;
        Ok(&self.mmap[start as usize..end as usize])
    }
}

impl ByteSource for Vec<u8> {
    fn source_len(&self) -> u64 {
        self.len() as u64
    }

    fn read_slice(&self, start: u64, end: u64) -> Result<&[u8]> {
        bounds_check(start, end, self.len() as u64)?;
        Ok(&self[start as usize..end as usize])
    }
}

fn bounds_check(start: u64, end: u64, len: u64) -> Result<()> {
    if start > end || end > len {
        return Err(AccelError::SourceMalformed(format!(
            "slice {}..{} out of bounds for source of {} bytes",
            start, end, len
        )));
    }
    Ok(())
}

/// Element dtype declared by the source archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDtype {
    F32,
    F16,
    BF16,
    /// Anything else passes through as opaque F32-shaped bytes
    Other(String),
}

impl SourceDtype {
    fn parse(s: &str) -> Self {
        match s {
            "F32" => Self::F32,
            "F16" => Self::F16,
            "BF16" => Self::BF16,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Header entry for one tensor
#[derive(Debug, Clone)]
pub struct TensorMeta {
    pub name: String,
    pub dtype: SourceDtype,
    pub shape: Vec<u32>,
    /// Byte range relative to the start of the data region
    pub data_offsets: (u64, u64),
}

impl TensorMeta {
    pub fn n_elems(&self) -> usize {
        self.shape.iter().map(|&d| d as usize).product()
    }
}

/// Parsed archive handle: header metadata plus a slice-serving source
#[derive(Debug)]
pub struct SafetensorsReader<S: ByteSource> {
    source: S,
    tensors: Vec<TensorMeta>,
    data_start: u64,
}

impl<S: ByteSource> SafetensorsReader<S> {
    /// Parse the header of `source`. No tensor data is read.
    pub fn open(source: S) -> Result<Self> {
        if source.source_len() < 8 {
            return Err(AccelError::SourceMalformed(
                "archive shorter than the 8-byte header length field".into(),
            ));
        }

        let len_bytes = source.read_slice(0, 8)?;
        let header_len = u64::from_le_bytes(len_bytes.try_into().expect("8-byte slice"));
        if header_len > HEADER_LEN_MAX {
            return Err(AccelError::SourceMalformed(format!(
                "header too large: {} bytes",
                header_len
            )));
        }
        if header_len == 0 || 8 + header_len > source.source_len() {
            return Err(AccelError::SourceMalformed(format!(
                "header length {} is invalid for archive of {} bytes",
                header_len,
                source.source_len()
            )));
        }

        let header_json: serde_json::Value =
            serde_json::from_slice(source.read_slice(8, 8 + header_len)?).map_err(|e| {
                AccelError::SourceMalformed(format!("invalid JSON header: {}", e))
            })?;

        let header_map = header_json.as_object().ok_or_else(|| {
            AccelError::SourceMalformed("header is not a JSON object".into())
        })?;

        let data_start = 8 + header_len;
        let data_len = source.source_len() - data_start;
        let mut tensors = Vec::with_capacity(header_map.len());

        // serde_json is built with preserve_order, so this iteration matches
        // the header's declared tensor order.
        for (key, value) in header_map {
            if key == "__metadata__" {
                continue;
            }

            let obj = value.as_object().ok_or_else(|| {
                AccelError::SourceMalformed(format!("tensor entry {} is not an object", key))
            })?;

            let dtype = obj
                .get("dtype")
                .and_then(|v| v.as_str())
                .map(SourceDtype::parse)
                .ok_or_else(|| {
                    AccelError::SourceMalformed(format!("tensor {} has no dtype", key))
                })?;

            let shape: Vec<u32> = obj
                .get("shape")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|x| x.as_u64().map(|d| d as u32)).collect())
                .ok_or_else(|| {
                    AccelError::SourceMalformed(format!("tensor {} has no shape", key))
                })?;

            let offsets = obj
                .get("data_offsets")
                .and_then(|v| v.as_array())
                .and_then(|arr| {
                    let start = arr.first()?.as_u64()?;
                    let end = arr.get(1)?.as_u64()?;
                    Some((start, end))
                })
                .ok_or_else(|| {
                    AccelError::SourceMalformed(format!("tensor {} has no data_offsets", key))
                })?;

            if offsets.0 > offsets.1 || offsets.1 > data_len {
                return Err(AccelError::SourceMalformed(format!(
                    "tensor {} offsets {:?} exceed data region of {} bytes",
                    key, offsets, data_len
                )));
            }

            tensors.push(TensorMeta {
                name: key.clone(),
                dtype,
                shape,
                data_offsets: offsets,
            });
        }

        Ok(Self {
            source,
            tensors,
            data_start,
        })
    }

    /// Tensor metadata in header declaration order
    pub fn tensors(&self) -> &[TensorMeta] {
        &self.tensors
    }

    /// Read the raw bytes of one tensor. One slice call, no buffering.
    pub fn read_tensor(&self, meta: &TensorMeta) -> Result<&[u8]> {
        self.source.read_slice(
            self.data_start + meta.data_offsets.0,
            self.data_start + meta.data_offsets.1,
        )
    }
}

/// Build a minimal in-memory safetensors archive (test + fixture helper)
pub fn build_archive(entries: &[(&str, &str, &[u32], Vec<u8>)]) -> Vec<u8> {
    let mut header = String::from("{");
    let mut offset = 0usize;
    for (i, (name, dtype, shape, data)) in entries.iter().enumerate() {
        if i > 0 {
            header.push(',');
        }
        let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
        header.push_str(&format!(
            "\"{}\":{{\"dtype\":\"{}\",\"shape\":[{}],\"data_offsets\":[{},{}]}}",
            name,
            dtype,
            dims.join(","),
            offset,
            offset + data.len()
        ));
        offset += data.len();
    }
    header.push('}');

    let mut out = Vec::new();
    out.extend_from_slice(&(header.len() as u64).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for (_, _, _, data) in entries {
        out.extend_from_slice(data);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn parses_header_and_reads_tensors() {
        let archive = build_archive(&[
            ("a", "F32", &[2, 2], f32_bytes(&[1.0, 2.0, 3.0, 4.0])),
            ("b", "F32", &[3], f32_bytes(&[0.5, -0.5, 0.0])),
        ]);

        let reader = SafetensorsReader::open(archive).unwrap();
        assert_eq!(reader.tensors().len(), 2);
        assert_eq!(reader.tensors()[0].name, "a");
        assert_eq!(reader.tensors()[0].shape, vec![2, 2]);
        assert_eq!(reader.tensors()[1].name, "b");

        let meta = reader.tensors()[1].clone();
        let bytes = reader.read_tensor(&meta).unwrap();
        assert_eq!(bytes, f32_bytes(&[0.5, -0.5, 0.0]).as_slice());
    }

    #[test]
    fn skips_metadata_key() {
        let mut archive = Vec::new();
        let header = r#"{"__metadata__":{"format":"pt"},"w":{"dtype":"F16","shape":[2],"data_offsets":[0,4]}}"#;
        archive.extend_from_slice(&(header.len() as u64).to_le_bytes());
        archive.extend_from_slice(header.as_bytes());
        archive.extend_from_slice(&[0u8; 4]);

        let reader = SafetensorsReader::open(archive).unwrap();
        assert_eq!(reader.tensors().len(), 1);
        assert_eq!(reader.tensors()[0].dtype, SourceDtype::F16);
    }

    #[test]
    fn rejects_oversized_header_length() {
        let mut archive = Vec::new();
        archive.extend_from_slice(&(u64::MAX).to_le_bytes());
        archive.extend_from_slice(&[0u8; 32]);
        let err = SafetensorsReader::open(archive).unwrap_err();
        assert!(err.to_string().contains("header too large"));
    }

    #[test]
    fn rejects_offsets_past_data_region() {
        let header = r#"{"w":{"dtype":"F32","shape":[8],"data_offsets":[0,32]}}"#;
        let mut archive = Vec::new();
        archive.extend_from_slice(&(header.len() as u64).to_le_bytes());
        archive.extend_from_slice(header.as_bytes());
        archive.extend_from_slice(&[0u8; 8]); // data region too short
        assert!(SafetensorsReader::open(archive).is_err());
    }

    #[test]
    fn preserves_header_declaration_order() {
        let archive = build_archive(&[
            ("z.last", "F32", &[1], f32_bytes(&[1.0])),
            ("a.first", "F32", &[1], f32_bytes(&[2.0])),
        ]);
        let reader = SafetensorsReader::open(archive).unwrap();
        assert_eq!(reader.tensors()[0].name, "z.last");
        assert_eq!(reader.tensors()[1].name, "a.first");
    }
}
