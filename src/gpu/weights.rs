//! Shard-to-device weight upload
//!
//! Shards store quantized tensors as one scale run followed by one data
//! run; the quantized matmul kernels want per-row `[scales][words]` layout
//! instead, so upload interleaves them. Host copies are dropped as soon as
//! each buffer is created; the weight table holds device handles only.

use std::collections::HashMap;

use crate::gpu::device::GpuContext;
use crate::quant::{self, Dtype};
use crate::shard::TensorRecord;
use crate::utils::error::{AccelError, Result};

/// One uploaded tensor
pub struct WeightEntry {
    pub buffer: wgpu::Buffer,
    /// Dtype as the kernels see it (F16 is widened to F32 on upload)
    pub dtype: Dtype,
    pub shape: Vec<u32>,
}

impl WeightEntry {
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

    pub fn cols(&self) -> usize {
        self.shape.last().map(|&d| d as usize).unwrap_or(0)
    }
}

/// Name-to-buffer map populated at load time, read-only afterwards
#[derive(Default)]
pub struct WeightTable {
    entries: HashMap<String, WeightEntry>,
    device_bytes: u64,
}

impl WeightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&WeightEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn device_bytes(&self) -> u64 {
        self.device_bytes
    }

    /// Upload one parsed record, transforming it into kernel layout
    pub fn upload(&mut self, ctx: &GpuContext, record: &TensorRecord, block: usize) -> Result<()> {
        let n_elems = record.n_elems();
        let expected = record.dtype.data_len(n_elems, block);
        if record.data.len() != expected {
            return Err(AccelError::SourceMalformed(format!(
                "tensor {} has {} data bytes, expected {}",
                record.name,
                record.data.len(),
                expected
            )));
        }

        let (buffer, dtype) = match record.dtype {
            Dtype::F32 => (
                ctx.create_storage_init(&record.name, &record.data),
                Dtype::F32,
            ),
            Dtype::F16 => {
                // Widen to f32 so the float matmul kernel serves it
                let widened: Vec<u8> = record
                    .data
                    .chunks_exact(2)
                    .flat_map(|c| {
                        quant::f16_to_f32(u16::from_le_bytes([c[0], c[1]])).to_le_bytes()
                    })
                    .collect();
                (ctx.create_storage_init(&record.name, &widened), Dtype::F32)
            }
            Dtype::Q8 | Dtype::Q4 => {
                let words = interleave_rows(record, block)?;
                (
                    ctx.create_storage_init(&record.name, bytemuck::cast_slice(&words)),
                    record.dtype,
                )
            }
        };

        self.device_bytes += buffer.size();
        self.entries.insert(
            record.name.clone(),
            WeightEntry {
                buffer,
                dtype,
                shape: record.shape.clone(),
            },
        );
        Ok(())
    }

    /// Drop every buffer (engine unload)
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.buffer.destroy();
        }
        self.device_bytes = 0;
    }
}

/// Rearrange `[all scales][all data]` into per-row `[scales][words]`
fn interleave_rows(record: &TensorRecord, block: usize) -> Result<Vec<u32>> {
    let rows = record.rows();
    let cols = record.cols();
    if cols == 0 || cols % block != 0 {
        return Err(AccelError::Unsupported(format!(
            "quantized tensor {} has row length {} not divisible by block {}",
            record.name, cols, block
        )));
    }

    let nb = cols / block; // blocks per row
    let row_data_bytes = match record.dtype {
        Dtype::Q8 => cols,
        Dtype::Q4 => cols / 2,
        _ => unreachable!("interleave only applies to quantized dtypes"),
    };
    let words_per_block = row_data_bytes / nb / 4;
    let scales_len = rows * nb * 4;
    let (scales, data) = record.data.split_at(scales_len);

    let mut words = Vec::with_capacity(rows * nb * (1 + words_per_block));
    for row in 0..rows {
        for b in 0..nb {
            let off = (row * nb + b) * 4;
            words.push(u32::from_le_bytes([
                scales[off],
                scales[off + 1],
                scales[off + 2],
                scales[off + 3],
            ]));
        }
        let row_off = row * row_data_bytes;
        for chunk in data[row_off..row_off + row_data_bytes].chunks_exact(4) {
            words.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::quantize_q8;

    #[test]
    fn interleave_puts_row_scales_before_row_data() {
        // 2 rows x 32 cols, block 32: one block per row
        let mut values = vec![1.0f32; 32];
        values.extend(vec![2.0f32; 32]);
        let (data, scales) = quantize_q8(&values, 32);

        let mut blob = Vec::new();
        for s in &scales {
            blob.extend_from_slice(&s.to_le_bytes());
        }
        blob.extend_from_slice(&data);

        let record = TensorRecord {
            name: "w".into(),
            dtype: Dtype::Q8,
            shape: vec![2, 32],
            data: blob,
        };
        let words = interleave_rows(&record, 32).unwrap();

        // Per row: 1 scale word + 8 data words
        assert_eq!(words.len(), 2 * (1 + 8));
        assert_eq!(f32::from_bits(words[0]), scales[0]);
        assert_eq!(f32::from_bits(words[9]), scales[1]);
        // First data word of row 0 holds four q8 bytes of value 127
        assert_eq!(words[1], u32::from_le_bytes([127, 127, 127, 127]));
    }

    #[test]
    fn interleave_rejects_misaligned_rows() {
        let record = TensorRecord {
            name: "w".into(),
            dtype: Dtype::Q8,
            shape: vec![2, 30],
            data: vec![0; Dtype::Q8.data_len(60, 32)],
        };
        assert!(interleave_rows(&record, 32).is_err());
    }
}
