//! Block-wise integer quantization codecs
//!
//! Weight tensors are partitioned into fixed-size blocks (default 32
//! elements), each carrying one f32 scale. Q8 stores one signed byte per
//! element, Q4 packs two signed nibbles per byte with the even-indexed
//! element in the low nibble.

pub mod codec;

use crate::utils::error::{AccelError, Result};
use serde::{Deserialize, Serialize};

pub use codec::{
    bf16_to_f32, dequantize_q4, dequantize_q8, f16_to_f32, f32_to_f16, quantize_q4, quantize_q8,
};

/// Default number of elements per quantization block
pub const DEFAULT_BLOCK_SIZE: usize = 32;

/// Storage dtype of a converted tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    F32,
    F16,
    Q8,
    Q4,
}

impl Dtype {
    /// Wire code used in shard records
    pub fn code(self) -> u8 {
        match self {
            Dtype::F32 => 0,
            Dtype::F16 => 1,
            Dtype::Q8 => 2,
            Dtype::Q4 => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Dtype::F32),
            1 => Ok(Dtype::F16),
            2 => Ok(Dtype::Q8),
            3 => Ok(Dtype::Q4),
            other => Err(AccelError::Unsupported(format!(
                "unknown dtype code {}",
                other
            ))),
        }
    }

    /// Exact byte length of the data region for `n_elems` elements,
    /// including the per-block scale prefix for quantized dtypes.
    pub fn data_len(self, n_elems: usize, block: usize) -> usize {
        match self {
            Dtype::F32 => n_elems * 4,
            Dtype::F16 => n_elems * 2,
            Dtype::Q8 => {
                let n_blocks = n_elems.div_ceil(block);
                n_blocks * 4 + n_elems
            }
            Dtype::Q4 => {
                // Nibbles are packed within each block, so a short trailing
                // block still rounds up to whole bytes on its own.
                let n_blocks = n_elems.div_ceil(block);
                let mut packed = 0;
                let mut remaining = n_elems;
                while remaining > 0 {
                    let in_block = remaining.min(block);
                    packed += in_block.div_ceil(2);
                    remaining -= in_block;
                }
                n_blocks * 4 + packed
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dtype::F32 => "f32",
            Dtype::F16 => "f16",
            Dtype::Q8 => "q8",
            Dtype::Q4 => "q4",
        }
    }
}

/// Target precision for converted weight tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuantMode {
    F32,
    F16,
    Q8,
    #[default]
    Q4,
}

impl QuantMode {
    /// Parse from string (case-insensitive)
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "f32" => Self::F32,
            "f16" => Self::F16,
            "q8" | "q8_0" | "8" => Self::Q8,
            "q4" | "q4_0" | "4" => Self::Q4,
            _ => Self::Q4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Q8 => "q8",
            Self::Q4 => "q4",
        }
    }

    /// Dtype that weight tensors take under this mode
    pub fn weight_dtype(self) -> Dtype {
        match self {
            Self::F32 => Dtype::F32,
            Self::F16 => Dtype::F16,
            Self::Q8 => Dtype::Q8,
            Self::Q4 => Dtype::Q4,
        }
    }
}

/// Quantization policy handed to the converter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantPolicy {
    /// Target precision for rank >= 2 weight tensors
    pub mode: QuantMode,
    /// Elements per block, 16-64
    pub block_size: usize,
    /// Use the 99th percentile instead of max-abs when deriving Q4 scales
    pub calibrate: bool,
}

impl Default for QuantPolicy {
    fn default() -> Self {
        Self {
            mode: QuantMode::Q4,
            block_size: DEFAULT_BLOCK_SIZE,
            calibrate: false,
        }
    }
}

impl QuantPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(16..=64).contains(&self.block_size) {
            return Err(AccelError::InvalidParameters(format!(
                "block size must be between 16 and 64, got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}
