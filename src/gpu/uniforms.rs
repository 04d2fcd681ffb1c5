//! Kernel uniform block
//!
//! One fixed 256-byte struct shared by every kernel; each kernel reads only
//! the fields it names and ignores the rest. The Rust layout mirrors the
//! WGSL `Uniforms` declaration field for field, so values are assigned by
//! name, never by slot position.

use bytemuck::{Pod, Zeroable};

/// 256-byte uniform block, little-endian, matches `common.wgsl`
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct KernelUniforms {
    pub seq_len: u32,
    pub hidden: u32,
    pub vocab_size: u32,
    pub n_heads: u32,
    pub n_kv: u32,
    pub head_dim: u32,
    pub theta: f32,
    /// RoPE position offset, and the KV base offset for attention masking
    pub offset: u32,
    pub m: u32,
    pub n: u32,
    pub k: u32,
    /// Quantization block size for the quantized matmuls, 0 elsewhere
    pub quant: u32,
    pub eps: f32,
    pub scale_attn: f32,
    pub ffn_size: u32,
    /// Element count for elementwise kernels; total_seq for attention
    pub size: u32,
    pub last_only: u32,
    pub _pad: [u32; 47],
}

impl Default for KernelUniforms {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

/// Byte size of the uniform block; buffers and layouts all use this
pub const UNIFORM_SIZE: u64 = std::mem::size_of::<KernelUniforms>() as u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_is_exactly_256_bytes() {
        assert_eq!(UNIFORM_SIZE, 256);
    }

    #[test]
    fn leading_slots_follow_declaration_order() {
        let u = KernelUniforms {
            seq_len: 1,
            hidden: 2,
            vocab_size: 3,
            theta: 1.5,
            ..Default::default()
        };
        let bytes = bytemuck::bytes_of(&u);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 3);
        assert_eq!(
            f32::from_le_bytes(bytes[24..28].try_into().unwrap()),
            1.5
        );
    }
}
