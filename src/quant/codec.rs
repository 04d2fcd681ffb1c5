//! Quantize/dequantize kernels for the converter and test harness
//!
//! All codecs operate block-wise: `ceil(len / block)` contiguous blocks,
//! one f32 scale each. Values are stored as `round(x / scale)` and
//! reconstructed as `stored * scale`.

use half::f16;

/// Quantize to signed 8-bit with per-block scales.
///
/// Per block: `scale = maxabs / 127`, values clamped to [-128, 127].
/// An all-zero block gets scale 0 and zero outputs.
pub fn quantize_q8(src: &[f32], block: usize) -> (Vec<u8>, Vec<f32>) {
    let n_blocks = src.len().div_ceil(block);
    let mut data = Vec::with_capacity(src.len());
    let mut scales = Vec::with_capacity(n_blocks);

    for chunk in src.chunks(block) {
        let maxabs = chunk.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        let scale = maxabs / 127.0;
        scales.push(scale);

        if scale == 0.0 {
            data.extend(std::iter::repeat(0u8).take(chunk.len()));
            continue;
        }

        for &x in chunk {
            let q = (x / scale).round().clamp(-128.0, 127.0) as i8;
            data.push(q as u8);
        }
    }

    (data, scales)
}

/// Reconstruct f32 values from a Q8 stream
pub fn dequantize_q8(data: &[u8], scales: &[f32], block: usize, n_elems: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(n_elems);
    for (i, &b) in data.iter().take(n_elems).enumerate() {
        let scale = scales[i / block];
        out.push((b as i8) as f32 * scale);
    }
    out
}

/// Quantize to signed 4-bit with per-block scales, two values per byte.
///
/// The even-indexed element lands in the low nibble. With `calibrate` the
/// scale derives from the 99th percentile of |x| instead of the maximum,
/// which lets rare outliers clip rather than crushing the block's range.
pub fn quantize_q4(src: &[f32], block: usize, calibrate: bool) -> (Vec<u8>, Vec<f32>) {
    let n_blocks = src.len().div_ceil(block);
    let mut data = Vec::with_capacity(src.len().div_ceil(2));
    let mut scales = Vec::with_capacity(n_blocks);

    for chunk in src.chunks(block) {
        let maxabs = if calibrate {
            percentile_abs(chunk, 0.99)
        } else {
            chunk.iter().fold(0.0f32, |m, &x| m.max(x.abs()))
        };
        let scale = maxabs / 7.0;
        scales.push(scale);

        if scale == 0.0 {
            data.extend(std::iter::repeat(0u8).take(chunk.len().div_ceil(2)));
            continue;
        }

        for pair in chunk.chunks(2) {
            let lo = quantize_nibble(pair[0], scale);
            let hi = if pair.len() > 1 {
                quantize_nibble(pair[1], scale)
            } else {
                0
            };
            data.push(lo | (hi << 4));
        }
    }

    (data, scales)
}

fn quantize_nibble(x: f32, scale: f32) -> u8 {
    let q = (x / scale).round().clamp(-8.0, 7.0) as i8;
    (q as u8) & 0x0F
}

/// Reconstruct f32 values from a packed Q4 stream
pub fn dequantize_q4(data: &[u8], scales: &[f32], block: usize, n_elems: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(n_elems);
    let mut byte_idx = 0;

    let mut remaining = n_elems;
    let mut block_idx = 0;
    while remaining > 0 {
        let in_block = remaining.min(block);
        let scale = scales[block_idx];
        for i in 0..in_block {
            let byte = data[byte_idx + i / 2];
            let nib = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
            // Sign-extend the 4-bit two's complement value
            let signed = ((nib as i8) << 4) >> 4;
            out.push(signed as f32 * scale);
        }
        byte_idx += in_block.div_ceil(2);
        remaining -= in_block;
        block_idx += 1;
    }
    out
}

/// Absolute-value percentile of a block, used for outlier calibration
fn percentile_abs(chunk: &[f32], p: f32) -> f32 {
    let mut abs: Vec<f32> = chunk.iter().map(|x| x.abs()).collect();
    abs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((abs.len() - 1) as f32 * p).floor() as usize;
    abs[idx]
}

/// IEEE-754 binary16 conversion, round-to-nearest-ties-to-even (via `half`)
pub fn f32_to_f16(src: &[f32]) -> Vec<u16> {
    src.iter().map(|&x| f16::from_f32(x).to_bits()).collect()
}

pub fn f16_to_f32(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

/// BF16 is the upper half of the f32 bit pattern
pub fn bf16_to_f32(bits: u16) -> f32 {
    f32::from_bits((bits as u32) << 16)
}
