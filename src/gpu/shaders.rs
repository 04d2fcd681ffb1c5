//! WGSL kernel sources
//!
//! Each kernel compiles as its own shader module (common uniform block +
//! kernel body), keeping the binding table of every module down to what its
//! entry point actually uses. `full_source` concatenates everything for the
//! copy recorded in the bundle.

pub const COMMON: &str = include_str!("shaders/common.wgsl");
pub const TOKEN_EMBED: &str = include_str!("shaders/token_embed.wgsl");
pub const RMS_NORM: &str = include_str!("shaders/rms_norm.wgsl");
pub const MATMUL_F32: &str = include_str!("shaders/matmul_f32.wgsl");
pub const MATMUL_Q4: &str = include_str!("shaders/matmul_q4.wgsl");
pub const MATMUL_Q8: &str = include_str!("shaders/matmul_q8.wgsl");
pub const ROPE_EMBED: &str = include_str!("shaders/rope_embed.wgsl");
pub const ATTENTION: &str = include_str!("shaders/attention.wgsl");
pub const SWIGLU: &str = include_str!("shaders/swiglu.wgsl");
pub const LM_HEAD: &str = include_str!("shaders/lm_head.wgsl");
pub const RESIDUAL_ADD: &str = include_str!("shaders/residual_add.wgsl");

/// Source of one compilable module: common declarations + kernel body
pub fn module_source(kernel_src: &str) -> String {
    format!("{}\n{}", COMMON, kernel_src)
}

/// Every kernel in one listing, as persisted at `webgpu/kernels.wgsl`
pub fn full_source() -> String {
    let mut out = String::from(COMMON);
    for src in [
        TOKEN_EMBED,
        RMS_NORM,
        MATMUL_F32,
        MATMUL_Q4,
        MATMUL_Q8,
        ROPE_EMBED,
        ATTENTION,
        SWIGLU,
        LM_HEAD,
        RESIDUAL_ADD,
    ] {
        out.push('\n');
        out.push_str(src);
    }
    out
}
