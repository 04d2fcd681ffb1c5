//! GPU compute backend
//!
//! A thin facade over wgpu (device, buffers, encoders, readback), the fixed
//! kernel set the forward pass dispatches, and the shard-to-device weight
//! upload path.

pub mod device;
pub mod pipelines;
pub mod shaders;
pub mod uniforms;
pub mod weights;

pub use device::GpuContext;
pub use pipelines::{Kernel, KernelSet};
pub use uniforms::KernelUniforms;
pub use weights::{WeightEntry, WeightTable};
