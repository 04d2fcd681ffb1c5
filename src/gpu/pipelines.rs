//! Kernel registry and pipeline construction
//!
//! One compute pipeline per kernel, compiled once per session. Bind group
//! layouts are explicit; every kernel binds its buffers at group 0 with the
//! uniform block in the last slot.

use std::collections::HashMap;

use crate::gpu::device::GpuContext;
use crate::gpu::shaders;
use crate::gpu::uniforms::{KernelUniforms, UNIFORM_SIZE};
use crate::quant::Dtype;
use crate::utils::error::{AccelError, Result};

/// The fixed kernel set the forward pass dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    TokenEmbed,
    RmsNorm,
    MatmulF32,
    MatmulQ4,
    MatmulQ8,
    RopeEmbed,
    Attention,
    Swiglu,
    LmHead,
    ResidualAdd,
}

/// Storage binding mode for one slot
#[derive(Debug, Clone, Copy)]
enum Slot {
    ReadOnly,
    ReadWrite,
}

impl Kernel {
    pub const ALL: [Kernel; 10] = [
        Kernel::TokenEmbed,
        Kernel::RmsNorm,
        Kernel::MatmulF32,
        Kernel::MatmulQ4,
        Kernel::MatmulQ8,
        Kernel::RopeEmbed,
        Kernel::Attention,
        Kernel::Swiglu,
        Kernel::LmHead,
        Kernel::ResidualAdd,
    ];

    pub fn entry_point(self) -> &'static str {
        match self {
            Kernel::TokenEmbed => "token_embed",
            Kernel::RmsNorm => "rms_norm",
            Kernel::MatmulF32 => "matmul_f32",
            Kernel::MatmulQ4 => "matmul_q4",
            Kernel::MatmulQ8 => "matmul_q8",
            Kernel::RopeEmbed => "rope_embed",
            Kernel::Attention => "attention_score",
            Kernel::Swiglu => "swiglu",
            Kernel::LmHead => "lm_head",
            Kernel::ResidualAdd => "residual_add",
        }
    }

    fn source(self) -> &'static str {
        match self {
            Kernel::TokenEmbed => shaders::TOKEN_EMBED,
            Kernel::RmsNorm => shaders::RMS_NORM,
            Kernel::MatmulF32 => shaders::MATMUL_F32,
            Kernel::MatmulQ4 => shaders::MATMUL_Q4,
            Kernel::MatmulQ8 => shaders::MATMUL_Q8,
            Kernel::RopeEmbed => shaders::ROPE_EMBED,
            Kernel::Attention => shaders::ATTENTION,
            Kernel::Swiglu => shaders::SWIGLU,
            Kernel::LmHead => shaders::LM_HEAD,
            Kernel::ResidualAdd => shaders::RESIDUAL_ADD,
        }
    }

    /// Storage slots in binding order; the uniform block follows them
    fn slots(self) -> &'static [Slot] {
        use Slot::*;
        match self {
            Kernel::TokenEmbed => &[ReadOnly, ReadOnly, ReadWrite],
            Kernel::RmsNorm => &[ReadOnly, ReadOnly, ReadWrite],
            Kernel::MatmulF32 | Kernel::MatmulQ4 | Kernel::MatmulQ8 => {
                &[ReadOnly, ReadOnly, ReadWrite]
            }
            Kernel::RopeEmbed => &[ReadWrite, ReadWrite],
            Kernel::Attention => &[ReadOnly, ReadOnly, ReadOnly, ReadWrite],
            Kernel::Swiglu => &[ReadOnly, ReadOnly, ReadWrite],
            Kernel::LmHead => &[ReadOnly, ReadOnly, ReadWrite],
            Kernel::ResidualAdd => &[ReadWrite, ReadOnly],
        }
    }

    /// Matmul variant serving a weight of the given stored dtype.
    ///
    /// F16 weights are widened to f32 at upload, so the f32 kernel covers
    /// both float precisions.
    pub fn matmul_for(dtype: Dtype) -> Kernel {
        match dtype {
            Dtype::F32 | Dtype::F16 => Kernel::MatmulF32,
            Dtype::Q8 => Kernel::MatmulQ8,
            Dtype::Q4 => Kernel::MatmulQ4,
        }
    }
}

struct KernelEntry {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

/// All compiled pipelines for one device session
pub struct KernelSet {
    kernels: HashMap<Kernel, KernelEntry>,
}

impl KernelSet {
    /// Compile every kernel against `ctx`'s device
    pub fn compile(ctx: &GpuContext) -> Result<Self> {
        let mut kernels = HashMap::new();
        for kernel in Kernel::ALL {
            kernels.insert(kernel, Self::build(ctx, kernel)?);
        }
        tracing::debug!("compiled {} compute pipelines", kernels.len());
        Ok(Self { kernels })
    }

    fn build(ctx: &GpuContext, kernel: Kernel) -> Result<KernelEntry> {
        let label = kernel.entry_point();
        let source = shaders::module_source(kernel.source());

        let module = ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let mut entries = Vec::new();
        for (i, slot) in kernel.slots().iter().enumerate() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: i as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: matches!(slot, Slot::ReadOnly),
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: kernel.slots().len() as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: wgpu::BufferSize::new(UNIFORM_SIZE),
            },
            count: None,
        });

        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &entries,
            });

        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });

        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: kernel.entry_point(),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });

        Ok(KernelEntry { pipeline, layout })
    }

    /// Record one dispatch: bind `buffers` in slot order, uniform last
    pub fn dispatch(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        kernel: Kernel,
        buffers: &[&wgpu::Buffer],
        uniform: &wgpu::Buffer,
        uniforms: &KernelUniforms,
        groups: (u32, u32, u32),
    ) -> Result<()> {
        let entry = self
            .kernels
            .get(&kernel)
            .ok_or_else(|| AccelError::Device(format!("kernel {:?} not compiled", kernel)))?;
        if buffers.len() != kernel.slots().len() {
            return Err(AccelError::InternalError(format!(
                "kernel {:?} expects {} buffers, got {}",
                kernel,
                kernel.slots().len(),
                buffers.len()
            )));
        }

        ctx.queue
            .write_buffer(uniform, 0, bytemuck::bytes_of(uniforms));

        let mut entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, b)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: b.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: buffers.len() as u32,
            resource: uniform.as_entire_binding(),
        });

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.entry_point()),
            layout: &entry.layout,
            entries: &entries,
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(kernel.entry_point()),
            timestamp_writes: None,
        });
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups.0, groups.1, groups.2);
        Ok(())
    }
}

/// Workgroup count for a 1-D launch of `threads` items, 256 per group
pub fn groups_1d(threads: u32) -> (u32, u32, u32) {
    (threads.div_ceil(256), 1, 1)
}

/// Workgroup grid for an MxN matmul with 8x8 tiles
pub fn groups_matmul(m: u32, n: u32) -> (u32, u32, u32) {
    (n.div_ceil(8), m.div_ceil(8), 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_selection_by_dtype() {
        assert_eq!(Kernel::matmul_for(Dtype::F32), Kernel::MatmulF32);
        assert_eq!(Kernel::matmul_for(Dtype::F16), Kernel::MatmulF32);
        assert_eq!(Kernel::matmul_for(Dtype::Q8), Kernel::MatmulQ8);
        assert_eq!(Kernel::matmul_for(Dtype::Q4), Kernel::MatmulQ4);
    }

    #[test]
    fn launch_math() {
        assert_eq!(groups_1d(1), (1, 1, 1));
        assert_eq!(groups_1d(256), (1, 1, 1));
        assert_eq!(groups_1d(257), (2, 1, 1));
        assert_eq!(groups_matmul(9, 16), (2, 2, 1));
    }
}
