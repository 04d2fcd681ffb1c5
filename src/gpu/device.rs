//! Compute device facade over wgpu
//!
//! Owns the instance/adapter/device/queue handles and exposes the small set
//! of operations the engine needs: buffer allocation with usage flags,
//! buffer writes, command encoding, submission, and blocking readback of a
//! mappable staging buffer. Device loss is fatal to the session; there is
//! no transparent re-initialization.

use wgpu::util::DeviceExt;

use crate::gpu::uniforms::UNIFORM_SIZE;
use crate::utils::error::{AccelError, Result};

pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_name: String,
}

impl GpuContext {
    /// Acquire the highest-performance adapter and a default-limits device
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| {
            AccelError::Device("no GPU adapter found - is a GPU driver installed?".into())
        })?;

        let adapter_info = adapter.get_info();
        tracing::info!(
            "GPU: {} ({:?})",
            adapter_info.name,
            adapter_info.backend
        );

        // Full-precision embedding tables overflow the default 128 MiB
        // storage binding limit, so take whatever the adapter offers
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("accel-engine"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| AccelError::Device(format!("failed to create GPU device: {}", e)))?;

        Ok(Self {
            device,
            queue,
            adapter_name: adapter_info.name,
        })
    }

    /// Probe for an adapter without holding a device (health checks, tests)
    pub fn adapter_available() -> bool {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .is_some()
    }

    /// Storage buffer usable as copy source and destination
    pub fn create_storage(&self, label: &str, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size.max(4),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Storage buffer initialized from host bytes (weight upload)
    pub fn create_storage_init(&self, label: &str, contents: &[u8]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            })
    }

    /// One 256-byte uniform block
    pub fn create_uniform(&self, label: &str) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: UNIFORM_SIZE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Host-mappable staging buffer for readback
    pub fn create_staging(&self, label: &str, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size.max(4),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        })
    }

    pub fn write_buffer(&self, buffer: &wgpu::Buffer, bytes: &[u8]) {
        self.queue.write_buffer(buffer, 0, bytes);
    }

    pub fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    pub fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Block until `staging` is mapped, then copy out `count` f32 values.
    ///
    /// The caller must have copied into `staging` in an already submitted
    /// encoder; mapping waits for that submission to complete.
    pub fn read_staging_f32(&self, staging: &wgpu::Buffer, count: usize) -> Result<Vec<f32>> {
        let slice = staging.slice(..(count as u64 * 4));
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |v| {
            let _ = tx.send(v);
        });
        self.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|_| AccelError::Device("GPU readback channel closed".into()))?
            .map_err(|e| AccelError::Device(format!("GPU buffer map failed: {:?}", e)))?;

        let out = {
            let view = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&view)[..count].to_vec()
        };
        staging.unmap();
        Ok(out)
    }
}
