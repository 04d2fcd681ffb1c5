//! Per-layer key/value cache on the device
//!
//! Each layer owns two storage buffers sized for the full context window.
//! One cursor tracks the next free position across all layers; positions
//! below it hold committed K/V rows, positions at or above it are
//! undefined. The cursor advances only after a forward pass completes, so
//! a failed pass never exposes partial cache writes.

use tracing::debug;

use crate::gpu::device::GpuContext;
use crate::model::ModelConfig;
use crate::utils::error::{AccelError, Result};

struct LayerCache {
    k: wgpu::Buffer,
    v: wgpu::Buffer,
}

pub struct KvCache {
    layers: Vec<LayerCache>,
    kv_pos: usize,
    max_position: usize,
    /// Bytes of one cached position (n_kv * head_dim * 4)
    row_bytes: u64,
}

impl KvCache {
    /// Allocate K and V for every layer at full context size
    pub fn new(ctx: &GpuContext, config: &ModelConfig) -> Self {
        let layer_bytes = config.kv_layer_bytes();
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(LayerCache {
                k: ctx.create_storage(&format!("kv.k.{}", i), layer_bytes),
                v: ctx.create_storage(&format!("kv.v.{}", i), layer_bytes),
            });
        }
        debug!(
            layers = layers.len(),
            mib_total = (2 * layers.len() as u64 * layer_bytes) / (1024 * 1024),
            "allocated KV cache"
        );
        Self {
            layers,
            kv_pos: 0,
            max_position: config.max_position_embeddings,
            row_bytes: config.num_key_value_heads as u64 * config.head_dim() as u64 * 4,
        }
    }

    pub fn kv_pos(&self) -> usize {
        self.kv_pos
    }

    pub fn max_position(&self) -> usize {
        self.max_position
    }

    /// Positions still available before the window is exhausted
    pub fn remaining(&self) -> usize {
        self.max_position - self.kv_pos
    }

    pub fn layer_buffers(&self, layer: usize) -> (&wgpu::Buffer, &wgpu::Buffer) {
        let l = &self.layers[layer];
        (&l.k, &l.v)
    }

    /// Byte offset of the next free position, where fresh K/V rows land
    pub fn write_offset(&self) -> u64 {
        self.kv_pos as u64 * self.row_bytes
    }

    /// Bytes of a run of `seq_len` positions
    pub fn run_bytes(&self, seq_len: usize) -> u64 {
        seq_len as u64 * self.row_bytes
    }

    /// Commit `seq_len` freshly written positions after a successful pass
    pub fn advance(&mut self, seq_len: usize) -> Result<()> {
        if self.kv_pos + seq_len > self.max_position {
            return Err(AccelError::InvalidParameters(format!(
                "KV cache overflow: {} + {} exceeds max position {}",
                self.kv_pos, seq_len, self.max_position
            )));
        }
        self.kv_pos += seq_len;
        Ok(())
    }

    /// New conversation: forget every cached position
    pub fn reset(&mut self) {
        self.kv_pos = 0;
    }

    /// Release all device buffers (engine unload)
    pub fn destroy(&mut self) {
        for layer in self.layers.drain(..) {
            layer.k.destroy();
            layer.v.destroy();
        }
        self.kv_pos = 0;
    }
}
