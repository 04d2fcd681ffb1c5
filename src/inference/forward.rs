//! Forward-pass orchestrator
//!
//! Builds the per-step dispatch graph over the kernel set: embed, then per
//! layer {norm, Q/K/V projection, RoPE, KV-cache copy, attention, output
//! projection, residual, optional post-attention norm, SwiGLU MLP,
//! residual}, then the final norm and vocabulary projection. Kernel
//! dispatches are totally ordered on one encoder per pass; the KV cursor
//! commits only after the submission (and readback, when requested)
//! succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::gpu::device::GpuContext;
use crate::gpu::pipelines::{groups_1d, groups_matmul, Kernel, KernelSet};
use crate::gpu::uniforms::KernelUniforms;
use crate::gpu::weights::{WeightEntry, WeightTable};
use crate::model::ModelConfig;
use crate::utils::error::{AccelError, Result};

use super::kv_cache::KvCache;

/// Widest head dimension the attention workgroup can aggregate
const MAX_HEAD_DIM: usize = 128;

/// Per-layer resolved tensor names
struct LayerNames {
    input_norm: String,
    q: String,
    k: String,
    v: String,
    o: String,
    post_attn_norm: Option<String>,
    gate: String,
    up: String,
    down: String,
}

/// Resolved lookup from transformer role to stored tensor name
struct ResolvedNames {
    embed: String,
    final_norm: Option<String>,
    /// None means the LM head reuses the embedding buffer
    lm_head: Option<String>,
    layers: Vec<LayerNames>,
}

/// GPU session state for one loaded model
pub struct ForwardSession {
    ctx: Arc<GpuContext>,
    kernels: KernelSet,
    weights: WeightTable,
    config: ModelConfig,
    block_size: usize,
    kv: KvCache,
    names: ResolvedNames,
    pool: BufferPool,
    logits_staging: wgpu::Buffer,
}

impl ForwardSession {
    pub fn new(
        ctx: Arc<GpuContext>,
        kernels: KernelSet,
        weights: WeightTable,
        config: ModelConfig,
        block_size: usize,
    ) -> Result<Self> {
        let head_dim = config.head_dim();
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(AccelError::Unsupported(format!(
                "head dimension {} must be even",
                head_dim
            )));
        }
        if head_dim > MAX_HEAD_DIM {
            return Err(AccelError::Unsupported(format!(
                "head dimension {} exceeds the kernel limit of {}",
                head_dim, MAX_HEAD_DIM
            )));
        }
        if config.num_attention_heads % config.num_key_value_heads != 0 {
            return Err(AccelError::Unsupported(format!(
                "{} query heads cannot group over {} KV heads",
                config.num_attention_heads, config.num_key_value_heads
            )));
        }

        let names = resolve_names(&weights, &config)?;

        let embed = weights
            .get(&names.embed)
            .expect("embed name resolved against the table");
        if embed.cols() != config.hidden_size {
            return Err(AccelError::Unsupported(format!(
                "embedding width {} does not match hidden size {}",
                embed.cols(),
                config.hidden_size
            )));
        }

        let kv = KvCache::new(&ctx, &config);
        let logits_staging =
            ctx.create_staging("logits.staging", config.vocab_size as u64 * 4);

        Ok(Self {
            ctx,
            kernels,
            weights,
            config,
            block_size,
            kv,
            names,
            pool: BufferPool::default(),
            logits_staging,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn kv_pos(&self) -> usize {
        self.kv.kv_pos()
    }

    pub fn kv_remaining(&self) -> usize {
        self.kv.remaining()
    }

    /// New conversation: drop every cached position
    pub fn reset(&mut self) {
        self.kv.reset();
    }

    /// Release all device resources
    pub fn destroy(&mut self) {
        self.weights.clear();
        self.kv.destroy();
    }

    /// Process a prompt run; the KV cache fills, logits are not read back
    pub fn prefill(&mut self, tokens: &[u32]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        self.forward(tokens, false).map(|_| ())
    }

    /// Process one token and read back the logits for the next
    pub fn decode(&mut self, token: u32) -> Result<Vec<f32>> {
        let logits = self.forward(&[token], true)?;
        logits.ok_or_else(|| AccelError::InternalError("decode produced no logits".into()))
    }

    fn forward(&mut self, tokens: &[u32], readback: bool) -> Result<Option<Vec<f32>>> {
        let seq_len = tokens.len();
        let kv_pos = self.kv.kv_pos();
        if kv_pos + seq_len > self.config.max_position_embeddings {
            return Err(AccelError::InvalidParameters(format!(
                "context window exhausted: {} + {} tokens exceeds {}",
                kv_pos, seq_len, self.config.max_position_embeddings
            )));
        }

        let cfg = self.config.clone();
        let l = seq_len as u32;
        let hidden = cfg.hidden_size as u32;
        let n_heads = cfg.num_attention_heads as u32;
        let n_kv = cfg.num_key_value_heads as u32;
        let head_dim = cfg.head_dim() as u32;
        let ffn = cfg.intermediate_size as u32;
        let vocab = cfg.vocab_size as u32;
        let total_seq = (kv_pos + seq_len) as u32;

        debug!(seq_len, kv_pos, readback, "forward pass");

        let mut scope = PassScope::default();
        let ctx = self.ctx.clone();
        let pool = &mut self.pool;

        let token_buf = pool.storage(&ctx, &mut scope, seq_len as u64 * 4);
        let ids: Vec<i32> = tokens.iter().map(|&t| t as i32).collect();
        ctx.write_buffer(&token_buf, bytemuck::cast_slice(&ids));

        let hidden_buf = pool.storage(&ctx, &mut scope, (l * hidden) as u64 * 4);
        let norm_buf = pool.storage(&ctx, &mut scope, (l * hidden) as u64 * 4);
        let q_buf = pool.storage(&ctx, &mut scope, (l * n_heads * head_dim) as u64 * 4);
        let k_buf = pool.storage(&ctx, &mut scope, (l * n_kv * head_dim) as u64 * 4);
        let v_buf = pool.storage(&ctx, &mut scope, (l * n_kv * head_dim) as u64 * 4);
        let attn_buf = pool.storage(&ctx, &mut scope, (l * n_heads * head_dim) as u64 * 4);
        let proj_buf = pool.storage(&ctx, &mut scope, (l * hidden) as u64 * 4);
        let gate_buf = pool.storage(&ctx, &mut scope, (l * ffn) as u64 * 4);
        let up_buf = pool.storage(&ctx, &mut scope, (l * ffn) as u64 * 4);
        let act_buf = pool.storage(&ctx, &mut scope, (l * ffn) as u64 * 4);
        let logits_buf = pool.storage(&ctx, &mut scope, vocab as u64 * 4);

        let mut encoder = ctx.encoder("forward");

        // Embedding lookup
        let embed = self.weights.get(&self.names.embed).expect("resolved");
        let u = pool.uniform(&ctx, &mut scope);
        self.kernels.dispatch(
            &ctx,
            &mut encoder,
            Kernel::TokenEmbed,
            &[&token_buf, &embed.buffer, &hidden_buf],
            &u,
            &KernelUniforms {
                seq_len: l,
                hidden,
                vocab_size: vocab,
                ..Default::default()
            },
            groups_1d(l * hidden),
        )?;

        for layer in 0..cfg.num_hidden_layers {
            let names = &self.names.layers[layer];
            let (cache_k, cache_v) = self.kv.layer_buffers(layer);

            // Pre-attention norm
            let w_norm = self.weights.get(&names.input_norm).expect("resolved");
            let u = pool.uniform(&ctx, &mut scope);
            self.kernels.dispatch(
                &ctx,
                &mut encoder,
                Kernel::RmsNorm,
                &[&hidden_buf, &w_norm.buffer, &norm_buf],
                &u,
                &KernelUniforms {
                    seq_len: l,
                    hidden,
                    eps: cfg.rms_norm_eps,
                    ..Default::default()
                },
                (l, 1, 1),
            )?;

            // Q/K/V projections, kernel chosen by each weight's dtype
            dispatch_matmul(
                &ctx, &self.kernels, pool, &mut scope, &mut encoder,
                self.weights.get(&names.q).expect("resolved"),
                &norm_buf, &q_buf, l, n_heads * head_dim, hidden, self.block_size,
            )?;
            dispatch_matmul(
                &ctx, &self.kernels, pool, &mut scope, &mut encoder,
                self.weights.get(&names.k).expect("resolved"),
                &norm_buf, &k_buf, l, n_kv * head_dim, hidden, self.block_size,
            )?;
            dispatch_matmul(
                &ctx, &self.kernels, pool, &mut scope, &mut encoder,
                self.weights.get(&names.v).expect("resolved"),
                &norm_buf, &v_buf, l, n_kv * head_dim, hidden, self.block_size,
            )?;

            // Rotary embedding over Q and K at the pass's base position
            let u = pool.uniform(&ctx, &mut scope);
            self.kernels.dispatch(
                &ctx,
                &mut encoder,
                Kernel::RopeEmbed,
                &[&q_buf, &k_buf],
                &u,
                &KernelUniforms {
                    seq_len: l,
                    n_heads,
                    n_kv,
                    head_dim,
                    theta: cfg.rope_theta,
                    offset: kv_pos as u32,
                    ..Default::default()
                },
                groups_1d(l * n_heads * head_dim / 2),
            )?;

            // Fresh K/V rows land in the cache at the current cursor
            encoder.copy_buffer_to_buffer(
                &k_buf,
                0,
                cache_k,
                self.kv.write_offset(),
                self.kv.run_bytes(seq_len),
            );
            encoder.copy_buffer_to_buffer(
                &v_buf,
                0,
                cache_v,
                self.kv.write_offset(),
                self.kv.run_bytes(seq_len),
            );

            // Attention over the cache, positions [0, kv_pos + seq_len)
            let u = pool.uniform(&ctx, &mut scope);
            self.kernels.dispatch(
                &ctx,
                &mut encoder,
                Kernel::Attention,
                &[&q_buf, cache_k, cache_v, &attn_buf],
                &u,
                &KernelUniforms {
                    seq_len: l,
                    n_heads,
                    n_kv,
                    head_dim,
                    scale_attn: 1.0 / (head_dim as f32).sqrt(),
                    offset: kv_pos as u32,
                    size: total_seq,
                    ..Default::default()
                },
                (l, n_heads, 1),
            )?;

            // Output projection and residual
            dispatch_matmul(
                &ctx, &self.kernels, pool, &mut scope, &mut encoder,
                self.weights.get(&names.o).expect("resolved"),
                &attn_buf, &proj_buf, l, hidden, n_heads * head_dim, self.block_size,
            )?;
            let u = pool.uniform(&ctx, &mut scope);
            self.kernels.dispatch(
                &ctx,
                &mut encoder,
                Kernel::ResidualAdd,
                &[&hidden_buf, &proj_buf],
                &u,
                &KernelUniforms {
                    size: l * hidden,
                    ..Default::default()
                },
                groups_1d(l * hidden),
            )?;

            // MLP input: post-attention norm when the layer declares one
            let mlp_input: &wgpu::Buffer = match &names.post_attn_norm {
                Some(name) => {
                    let w = self.weights.get(name).expect("resolved");
                    let u = pool.uniform(&ctx, &mut scope);
                    self.kernels.dispatch(
                        &ctx,
                        &mut encoder,
                        Kernel::RmsNorm,
                        &[&hidden_buf, &w.buffer, &norm_buf],
                        &u,
                        &KernelUniforms {
                            seq_len: l,
                            hidden,
                            eps: cfg.rms_norm_eps,
                            ..Default::default()
                        },
                        (l, 1, 1),
                    )?;
                    &norm_buf
                }
                None => &hidden_buf,
            };

            // SwiGLU MLP and residual
            dispatch_matmul(
                &ctx, &self.kernels, pool, &mut scope, &mut encoder,
                self.weights.get(&names.gate).expect("resolved"),
                mlp_input, &gate_buf, l, ffn, hidden, self.block_size,
            )?;
            dispatch_matmul(
                &ctx, &self.kernels, pool, &mut scope, &mut encoder,
                self.weights.get(&names.up).expect("resolved"),
                mlp_input, &up_buf, l, ffn, hidden, self.block_size,
            )?;
            let u = pool.uniform(&ctx, &mut scope);
            self.kernels.dispatch(
                &ctx,
                &mut encoder,
                Kernel::Swiglu,
                &[&gate_buf, &up_buf, &act_buf],
                &u,
                &KernelUniforms {
                    size: l * ffn,
                    ..Default::default()
                },
                groups_1d(l * ffn),
            )?;
            dispatch_matmul(
                &ctx, &self.kernels, pool, &mut scope, &mut encoder,
                self.weights.get(&names.down).expect("resolved"),
                &act_buf, &proj_buf, l, hidden, ffn, self.block_size,
            )?;
            let u = pool.uniform(&ctx, &mut scope);
            self.kernels.dispatch(
                &ctx,
                &mut encoder,
                Kernel::ResidualAdd,
                &[&hidden_buf, &proj_buf],
                &u,
                &KernelUniforms {
                    size: l * hidden,
                    ..Default::default()
                },
                groups_1d(l * hidden),
            )?;
        }

        // Final norm
        let final_hidden: &wgpu::Buffer = match &self.names.final_norm {
            Some(name) => {
                let w = self.weights.get(name).expect("resolved");
                let u = pool.uniform(&ctx, &mut scope);
                self.kernels.dispatch(
                    &ctx,
                    &mut encoder,
                    Kernel::RmsNorm,
                    &[&hidden_buf, &w.buffer, &norm_buf],
                    &u,
                    &KernelUniforms {
                        seq_len: l,
                        hidden,
                        eps: cfg.rms_norm_eps,
                        ..Default::default()
                    },
                    (l, 1, 1),
                )?;
                &norm_buf
            }
            None => &hidden_buf,
        };

        // Vocabulary projection, last position only
        let lm_name = self.names.lm_head.as_ref().unwrap_or(&self.names.embed);
        let lm = self.weights.get(lm_name).expect("resolved");
        let u = pool.uniform(&ctx, &mut scope);
        self.kernels.dispatch(
            &ctx,
            &mut encoder,
            Kernel::LmHead,
            &[final_hidden, &lm.buffer, &logits_buf],
            &u,
            &KernelUniforms {
                seq_len: l,
                hidden,
                vocab_size: vocab,
                last_only: 1,
                ..Default::default()
            },
            groups_1d(vocab),
        )?;

        if readback {
            encoder.copy_buffer_to_buffer(&logits_buf, 0, &self.logits_staging, 0, vocab as u64 * 4);
        }

        ctx.submit(encoder);

        let logits = if readback {
            Some(ctx.read_staging_f32(&self.logits_staging, vocab as usize)?)
        } else {
            None
        };

        // Commit the freshly written cache rows only after the pass succeeded
        self.kv.advance(seq_len)?;
        pool.release(scope);

        Ok(logits)
    }
}

/// Record one matmul, selecting the kernel variant by the weight's dtype
#[allow(clippy::too_many_arguments)]
fn dispatch_matmul(
    ctx: &GpuContext,
    kernels: &KernelSet,
    pool: &mut BufferPool,
    scope: &mut PassScope,
    encoder: &mut wgpu::CommandEncoder,
    weight: &WeightEntry,
    input: &wgpu::Buffer,
    output: &wgpu::Buffer,
    m: u32,
    n: u32,
    k: u32,
    block_size: usize,
) -> Result<()> {
    let kernel = Kernel::matmul_for(weight.dtype);
    let quant = match kernel {
        Kernel::MatmulQ4 | Kernel::MatmulQ8 => block_size as u32,
        _ => 0,
    };
    let u = pool.uniform(ctx, scope);
    kernels.dispatch(
        ctx,
        encoder,
        kernel,
        &[input, &weight.buffer, output],
        &u,
        &KernelUniforms {
            m,
            n,
            k,
            quant,
            ..Default::default()
        },
        groups_matmul(m, n),
    )
}

fn resolve_names(weights: &WeightTable, config: &ModelConfig) -> Result<ResolvedNames> {
    let find = |candidates: &[String]| -> Option<String> {
        candidates.iter().find(|c| weights.contains(c)).cloned()
    };
    let require = |role: &str, candidates: &[String]| -> Result<String> {
        find(candidates).ok_or_else(|| {
            AccelError::Unsupported(format!(
                "missing {} tensor (tried {})",
                role,
                candidates.join(", ")
            ))
        })
    };

    let embed = require(
        "embedding",
        &[
            "model.embed_tokens.weight".into(),
            "tok_embeddings.weight".into(),
            "transformer.wte.weight".into(),
        ],
    )?;

    let final_norm = find(&["model.norm.weight".into(), "norm.weight".into()]);

    // Explicit tying wins; otherwise fall back on whether a head exists
    let lm_head = if config.tie_word_embeddings {
        None
    } else {
        find(&["lm_head.weight".into(), "output.weight".into()])
    };

    let mut layers = Vec::with_capacity(config.num_hidden_layers);
    for i in 0..config.num_hidden_layers {
        let modern = format!("model.layers.{}", i);
        let legacy = format!("layers.{}", i);

        layers.push(LayerNames {
            input_norm: require(
                "input norm",
                &[
                    format!("{}.input_layernorm.weight", modern),
                    format!("{}.attention_norm.weight", legacy),
                ],
            )?,
            q: require(
                "Q projection",
                &[
                    format!("{}.self_attn.q_proj.weight", modern),
                    format!("{}.attention.wq.weight", legacy),
                ],
            )?,
            k: require(
                "K projection",
                &[
                    format!("{}.self_attn.k_proj.weight", modern),
                    format!("{}.attention.wk.weight", legacy),
                ],
            )?,
            v: require(
                "V projection",
                &[
                    format!("{}.self_attn.v_proj.weight", modern),
                    format!("{}.attention.wv.weight", legacy),
                ],
            )?,
            o: require(
                "output projection",
                &[
                    format!("{}.self_attn.o_proj.weight", modern),
                    format!("{}.attention.wo.weight", legacy),
                ],
            )?,
            post_attn_norm: find(&[
                format!("{}.post_attention_layernorm.weight", modern),
                format!("{}.ffn_norm.weight", legacy),
            ]),
            gate: require(
                "gate projection",
                &[
                    format!("{}.mlp.gate_proj.weight", modern),
                    format!("{}.feed_forward.w1.weight", legacy),
                ],
            )?,
            up: require(
                "up projection",
                &[
                    format!("{}.mlp.up_proj.weight", modern),
                    format!("{}.feed_forward.w3.weight", legacy),
                ],
            )?,
            down: require(
                "down projection",
                &[
                    format!("{}.mlp.down_proj.weight", modern),
                    format!("{}.feed_forward.w2.weight", legacy),
                ],
            )?,
        });
    }

    Ok(ResolvedNames {
        embed,
        final_norm,
        lm_head,
        layers,
    })
}

/// Transient buffer pool keyed by size; uniforms pooled separately.
///
/// Buffers taken during a pass are tracked in a `PassScope` and returned
/// when the pass releases it, so nothing transient outlives its pass while
/// allocations still amortize across decode steps.
#[derive(Default)]
struct BufferPool {
    free_storage: HashMap<u64, Vec<Arc<wgpu::Buffer>>>,
    free_uniforms: Vec<Arc<wgpu::Buffer>>,
}

#[derive(Default)]
struct PassScope {
    storage: Vec<(u64, Arc<wgpu::Buffer>)>,
    uniforms: Vec<Arc<wgpu::Buffer>>,
}

impl BufferPool {
    fn storage(
        &mut self,
        ctx: &GpuContext,
        scope: &mut PassScope,
        size: u64,
    ) -> Arc<wgpu::Buffer> {
        let buffer = self
            .free_storage
            .get_mut(&size)
            .and_then(|v| v.pop())
            .unwrap_or_else(|| Arc::new(ctx.create_storage("transient", size)));
        scope.storage.push((size, buffer.clone()));
        buffer
    }

    fn uniform(&mut self, ctx: &GpuContext, scope: &mut PassScope) -> Arc<wgpu::Buffer> {
        let buffer = self
            .free_uniforms
            .pop()
            .unwrap_or_else(|| Arc::new(ctx.create_uniform("uniforms")));
        scope.uniforms.push(buffer.clone());
        buffer
    }

    fn release(&mut self, scope: PassScope) {
        for (size, buffer) in scope.storage {
            self.free_storage.entry(size).or_default().push(buffer);
        }
        self.free_uniforms.extend(scope.uniforms);
    }
}
