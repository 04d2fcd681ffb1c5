//! Background GPU session worker
//!
//! All device state (weights, KV cache, pipelines) lives on one dedicated
//! thread. Commands arrive over an mpsc channel and are processed
//! strictly in order, so an unload queued behind a generation runs only
//! after the generation yields. Tokens stream back over a bounded channel;
//! the stop token is checked at every token boundary.

use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tokenizers::Tokenizer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::convert::pipeline::shard_name;
use crate::engine::events::{GenerationEvent, GenerationSummary, LoadEvent, LoadPhase, LoadProgress};
use crate::gpu::{GpuContext, KernelSet, WeightTable};
use crate::inference::{ForwardSession, Sampler, SamplingParams};
use crate::model::{Manifest, ModelConfig};
use crate::shard::parse_shard;
use crate::utils::error::{AccelError, Result};

/// Everything the worker needs to build a GPU session
pub struct WorkerInit {
    pub bundle_dir: PathBuf,
    pub manifest: Manifest,
    pub config: ModelConfig,
    pub tokenizer: Option<Arc<Tokenizer>>,
}

pub enum WorkerCommand {
    Generate {
        tokens: Vec<u32>,
        params: SamplingParams,
        stop: CancellationToken,
        events: tokio::sync::mpsc::Sender<GenerationEvent>,
        done: tokio::sync::oneshot::Sender<Result<GenerationSummary>>,
    },
    Shutdown,
}

/// Handle to the GPU thread
pub struct SessionWorker {
    cmd_tx: Sender<WorkerCommand>,
    join: Option<JoinHandle<()>>,
}

impl SessionWorker {
    /// Spawn the worker; the returned receiver resolves once the session is
    /// uploaded and warmed up (or failed to build).
    pub fn spawn(
        init: WorkerInit,
        progress: tokio::sync::mpsc::UnboundedSender<LoadEvent>,
    ) -> (Self, tokio::sync::oneshot::Receiver<Result<()>>) {
        let (cmd_tx, cmd_rx) = channel();
        let (init_tx, init_rx) = tokio::sync::oneshot::channel();

        let join = std::thread::Builder::new()
            .name("accel-gpu".into())
            .spawn(move || worker_main(init, cmd_rx, init_tx, progress))
            .expect("failed to spawn GPU worker thread");

        (
            Self {
                cmd_tx,
                join: Some(join),
            },
            init_rx,
        )
    }

    pub fn send(&self, command: WorkerCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| AccelError::Device("GPU worker thread is gone".into()))
    }

    /// Queue a shutdown behind any in-flight work and wait for the thread
    pub fn shutdown(mut self) {
        let _ = self.cmd_tx.send(WorkerCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn worker_main(
    init: WorkerInit,
    cmd_rx: Receiver<WorkerCommand>,
    init_tx: tokio::sync::oneshot::Sender<Result<()>>,
    progress: tokio::sync::mpsc::UnboundedSender<LoadEvent>,
) {
    let tokenizer = init.tokenizer.clone();
    let mut session = match build_session(init, &progress) {
        Ok(session) => {
            let _ = init_tx.send(Ok(()));
            session
        }
        Err(e) => {
            error!("GPU session setup failed: {}", e);
            let _ = init_tx.send(Err(e));
            return;
        }
    };

    info!("🧵 GPU worker ready (kv window {})", session.config().max_position_embeddings);

    while let Ok(command) = cmd_rx.recv() {
        match command {
            WorkerCommand::Generate {
                tokens,
                params,
                stop,
                events,
                done,
            } => {
                let result = run_generation(
                    &mut session,
                    tokenizer.as_deref(),
                    &tokens,
                    &params,
                    &stop,
                    &events,
                );
                match &result {
                    Ok(summary) => {
                        let _ = events.blocking_send(GenerationEvent::Done {
                            tokens_per_second: summary.tokens_per_second,
                            token_count: summary.token_count,
                        });
                    }
                    Err(e) => {
                        let _ = events.blocking_send(GenerationEvent::Error {
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                        });
                    }
                }
                let _ = done.send(result);
            }
            WorkerCommand::Shutdown => break,
        }
    }

    session.destroy();
    debug!("GPU worker thread exiting");
}

/// Upload weights and warm the pipelines with a single-token pass
fn build_session(
    init: WorkerInit,
    progress: &tokio::sync::mpsc::UnboundedSender<LoadEvent>,
) -> Result<ForwardSession> {
    let report = |percent: f32, message: String| {
        let _ = progress.send(LoadEvent::Progress(LoadProgress {
            percent,
            phase: LoadPhase::Gpu,
            message,
        }));
    };

    report(90.0, "acquiring GPU device".into());
    let ctx = Arc::new(GpuContext::new()?);
    let kernels = KernelSet::compile(&ctx)?;

    let mut weights = WeightTable::new();
    let shards_dir = init.bundle_dir.join("shards");
    for i in 0..init.manifest.num_shards {
        let path = shards_dir.join(shard_name(i));
        let bytes = std::fs::read(&path).map_err(|e| {
            AccelError::Storage(format!("read shard {}: {}", path.display(), e))
        })?;
        for record in parse_shard(&bytes)? {
            weights.upload(&ctx, &record, init.manifest.block_size)?;
        }
        report(
            90.0 + 8.0 * (i + 1) as f32 / init.manifest.num_shards as f32,
            format!("uploaded shard {}/{}", i + 1, init.manifest.num_shards),
        );
    }
    info!(
        tensors = weights.len(),
        mib = weights.device_bytes() / (1024 * 1024),
        "weights uploaded"
    );

    let block_size = init.manifest.block_size;
    let bos = init.config.bos_token_id;
    let mut session = ForwardSession::new(ctx, kernels, weights, init.config, block_size)?;

    // Warmup validates every pipeline before the engine reports Ready
    report(99.0, "warming up pipelines".into());
    session.decode(bos)?;
    session.reset();

    Ok(session)
}

fn run_generation(
    session: &mut ForwardSession,
    tokenizer: Option<&Tokenizer>,
    tokens: &[u32],
    params: &SamplingParams,
    stop: &CancellationToken,
    events: &tokio::sync::mpsc::Sender<GenerationEvent>,
) -> Result<GenerationSummary> {
    let tokenizer = tokenizer.ok_or_else(|| {
        AccelError::Unsupported("bundle carries no tokenizer; cannot generate".into())
    })?;
    if tokens.is_empty() {
        return Err(AccelError::InvalidParameters("empty prompt".into()));
    }
    let max_position = session.config().max_position_embeddings;
    if tokens.len() >= max_position {
        return Err(AccelError::InvalidParameters(format!(
            "prompt of {} tokens exceeds the {}-token context window",
            tokens.len(),
            max_position
        )));
    }

    // Every generation starts a fresh conversation over the full history
    session.reset();

    let eos = session.config().eos_token_id;
    let mut sampler = Sampler::new(params);
    let start = Instant::now();

    // Prefill all but the last prompt token, then decode it for the first
    // next-token distribution
    let (prefix, last) = tokens.split_at(tokens.len() - 1);
    session.prefill(prefix)?;
    let mut logits = session.decode(last[0])?;

    let max_stop_len = params.stop_sequences.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut tail = String::new();
    let mut token_count = 0usize;

    loop {
        if stop.is_cancelled() {
            debug!("stop requested, exiting at token boundary");
            break;
        }

        let id = sampler.sample(&logits);
        if id == eos {
            debug!("EOS sampled after {} tokens", token_count);
            break;
        }

        let text = tokenizer
            .decode(&[id], true)
            .map_err(|e| AccelError::InternalError(format!("token decode failed: {}", e)))?;

        if max_stop_len > 0 {
            // Stop sequences are usually special tokens, which the display
            // decode strips, so match against the raw rendering instead
            let raw = tokenizer
                .decode(&[id], false)
                .map_err(|e| AccelError::InternalError(format!("token decode failed: {}", e)))?;
            tail.push_str(&raw);
            if params.stop_sequences.iter().any(|s| tail.ends_with(s)) {
                debug!("stop sequence hit after {} tokens", token_count);
                break;
            }
            let excess = tail.len().saturating_sub(max_stop_len * 2);
            if excess > 0 {
                let mut cut = excess;
                while cut < tail.len() && !tail.is_char_boundary(cut) {
                    cut += 1;
                }
                tail.drain(..cut);
            }
        }

        if !text.is_empty()
            && events
                .blocking_send(GenerationEvent::Token { text, id })
                .is_err()
        {
            // Receiver dropped: the caller went away, stop politely
            warn!("token receiver closed, aborting generation");
            break;
        }
        token_count += 1;

        if token_count >= params.max_new_tokens {
            debug!("max_new_tokens reached");
            break;
        }
        // The next decode needs one free cache position
        if session.kv_pos() + 1 >= max_position {
            info!("context window exhausted at position {}", session.kv_pos());
            break;
        }

        logits = session.decode(id)?;
    }

    let elapsed = start.elapsed().as_secs_f64();
    let summary = GenerationSummary {
        tokens_per_second: if elapsed > 0.0 {
            token_count as f64 / elapsed
        } else {
            0.0
        },
        token_count,
    };
    info!(
        tokens = summary.token_count,
        tps = format!("{:.1}", summary.tokens_per_second),
        "generation complete"
    );
    Ok(summary)
}
