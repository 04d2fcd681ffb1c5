//! Accel-Engine: local LLM inference on wgpu compute
//!
//! This library converts LLaMA-family safetensors checkpoints into compact
//! block-quantized shard bundles, stages them in a local object store,
//! uploads the weights to a GPU, and drives a KV-cached token-by-token
//! forward pass over a fixed set of WGSL compute kernels, streaming tokens
//! to the caller.
//!
//! ## Example
//!
//! ```no_run
//! use accel_engine::config::EngineSettings;
//! use accel_engine::inference::templates::ChatMessage;
//! use accel_engine::{Engine, ModelDescriptor, ObjectStore, SamplingParams};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = ObjectStore::open("./data").await?;
//!     let engine = Engine::new(store, &EngineSettings::default());
//!
//!     let descriptor = ModelDescriptor {
//!         id: "tinyllama-q4".into(),
//!         name: "TinyLlama 1.1B".into(),
//!         arch: None,
//!         quant: Some("q4".into()),
//!         hosted_base: None,
//!         source_base: "https://example.com/tinyllama".into(),
//!         weight_file: "model.safetensors".into(),
//!         tokenizer_file: Some("tokenizer.json".into()),
//!         max_position: None,
//!     };
//!
//!     let mut progress = engine.load(descriptor).await?;
//!     while let Some(event) = progress.recv().await {
//!         println!("{:?}", event);
//!     }
//!
//!     let mut tokens = engine
//!         .generate(
//!             vec![ChatMessage { role: "user".into(), content: "Hi!".into() }],
//!             SamplingParams::default(),
//!         )
//!         .await?;
//!     while let Some(event) = tokens.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod convert;
pub mod engine;
pub mod gpu;
pub mod inference;
pub mod model;
pub mod quant;
pub mod shard;
pub mod store;
pub mod utils;

pub use api::{build_router, AppState};
pub use config::AccelConfig;
pub use engine::events::{EngineState, GenerationEvent, LoadEvent, LoadPhase, LoadProgress};
pub use engine::Engine;
pub use inference::SamplingParams;
pub use model::{Manifest, ModelConfig, ModelDescriptor};
pub use quant::{Dtype, QuantMode, QuantPolicy};
pub use store::ObjectStore;
pub use utils::error::{AccelError, Result};
