//! Model descriptors, bundle manifests, and transformer configuration

pub mod loader;

use serde::{Deserialize, Serialize};

pub use loader::BundleLoader;

/// Bundle format version written into every manifest
pub const ACC_VERSION: &str = "1.0.0";

/// Caller-supplied description of a model to load.
///
/// When `hosted_base` is present the loader downloads pre-built shards
/// directly; otherwise it fetches `source_base/weight_file` and runs the
/// converter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique id, also the bundle directory name in the object store
    pub id: String,
    pub name: String,
    /// Architecture hint (e.g. "llama", "mistral"), merged over inference
    #[serde(default)]
    pub arch: Option<String>,
    /// Target quantization ("f32" | "f16" | "q8" | "q4")
    #[serde(default)]
    pub quant: Option<String>,
    /// Base URL serving a pre-built bundle (skips conversion)
    #[serde(default)]
    pub hosted_base: Option<String>,
    /// Base URL serving the source safetensors archive
    pub source_base: String,
    pub weight_file: String,
    #[serde(default)]
    pub tokenizer_file: Option<String>,
    /// Context length override
    #[serde(default)]
    pub max_position: Option<usize>,
}

/// Bundle manifest (`manifest.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub acc_version: String,
    pub arch: String,
    pub quant: String,
    pub num_shards: usize,
    pub tensor_count: usize,
    /// ISO-8601 creation timestamp
    pub created_at: String,
    pub block_size: usize,
    /// SHA-256 of the source archive the bundle was converted from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_digest: Option<String>,
}

/// Transformer hyperparameters (`config.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub arch: String,
    pub num_hidden_layers: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub rope_theta: f32,
    pub rms_norm_eps: f32,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    pub tie_word_embeddings: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            arch: "unknown".to_string(),
            num_hidden_layers: 32,
            hidden_size: 4096,
            num_attention_heads: 32,
            num_key_value_heads: 32,
            intermediate_size: 4 * 4096,
            vocab_size: 32000,
            max_position_embeddings: 4096,
            rope_theta: 500_000.0,
            rms_norm_eps: 1e-5,
            bos_token_id: 1,
            eos_token_id: 2,
            tie_word_embeddings: false,
        }
    }
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Bytes of one layer's K (or V) cache at full context
    pub fn kv_layer_bytes(&self) -> u64 {
        self.max_position_embeddings as u64
            * self.num_key_value_heads as u64
            * self.head_dim() as u64
            * 4
    }
}

/// Partial config overriding whatever inference derived from tensor names
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub num_hidden_layers: Option<usize>,
    #[serde(default)]
    pub hidden_size: Option<usize>,
    #[serde(default)]
    pub num_attention_heads: Option<usize>,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub intermediate_size: Option<usize>,
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub rope_theta: Option<f32>,
    #[serde(default)]
    pub rms_norm_eps: Option<f32>,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    #[serde(default)]
    pub tie_word_embeddings: Option<bool>,
}

impl ConfigOverrides {
    /// Merge on top of an inferred config; `Some` fields win
    pub fn apply(&self, mut config: ModelConfig) -> ModelConfig {
        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = self.$field.clone() {
                    config.$field = v;
                }
            };
        }
        take!(arch);
        take!(num_hidden_layers);
        take!(hidden_size);
        take!(num_attention_heads);
        take!(num_key_value_heads);
        take!(intermediate_size);
        take!(vocab_size);
        take!(max_position_embeddings);
        take!(rope_theta);
        take!(rms_norm_eps);
        take!(bos_token_id);
        take!(eos_token_id);
        take!(tie_word_embeddings);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_merge_on_top() {
        let inferred = ModelConfig {
            num_hidden_layers: 26,
            ..Default::default()
        };
        let overrides = ConfigOverrides {
            arch: Some("mistral".into()),
            rope_theta: Some(10_000.0),
            ..Default::default()
        };
        let merged = overrides.apply(inferred);
        assert_eq!(merged.arch, "mistral");
        assert_eq!(merged.rope_theta, 10_000.0);
        assert_eq!(merged.num_hidden_layers, 26);
    }

    #[test]
    fn kv_layer_bytes_counts_kv_heads_only() {
        let cfg = ModelConfig {
            max_position_embeddings: 2048,
            num_attention_heads: 32,
            num_key_value_heads: 8,
            hidden_size: 4096,
            ..Default::default()
        };
        assert_eq!(cfg.head_dim(), 128);
        assert_eq!(cfg.kv_layer_bytes(), 2048 * 8 * 128 * 4);
    }
}
