//! Architecture and hyperparameter detection from tensor names
//!
//! Checkpoints rarely ship a usable config next to the weights, so the
//! converter reconstructs one from the tensor name set and shapes, with
//! caller overrides merged on top.

use tracing::info;

use super::safetensors::TensorMeta;
use crate::model::{ConfigOverrides, ModelConfig};

/// Head dimension assumed when deriving head counts from projection shapes
const ASSUMED_HEAD_DIM: usize = 128;

/// Detect the architecture family from tensor name prefixes, leaves-first
pub fn detect_arch(tensors: &[TensorMeta]) -> &'static str {
    let has = |pat: &str| tensors.iter().any(|t| t.name.contains(pat));

    if has(".attention.wq") {
        return "llama_legacy";
    }
    if tensors.iter().any(|t| t.name.starts_with("transformer.h.")) {
        return "phi";
    }
    if has(".self_attn.q_proj") {
        // Gemma shares the llama layout but adds its own norm pair
        let gemma_marker =
            has("post_feedforward_layernorm") || has("pre_feedforward_layernorm");
        if gemma_marker && has("model.embed_tokens.weight") {
            return "gemma";
        }
        return "llama";
    }
    "unknown"
}

/// Derive a full config from the tensor set, then merge caller overrides
pub fn infer_config(tensors: &[TensorMeta], overrides: &ConfigOverrides) -> ModelConfig {
    let mut config = ModelConfig {
        arch: detect_arch(tensors).to_string(),
        ..Default::default()
    };

    if let Some(n) = count_layers(tensors) {
        config.num_hidden_layers = n;
    }

    if let Some(embed) = find_tensor(tensors, &["embed_tokens.weight", "tok_embeddings.weight", "wte.weight"]) {
        if embed.shape.len() == 2 {
            config.vocab_size = embed.shape[0] as usize;
            config.hidden_size = embed.shape[1] as usize;
        }
    }

    let q_rows = find_tensor(tensors, &["self_attn.q_proj.weight", "attention.wq.weight"])
        .and_then(|t| t.shape.first().copied())
        .map(|r| r as usize);
    if let Some(rows) = q_rows {
        let heads = (rows as f64 / ASSUMED_HEAD_DIM as f64).round() as usize;
        if heads > 0 {
            config.num_attention_heads = heads;
        }
    }

    // A narrower K projection reveals grouped-query attention
    config.num_key_value_heads = config.num_attention_heads;
    let k_rows = find_tensor(tensors, &["self_attn.k_proj.weight", "attention.wk.weight"])
        .and_then(|t| t.shape.first().copied())
        .map(|r| r as usize);
    if let (Some(q), Some(k)) = (q_rows, k_rows) {
        if k < q && k > 0 && q % k == 0 {
            config.num_key_value_heads = config.num_attention_heads * k / q;
        }
    }

    config.intermediate_size = find_tensor(
        tensors,
        &["mlp.gate_proj.weight", "feed_forward.w1.weight"],
    )
    .and_then(|t| t.shape.first().copied())
    .map(|r| r as usize)
    .unwrap_or(4 * config.hidden_size);

    // An absent LM head means the embedding doubles as the output projection
    config.tie_word_embeddings = !tensors.iter().any(|t| t.name.contains("lm_head.weight"));

    let config = overrides.apply(config);
    info!(
        arch = %config.arch,
        layers = config.num_hidden_layers,
        hidden = config.hidden_size,
        heads = config.num_attention_heads,
        kv_heads = config.num_key_value_heads,
        vocab = config.vocab_size,
        "inferred model configuration"
    );
    config
}

/// Count distinct layer indices appearing as `.layers.N.` or `transformer.h.N.`
fn count_layers(tensors: &[TensorMeta]) -> Option<usize> {
    let mut indices = std::collections::BTreeSet::new();
    for t in tensors {
        for marker in ["layers.", "transformer.h."] {
            if let Some(pos) = t.name.find(marker) {
                let rest = &t.name[pos + marker.len()..];
                let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                if !digits.is_empty() && rest[digits.len()..].starts_with('.') {
                    if let Ok(idx) = digits.parse::<usize>() {
                        indices.insert(idx);
                    }
                }
                break;
            }
        }
    }
    if indices.is_empty() {
        None
    } else {
        Some(indices.len())
    }
}

fn find_tensor<'a>(tensors: &'a [TensorMeta], suffixes: &[&str]) -> Option<&'a TensorMeta> {
    tensors
        .iter()
        .find(|t| suffixes.iter().any(|s| t.name.ends_with(s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::safetensors::SourceDtype;

    fn meta(name: &str, shape: &[u32]) -> TensorMeta {
        TensorMeta {
            name: name.to_string(),
            dtype: SourceDtype::F32,
            shape: shape.to_vec(),
            data_offsets: (0, 0),
        }
    }

    fn llama_tensors(layers: usize) -> Vec<TensorMeta> {
        let mut out = vec![meta("model.embed_tokens.weight", &[32000, 4096])];
        for i in 0..layers {
            out.push(meta(
                &format!("model.layers.{}.self_attn.q_proj.weight", i),
                &[4096, 4096],
            ));
            out.push(meta(
                &format!("model.layers.{}.self_attn.k_proj.weight", i),
                &[1024, 4096],
            ));
            out.push(meta(
                &format!("model.layers.{}.mlp.gate_proj.weight", i),
                &[11008, 4096],
            ));
        }
        out.push(meta("model.norm.weight", &[4096]));
        out.push(meta("lm_head.weight", &[32000, 4096]));
        out
    }

    #[test]
    fn detects_llama_with_gqa() {
        let tensors = llama_tensors(26);
        let config = infer_config(&tensors, &ConfigOverrides::default());
        assert_eq!(config.arch, "llama");
        assert_eq!(config.num_hidden_layers, 26);
        assert_eq!(config.hidden_size, 4096);
        assert_eq!(config.vocab_size, 32000);
        assert_eq!(config.num_attention_heads, 32);
        assert_eq!(config.num_key_value_heads, 8);
        assert_eq!(config.intermediate_size, 11008);
        assert!(!config.tie_word_embeddings);
    }

    #[test]
    fn detects_legacy_layout() {
        let tensors = vec![
            meta("tok_embeddings.weight", &[32000, 4096]),
            meta("layers.0.attention.wq.weight", &[4096, 4096]),
        ];
        assert_eq!(detect_arch(&tensors), "llama_legacy");
    }

    #[test]
    fn detects_phi_prefix() {
        let tensors = vec![meta("transformer.h.0.mixer.Wqkv.weight", &[4096, 4096])];
        assert_eq!(detect_arch(&tensors), "phi");
    }

    #[test]
    fn detects_gemma_markers() {
        let tensors = vec![
            meta("model.embed_tokens.weight", &[256000, 2048]),
            meta("model.layers.0.self_attn.q_proj.weight", &[2048, 2048]),
            meta("model.layers.0.post_feedforward_layernorm.weight", &[2048]),
        ];
        assert_eq!(detect_arch(&tensors), "gemma");
    }

    #[test]
    fn unknown_names_fall_back_to_defaults() {
        let tensors = vec![meta("something.odd", &[16, 16])];
        let config = infer_config(&tensors, &ConfigOverrides::default());
        assert_eq!(config.arch, "unknown");
        assert_eq!(config.num_hidden_layers, 32);
        assert_eq!(config.hidden_size, 4096);
    }

    #[test]
    fn missing_lm_head_implies_tied_embeddings() {
        let mut tensors = llama_tensors(2);
        tensors.retain(|t| t.name != "lm_head.weight");
        let config = infer_config(&tensors, &ConfigOverrides::default());
        assert!(config.tie_word_embeddings);
    }

    #[test]
    fn caller_override_renames_arch() {
        let tensors = llama_tensors(2);
        let overrides = ConfigOverrides {
            arch: Some("mistral".into()),
            ..Default::default()
        };
        let config = infer_config(&tensors, &overrides);
        assert_eq!(config.arch, "mistral");
    }
}
