//! Sampling parameters for generation

use crate::utils::error::{AccelError, Result};
use serde::{Deserialize, Serialize};

/// Sampling parameters for text generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,

    /// Top-k truncation (0 = disabled)
    pub top_k: usize,

    /// Top-p (nucleus) sampling (1.0 = disabled)
    pub top_p: f32,

    /// Maximum number of new tokens to generate
    pub max_new_tokens: usize,

    /// Sequences that stop generation
    pub stop_sequences: Vec<String>,

    /// Random seed for deterministic generation (None = entropy-seeded)
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            max_new_tokens: 512,
            stop_sequences: vec![],
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Validate sampling parameters
    pub fn validate(&self) -> Result<()> {
        if self.temperature < 0.0 {
            return Err(AccelError::InvalidParameters(format!(
                "Temperature must be non-negative, got {}",
                self.temperature
            )));
        }

        if self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(AccelError::InvalidParameters(format!(
                "Top-p must be in (0.0, 1.0], got {}",
                self.top_p
            )));
        }

        if self.max_new_tokens == 0 {
            return Err(AccelError::InvalidParameters(
                "max_new_tokens must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
