//! Token sampling: temperature, top-k, top-p nucleus
//!
//! Logits come back from the device once per decode step; everything here
//! runs on the host. A caller-seeded RNG makes the whole emitted sequence
//! reproducible; without a seed the generator is entropy-seeded.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use super::params::SamplingParams;

/// Temperatures below this collapse to greedy argmax
const GREEDY_EPSILON: f32 = 1e-4;

pub struct Sampler {
    rng: StdRng,
    temperature: f32,
    top_k: usize,
    top_p: f32,
}

impl Sampler {
    pub fn new(params: &SamplingParams) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            temperature: params.temperature,
            top_k: params.top_k,
            top_p: params.top_p,
        }
    }

    /// Pick one token id from a logits vector
    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        if logits.iter().any(|v| !v.is_finite()) {
            warn!("non-finite logits; falling back to highest finite logit");
            return argmax_finite(logits);
        }

        if self.temperature < GREEDY_EPSILON {
            return argmax_finite(logits);
        }

        let nucleus = build_nucleus(logits, self.temperature, self.top_k, self.top_p);
        if nucleus.is_empty() {
            return argmax_finite(logits);
        }

        let total: f32 = nucleus.iter().map(|&(_, p)| p).sum();
        let draw = self.rng.gen::<f32>() * total;
        pick(&nucleus, draw)
    }
}

/// Softmax + descending order + top-k + top-p truncation.
///
/// Returns `(token_id, probability)` pairs, highest probability first. The
/// nucleus is the shortest prefix whose cumulative probability reaches
/// top_p, after top-k truncation.
fn build_nucleus(logits: &[f32], temperature: f32, top_k: usize, top_p: f32) -> Vec<(usize, f32)> {
    let max = logits.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let exps: Vec<f32> = logits
        .iter()
        .map(|&v| ((v - max) / temperature).exp())
        .collect();
    let total: f32 = exps.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| exps[b].partial_cmp(&exps[a]).unwrap_or(std::cmp::Ordering::Equal));

    let keep = if top_k == 0 {
        order.len()
    } else {
        top_k.min(order.len())
    };

    let mut nucleus = Vec::with_capacity(keep);
    let mut cumulative = 0.0;
    for &idx in order.iter().take(keep) {
        let p = exps[idx] / total;
        nucleus.push((idx, p));
        cumulative += p;
        if cumulative >= top_p {
            break;
        }
    }
    nucleus
}

/// First index whose running sum exceeds the draw
fn pick(nucleus: &[(usize, f32)], draw: f32) -> u32 {
    let mut cumulative = 0.0;
    for &(idx, p) in nucleus {
        cumulative += p;
        if draw < cumulative {
            return idx as u32;
        }
    }
    // Rounding pushed the draw past the final bucket
    nucleus.last().map(|&(idx, _)| idx as u32).unwrap_or(0)
}

fn argmax_finite(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v.is_finite() && v > best_val {
            best = i;
            best_val = v;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nucleus_respects_top_k_and_top_p() {
        let logits = [2.0, 1.0, 0.1, -5.0];
        let nucleus = build_nucleus(&logits, 1.0, 2, 0.9);
        let ids: Vec<usize> = nucleus.iter().map(|&(i, _)| i).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn pick_walks_cumulative_probability() {
        let logits = [2.0, 1.0, 0.1, -5.0];
        let nucleus = build_nucleus(&logits, 1.0, 2, 0.9);
        let total: f32 = nucleus.iter().map(|&(_, p)| p).sum();
        // A draw at half the nucleus mass still lands inside index 0,
        // which holds ~73% of it
        assert_eq!(pick(&nucleus, 0.5 * total), 0);
        // A draw near the top lands on index 1
        assert_eq!(pick(&nucleus, 0.95 * total), 1);
    }

    #[test]
    fn near_zero_temperature_is_greedy() {
        let logits = [0.3, 5.0, -2.0, 4.9];
        let mut sampler = Sampler::new(&SamplingParams {
            temperature: 0.0,
            ..Default::default()
        });
        for _ in 0..16 {
            assert_eq!(sampler.sample(&logits), 1);
        }
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let logits: Vec<f32> = (0..64).map(|i| ((i * 37) % 11) as f32 * 0.3).collect();
        let params = SamplingParams {
            seed: Some(42),
            temperature: 0.9,
            ..Default::default()
        };

        let mut a = Sampler::new(&params);
        let mut b = Sampler::new(&params);
        let seq_a: Vec<u32> = (0..32).map(|_| a.sample(&logits)).collect();
        let seq_b: Vec<u32> = (0..32).map(|_| b.sample(&logits)).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn nan_logits_fall_back_to_highest_finite() {
        let logits = [1.0, f32::NAN, 3.0, f32::INFINITY];
        let mut sampler = Sampler::new(&SamplingParams::default());
        assert_eq!(sampler.sample(&logits), 2);
    }

    #[test]
    fn samples_stay_inside_nucleus() {
        let logits = [2.0, 1.0, 0.1, -5.0];
        let mut sampler = Sampler::new(&SamplingParams {
            seed: Some(7),
            temperature: 1.0,
            top_k: 2,
            top_p: 0.9,
            ..Default::default()
        });
        for _ in 0..64 {
            let id = sampler.sample(&logits);
            assert!(id == 0 || id == 1, "sampled {} outside nucleus", id);
        }
    }
}
