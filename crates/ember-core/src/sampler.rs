//! Token sampling (C6): repetition penalty, temperature, nucleus and top-k
//! filtering, greedy tie-breaking, and the incremental-decode discipline
//! that keeps a streaming client from ever seeing a split UTF-8 codepoint.

use std::collections::HashSet;

use ember_backend::Tokenizer;
use ember_common::{EmberError, Result};
use rand::Rng;

use crate::request::SamplerParams;

pub fn validate(params: &SamplerParams) -> Result<()> {
    if !(params.temperature >= 0.0) {
        return Err(EmberError::InvalidSamplerParams(format!(
            "temperature must be >= 0, got {}",
            params.temperature
        )));
    }
    if !(params.top_p > 0.0 && params.top_p <= 1.0) {
        return Err(EmberError::InvalidSamplerParams(format!(
            "top_p must be in (0, 1], got {}",
            params.top_p
        )));
    }
    if params.repetition_penalty <= 0.0 {
        return Err(EmberError::InvalidSamplerParams(format!(
            "repetition_penalty must be > 0, got {}",
            params.repetition_penalty
        )));
    }
    Ok(())
}

/// Dividing positive logits and multiplying negative ones pushes already-seen
/// tokens toward zero regardless of sign, the convention from the original
/// Hugging Face repetition penalty processor.
pub fn apply_repetition_penalty(logits: &mut [f32], history: impl Iterator<Item = u32>, penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let seen: HashSet<u32> = history.collect();
    for tok in seen {
        if let Some(l) = logits.get_mut(tok as usize) {
            *l = if *l > 0.0 { *l / penalty } else { *l * penalty };
        }
    }
}

fn argmax_lowest_id(logits: &[f32]) -> u32 {
    let mut best_idx = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i;
        }
    }
    best_idx as u32
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum.max(1e-12)).collect()
}

fn top_k_filter(probs: &mut [f32], top_k: usize) {
    if top_k == 0 || top_k >= probs.len() {
        return;
    }
    let mut idx: Vec<usize> = (0..probs.len()).collect();
    idx.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap());
    for &i in &idx[top_k..] {
        probs[i] = 0.0;
    }
    renormalize(probs);
}

fn top_p_filter(probs: &mut [f32], top_p: f32) {
    if top_p >= 1.0 {
        return;
    }
    let mut idx: Vec<usize> = (0..probs.len()).collect();
    idx.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap());
    let mut cumulative = 0.0f32;
    let mut cutoff = idx.len();
    for (rank, &i) in idx.iter().enumerate() {
        cumulative += probs[i];
        if cumulative >= top_p {
            cutoff = rank + 1;
            break;
        }
    }
    for &i in &idx[cutoff..] {
        probs[i] = 0.0;
    }
    renormalize(probs);
}

fn renormalize(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

fn weighted_sample(probs: &[f32], rng: &mut impl Rng) -> u32 {
    let r: f32 = rng.gen_range(0.0..1.0);
    let mut acc = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        acc += p;
        if r < acc {
            return i as u32;
        }
    }
    (probs.len() - 1) as u32
}

/// Samples one token from a row of raw logits. `temperature == 0.0` selects
/// deterministic greedy decoding (argmax, lowest token id on ties);
/// otherwise logits are scaled, the softmax is nucleus-filtered and then
/// top-k-filtered, and the token is drawn from the result.
pub fn sample_token(
    logits: &[f32],
    history: impl Iterator<Item = u32>,
    params: &SamplerParams,
    rng: &mut impl Rng,
) -> u32 {
    let mut logits = logits.to_vec();
    apply_repetition_penalty(&mut logits, history, params.repetition_penalty);

    if params.temperature == 0.0 {
        return argmax_lowest_id(&logits);
    }
    for l in logits.iter_mut() {
        *l /= params.temperature;
    }
    let mut probs = softmax(&logits);
    top_p_filter(&mut probs, params.top_p);
    top_k_filter(&mut probs, params.top_k);
    weighted_sample(&probs, rng)
}

/// Decodes only the newly-stable suffix of `ids`, holding back anything that
/// would require flushing an incomplete multi-byte character. Returns the
/// text to emit (possibly empty) and advances `prefix_offset`/`read_offset`
/// in place when a flush happens.
pub fn decode_incremental(
    tokenizer: &dyn Tokenizer,
    ids: &[u32],
    prefix_offset: &mut usize,
    read_offset: &mut usize,
) -> String {
    let prefix_text = tokenizer.decode(&ids[*prefix_offset..*read_offset], true);
    let new_text = tokenizer.decode(&ids[*prefix_offset..], true);
    if new_text.len() > prefix_text.len() && !new_text.ends_with('\u{FFFD}') {
        let flushed = new_text[prefix_text.len()..].to_string();
        *prefix_offset = *read_offset;
        *read_offset = ids.len();
        flushed
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_backend::mock::ByteTokenizer;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn validate_rejects_nonpositive_repetition_penalty() {
        let mut p = SamplerParams::default();
        p.repetition_penalty = 0.0;
        assert!(validate(&p).is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_top_p() {
        let mut p = SamplerParams::default();
        p.top_p = 1.5;
        assert!(validate(&p).is_err());
    }

    #[test]
    fn repetition_penalty_divides_positive_logits() {
        let mut logits = vec![4.0f32, -4.0];
        apply_repetition_penalty(&mut logits, [0u32, 1u32].into_iter(), 2.0);
        assert_eq!(logits[0], 2.0);
        assert_eq!(logits[1], -8.0);
    }

    #[test]
    fn greedy_breaks_ties_toward_lowest_id() {
        let logits = vec![1.0, 1.0, 0.5];
        let mut rng = StdRng::seed_from_u64(0);
        let params = SamplerParams {
            temperature: 0.0,
            ..SamplerParams::default()
        };
        let tok = sample_token(&logits, std::iter::empty(), &params, &mut rng);
        assert_eq!(tok, 0);
    }

    #[test]
    fn greedy_picks_strict_max() {
        let logits = vec![0.1, 9.0, 0.2];
        let mut rng = StdRng::seed_from_u64(0);
        let params = SamplerParams {
            temperature: 0.0,
            ..SamplerParams::default()
        };
        let tok = sample_token(&logits, std::iter::empty(), &params, &mut rng);
        assert_eq!(tok, 1);
    }

    #[test]
    fn top_k_one_collapses_to_the_max() {
        let logits = vec![0.1, 9.0, 0.2, 8.5];
        let mut rng = StdRng::seed_from_u64(42);
        let params = SamplerParams {
            temperature: 1.0,
            top_k: 1,
            top_p: 1.0,
            repetition_penalty: 1.0,
        };
        for _ in 0..5 {
            let tok = sample_token(&logits, std::iter::empty(), &params, &mut rng);
            assert_eq!(tok, 1);
        }
    }

    #[test]
    fn incremental_decode_withholds_split_codepoint() {
        let tok = ByteTokenizer::new();
        // 0xE2 0x82 0xAC is the UTF-8 encoding of the euro sign; splitting it
        // mid-sequence must not flush a U+FFFD.
        let ids: Vec<u32> = vec![0xE2, 0x82];
        let mut prefix_offset = 0usize;
        let mut read_offset = 0usize;
        let out = decode_incremental(&tok, &ids, &mut prefix_offset, &mut read_offset);
        assert_eq!(out, "");
        assert_eq!(read_offset, 0);
    }

    #[test]
    fn incremental_decode_flushes_once_codepoint_completes() {
        let tok = ByteTokenizer::new();
        let ids: Vec<u32> = vec![0xE2, 0x82, 0xAC, b'x' as u32];
        let mut prefix_offset = 0usize;
        let mut read_offset = 0usize;
        let first = decode_incremental(&tok, &ids[..3], &mut prefix_offset, &mut read_offset);
        assert_eq!(first, "\u{20AC}");
        assert_eq!(read_offset, 3);
        let second = decode_incremental(&tok, &ids, &mut prefix_offset, &mut read_offset);
        assert_eq!(second, "x");
    }
}
