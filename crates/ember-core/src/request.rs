//! Per-request scheduling state (C5): sampler parameters, prompt/generated
//! token bookkeeping, and the prefill/decode phase a request is currently in.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ember_common::{AdapterId, FinishReason};

use crate::kv::SequenceCache;

pub type RequestId = u64;

/// Sampling knobs for one request. Validated once at admission by
/// [`crate::sampler::validate`].
#[derive(Debug, Clone)]
pub struct SamplerParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
        }
    }
}

/// Which half of a forward pass a request contributes a slot to this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prefill,
    Decode,
}

/// All scheduling state for one admitted request. Owns its [`SequenceCache`]
/// for the request's lifetime; the cache is released back to the pool on
/// retirement.
pub struct RequestState {
    pub id: RequestId,
    pub prompt_ids: Vec<u32>,
    pub generated_ids: Vec<u32>,
    pub sampler: SamplerParams,
    pub adapter_id: AdapterId,
    pub max_tokens: usize,
    pub stop_token_ids: HashSet<u32>,
    pub cache: SequenceCache,
    pub phase: Phase,
    /// Incremental-decode bookkeeping: text before `prefix_offset` has
    /// already been flushed to the client; text in `[prefix_offset,
    /// read_offset)` is the stable, already-decoded remainder; tokens from
    /// `read_offset` on are the newest, possibly mid-codepoint, tail.
    pub prefix_offset: usize,
    pub read_offset: usize,
    cancel: Arc<AtomicBool>,
}

impl RequestState {
    pub fn new(
        id: RequestId,
        prompt_ids: Vec<u32>,
        sampler: SamplerParams,
        adapter_id: AdapterId,
        max_tokens: usize,
        stop_token_ids: HashSet<u32>,
        cache: SequenceCache,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            prompt_ids,
            generated_ids: Vec::new(),
            sampler,
            adapter_id,
            max_tokens,
            stop_token_ids,
            cache,
            phase: Phase::Prefill,
            prefix_offset: 0,
            read_offset: 0,
            cancel,
        }
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Total tokens the request currently spans: prompt plus what's been
    /// generated so far.
    pub fn total_len(&self) -> usize {
        self.prompt_ids.len() + self.generated_ids.len()
    }

    /// The token id fed into this step's decode slot: the most recently
    /// generated token, or the prompt's last token when nothing has been
    /// generated yet (the token whose forward pass produces the first
    /// generated token).
    pub fn decode_input_token(&self) -> u32 {
        *self
            .generated_ids
            .last()
            .unwrap_or_else(|| self.prompt_ids.last().expect("prompt must be non-empty"))
    }

    /// Reserves the new token's KV slot, then appends it and advances the
    /// request to decode phase. Reserving first means a failed reservation
    /// (the pool is full) leaves history and phase untouched, so the caller
    /// can simply defer the slot to a later step instead of unwinding state.
    pub fn record_token(&mut self, token: u32) -> ember_common::Result<()> {
        self.cache.acquire_one()?;
        self.generated_ids.push(token);
        self.phase = Phase::Decode;
        Ok(())
    }

    /// The token ids a repetition penalty should apply across: the full
    /// prompt + generated history.
    pub fn history(&self) -> impl Iterator<Item = u32> + '_ {
        self.prompt_ids.iter().copied().chain(self.generated_ids.iter().copied())
    }

    /// Non-`None` once the request should stop advancing.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        if self.is_canceled() {
            return Some(FinishReason::Canceled);
        }
        if let Some(&last) = self.generated_ids.last() {
            if self.stop_token_ids.contains(&last) {
                return Some(FinishReason::StopTokenReached);
            }
        }
        if self.generated_ids.len() >= self.max_tokens {
            return Some(FinishReason::MaxTokens);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PagePool, PageShape};
    use std::sync::Arc;

    fn cache() -> SequenceCache {
        let pool = PagePool::new(
            PageShape {
                num_layers: 1,
                num_heads: 1,
                page_len: 16,
                head_dim: 4,
            },
            4,
        );
        SequenceCache::new(pool, 3).unwrap()
    }

    fn state() -> RequestState {
        RequestState::new(
            1,
            vec![10, 11, 12],
            SamplerParams::default(),
            ember_common::empty_adapter_id(),
            5,
            HashSet::from([99u32]),
            cache(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn decode_input_token_falls_back_to_prompt_tail() {
        let s = state();
        assert_eq!(s.decode_input_token(), 12);
    }

    #[test]
    fn record_token_advances_phase_and_history() {
        let mut s = state();
        s.record_token(42).unwrap();
        assert_eq!(s.phase, Phase::Decode);
        assert_eq!(s.decode_input_token(), 42);
        assert_eq!(s.total_len(), 4);
    }

    #[test]
    fn finish_reason_detects_stop_token() {
        let mut s = state();
        s.record_token(99).unwrap();
        assert_eq!(s.finish_reason(), Some(FinishReason::StopTokenReached));
    }

    #[test]
    fn finish_reason_detects_max_tokens() {
        let mut s = state();
        for t in 0..5 {
            s.record_token(t).unwrap();
        }
        assert_eq!(s.finish_reason(), Some(FinishReason::MaxTokens));
    }

    #[test]
    fn finish_reason_detects_cancellation() {
        let s = state();
        s.cancel_handle().store(true, Ordering::Release);
        assert_eq!(s.finish_reason(), Some(FinishReason::Canceled));
    }

    #[test]
    fn finish_reason_none_while_running() {
        let mut s = state();
        s.record_token(1).unwrap();
        assert_eq!(s.finish_reason(), None);
    }
}
