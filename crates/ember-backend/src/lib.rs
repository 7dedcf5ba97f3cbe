//! The two opaque external collaborators the scheduler core drives each
//! step: the [`ModelExecutor`] (transformer forward pass, attention kernels,
//! LoRA grouped GEMM — all out of scope here, behind a fixed contract) and
//! the [`Tokenizer`] (BPE or similar, also out of scope).
//!
//! The batch-shape DTOs below (`BatchLenInfo`, `BatchedCacheView`,
//! `AdapterRunBatch`) are the wire contract a real executor is handed; they
//! carry no device pointers of their own; the values come from `ember-core`'s
//! page pool and sequence caches.

use ember_common::{AdapterId, Result};

/// Prefill/decode length bookkeeping for one step's batch, mirroring the
/// `blen` argument of the Model Executor contract.
#[derive(Debug, Clone, Default)]
pub struct BatchLenInfo {
    /// Length of each prefill request, in slot order.
    pub prefill_lens: Vec<usize>,
    /// Number of decode requests (each contributes exactly one token).
    pub decode: usize,
    /// `indptr[i] = sum(prefill_lens[:i])`, length `prefill_lens.len() + 1`.
    pub indptr: Vec<i32>,
    /// Total prefill token count; index of the first decode slot in
    /// `input_ids`.
    pub doff: usize,
}

/// A read-only, single-step snapshot over a group of sequence caches: a
/// flattened page-pointer table, its per-sequence prefix sum, and the
/// last-page fill offset of each sequence. Device-resident in a real
/// deployment; here a plain host-side DTO since the executor is mocked.
#[derive(Debug, Clone, Default)]
pub struct BatchedCacheView {
    pub ptrs: Vec<u64>,
    pub indptr: Vec<i32>,
    pub last_page_offset: Vec<i32>,
}

impl BatchedCacheView {
    /// Number of sequences this view covers.
    pub fn len(&self) -> usize {
        self.indptr.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run-length encoding of adapter ids across one step's slot list, the input
/// to the fused grouped-GEMM LoRA application. `segment[i] = sum(lens[:i])`.
#[derive(Debug, Clone, Default)]
pub struct AdapterRunBatch {
    pub ids: Vec<AdapterId>,
    pub lens: Vec<usize>,
    pub segment: Vec<i32>,
    pub rank: usize,
}

/// The transformer forward pass. Invoked exactly once per step by the step
/// loop with the full batch already assembled; returns row-major logits of
/// shape `(doff + decode, vocab_size)`.
pub trait ModelExecutor: Send + Sync {
    fn vocab_size(&self) -> usize;

    fn forward(
        &self,
        input_ids: &[u32],
        blen: &BatchLenInfo,
        prefill_view: Option<&BatchedCacheView>,
        decode_view: Option<&BatchedCacheView>,
        adapter_runs: &AdapterRunBatch,
    ) -> Result<Vec<f32>>;
}

/// Text <-> token id conversion, with support for incremental (partial-id)
/// decoding so BPE-style multi-byte tokens can be flushed only once complete.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, ids: &[u32], skip_special: bool) -> String;
}

#[cfg(feature = "mock")]
pub mod mock {
    use super::*;
    use ember_common::EmberError;

    /// Maps each byte to its own token id (0..256); anything else round-trips
    /// as U+FFFD. Because a single multi-byte UTF-8 character spans several
    /// tokens, this tokenizer naturally exercises the incremental-decode
    /// split-codepoint boundary: decoding a prefix that ends mid-character
    /// yields a trailing U+FFFD, which callers must not flush.
    #[derive(Default)]
    pub struct ByteTokenizer;

    impl ByteTokenizer {
        pub fn new() -> Self {
            Self
        }
    }

    impl Tokenizer for ByteTokenizer {
        fn encode(&self, text: &str) -> Vec<u32> {
            text.as_bytes().iter().map(|b| *b as u32).collect()
        }

        fn decode(&self, ids: &[u32], _skip_special: bool) -> String {
            let bytes: Vec<u8> = ids
                .iter()
                .filter(|&&t| t < 256)
                .map(|&t| t as u8)
                .collect();
            String::from_utf8_lossy(&bytes).to_string()
        }
    }

    /// A deterministic, GPU-free stand-in for the transformer forward pass.
    /// Each row's argmax token id is a pure function of the row's input id
    /// and its slot index, so greedy decoding is reproducible without a
    /// real model, and repeated generation with the same prompt yields
    /// identical token sequences (the round-trip property in spec §8).
    pub struct MockExecutor {
        vocab_size: usize,
    }

    impl MockExecutor {
        pub fn new(vocab_size: usize) -> Self {
            Self { vocab_size }
        }
    }

    impl Default for MockExecutor {
        fn default() -> Self {
            Self::new(256)
        }
    }

    impl ModelExecutor for MockExecutor {
        fn vocab_size(&self) -> usize {
            self.vocab_size
        }

        fn forward(
            &self,
            input_ids: &[u32],
            blen: &BatchLenInfo,
            _prefill_view: Option<&BatchedCacheView>,
            _decode_view: Option<&BatchedCacheView>,
            _adapter_runs: &AdapterRunBatch,
        ) -> Result<Vec<f32>> {
            let total = blen.doff + blen.decode;
            if input_ids.len() != total {
                return Err(EmberError::ExecutorFailure(format!(
                    "input_ids length {} does not match doff+decode {}",
                    input_ids.len(),
                    total
                )));
            }
            let vocab = self.vocab_size;
            let mut logits = vec![0.0f32; total * vocab];
            for (row, &id) in input_ids.iter().enumerate() {
                let target = (id as usize + row + 1) % vocab;
                let base = row * vocab;
                for v in 0..vocab {
                    let dist = (v as i64 - target as i64).unsigned_abs() as f32;
                    logits[base + v] = -dist;
                }
            }
            Ok(logits)
        }
    }
}
