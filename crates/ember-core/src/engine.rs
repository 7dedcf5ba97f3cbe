//! Step loop (C8): the single mutator that owns all engine state. Runs as
//! one driver task; every step is atomic from the perspective of any other
//! thread touching the engine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ember_backend::{BatchLenInfo, BatchedCacheView, ModelExecutor, Tokenizer};
use ember_common::config::EngineConfig;
use ember_common::{AdapterId, EmberError, FinishReason, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::adapter::AdapterRegistry;
use crate::kv::{build_batched_view, SequenceCache};
use crate::page::{PagePool, PageShape};
use crate::planner::{self, CandidateView};
use crate::request::{Phase, RequestId, RequestState, SamplerParams};
use crate::sampler;

/// One event on a request's output stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token(String),
    Finished(FinishReason),
}

/// A new request handed to the engine by [`crate::queue::RequestQueue`].
pub struct AdmitRequest {
    pub id: RequestId,
    pub prompt_ids: Vec<u32>,
    pub sampler: SamplerParams,
    pub adapter_id: AdapterId,
    pub max_tokens: usize,
    pub stop_token_ids: HashSet<u32>,
    pub cancel: Arc<AtomicBool>,
    pub respond: mpsc::Sender<StreamEvent>,
    pub ack: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StepReport {
    pub advanced: usize,
    pub finished: usize,
    pub deferred: usize,
}

/// Out-of-band administrative operations, routed through the same
/// single-driver-thread discipline as admission: each is applied between
/// steps, never concurrently with one.
pub enum AdminCommand {
    LoadAdapter {
        id: AdapterId,
        raw_rank: usize,
        hidden_size: usize,
        weights: HashMap<&'static str, crate::adapter::LoraWeight>,
        ack: oneshot::Sender<Result<()>>,
    },
    RemoveAdapter {
        id: AdapterId,
        ack: oneshot::Sender<Result<()>>,
    },
    AdapterStatus {
        id: AdapterId,
        ack: oneshot::Sender<Option<(usize, usize)>>,
    },
    Stats {
        ack: oneshot::Sender<EngineStats>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub live_requests: usize,
    pub pages_in_use: usize,
    pub pool_capacity_pages: usize,
    pub resident_adapters: Vec<AdapterId>,
}

/// All live scheduling state: the page pool, adapter registry, per-request
/// state, and the opaque executor/tokenizer collaborators.
pub struct Engine {
    config: EngineConfig,
    pool: Arc<PagePool>,
    adapters: AdapterRegistry,
    executor: Arc<dyn ModelExecutor>,
    tokenizer: Arc<dyn Tokenizer>,
    requests: HashMap<RequestId, RequestState>,
    senders: HashMap<RequestId, mpsc::Sender<StreamEvent>>,
    rng: StdRng,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        executor: Arc<dyn ModelExecutor>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        let shape = PageShape {
            num_layers: config.num_layers,
            num_heads: config.num_heads,
            page_len: config.page_len,
            head_dim: config.head_dim,
        };
        let pool = PagePool::new(shape, config.pool_capacity_pages);
        let adapters = AdapterRegistry::new(config.default_adapter_rank, config.adapter_capacity);
        Self {
            config,
            pool,
            adapters,
            executor,
            tokenizer,
            requests: HashMap::new(),
            senders: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn adapters_mut(&mut self) -> &mut AdapterRegistry {
        &mut self.adapters
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    #[allow(clippy::too_many_arguments)]
    fn admit(
        &mut self,
        id: RequestId,
        prompt_ids: Vec<u32>,
        sampler: SamplerParams,
        adapter_id: AdapterId,
        max_tokens: usize,
        stop_token_ids: HashSet<u32>,
        cancel: Arc<AtomicBool>,
        respond: mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        if prompt_ids.len() > self.config.max_sequence_tokens {
            return Err(EmberError::SequenceTooLong {
                len: prompt_ids.len(),
                max: self.config.max_sequence_tokens,
            });
        }
        sampler::validate(&sampler)?;
        self.adapters.get(&adapter_id)?;
        // KV pages are reserved for the full prompt up front, at admission,
        // rather than lazily during planning; pool exhaustion here is the
        // admission-control signal a client retries on, not an internal
        // invariant violation, so it's surfaced as `Backpressure`.
        let cache = match SequenceCache::new(self.pool.clone(), prompt_ids.len()) {
            Ok(cache) => cache,
            Err(EmberError::PoolExhausted) => return Err(EmberError::Backpressure),
            Err(e) => return Err(e),
        };
        let state = RequestState::new(
            id,
            prompt_ids,
            sampler,
            adapter_id,
            max_tokens,
            stop_token_ids,
            cache,
            cancel,
        );
        self.requests.insert(id, state);
        self.senders.insert(id, respond);
        Ok(())
    }

    /// Admits a request synchronously, bypassing the admission channel.
    /// Intended for embedding and tests that drive the step loop directly
    /// rather than through [`crate::queue::RequestQueue`].
    pub fn admit_direct(&mut self, req: AdmitRequest) -> Result<()> {
        let AdmitRequest {
            id,
            prompt_ids,
            sampler,
            adapter_id,
            max_tokens,
            stop_token_ids,
            cancel,
            respond,
            ack,
        } = req;
        let result = self.admit(id, prompt_ids, sampler, adapter_id, max_tokens, stop_token_ids, cancel, respond);
        let _ = ack.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(e.clone()),
        });
        result
    }

    /// Drains every admission request currently queued, acking each one
    /// back to its submitter. Non-blocking: returns as soon as the channel
    /// is empty.
    pub fn drain_admissions(&mut self, rx: &mut mpsc::Receiver<AdmitRequest>) -> usize {
        let mut count = 0;
        while let Ok(req) = rx.try_recv() {
            let AdmitRequest {
                id,
                prompt_ids,
                sampler,
                adapter_id,
                max_tokens,
                stop_token_ids,
                cancel,
                respond,
                ack,
            } = req;
            let result = self.admit(id, prompt_ids, sampler, adapter_id, max_tokens, stop_token_ids, cancel, respond);
            if result.is_ok() {
                count += 1;
            } else if let Err(ref e) = result {
                warn!(request_id = id, error = %e, "admission failed");
            }
            let _ = ack.send(result);
        }
        count
    }

    /// Applies every queued admin command, acking each synchronously.
    pub fn drain_admin(&mut self, rx: &mut mpsc::Receiver<AdminCommand>) {
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                AdminCommand::LoadAdapter {
                    id,
                    raw_rank,
                    hidden_size,
                    weights,
                    ack,
                } => {
                    let result = self.adapters.load(id, raw_rank, hidden_size, weights);
                    let _ = ack.send(result);
                }
                AdminCommand::RemoveAdapter { id, ack } => {
                    let result = self.adapters.remove(&id);
                    let _ = ack.send(result);
                }
                AdminCommand::AdapterStatus { id, ack } => {
                    let _ = ack.send(self.adapters.status(&id));
                }
                AdminCommand::Stats { ack } => {
                    let stats = EngineStats {
                        live_requests: self.requests.len(),
                        pages_in_use: self.pool.num_pages(),
                        pool_capacity_pages: self.pool.capacity_pages(),
                        resident_adapters: self.adapters.loaded_ids(),
                    };
                    let _ = ack.send(stats);
                }
            }
        }
    }

    fn finish(&mut self, id: RequestId, reason: FinishReason) {
        if let Some(mut state) = self.requests.remove(&id) {
            let _ = state.cache.release();
        }
        if let Some(tx) = self.senders.remove(&id) {
            let _ = tx.try_send(StreamEvent::Finished(reason));
        }
    }

    /// Runs exactly one step: reap canceled/already-finished requests,
    /// plan a batch under the token budget, invoke the executor once, sample
    /// a token per slot, and stream results out.
    pub fn step(&mut self) -> Result<StepReport> {
        let mut report = StepReport::default();

        let canceled: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, s)| s.is_canceled())
            .map(|(id, _)| *id)
            .collect();
        for id in canceled {
            self.finish(id, FinishReason::Canceled);
            report.finished += 1;
        }

        let decode_candidates: Vec<CandidateView> = self
            .requests
            .values()
            .filter(|s| s.phase == Phase::Decode)
            .map(|s| CandidateView {
                request_id: s.id,
                adapter_id: s.adapter_id.clone(),
                len: 1,
            })
            .collect();
        let prefill_candidates: Vec<CandidateView> = self
            .requests
            .values()
            .filter(|s| s.phase == Phase::Prefill)
            .map(|s| CandidateView {
                request_id: s.id,
                adapter_id: s.adapter_id.clone(),
                len: s.prompt_ids.len(),
            })
            .collect();

        let outcome = planner::plan(
            &decode_candidates,
            &prefill_candidates,
            self.config.max_batch_tokens,
            self.adapters.default_rank(),
        );
        report.deferred = outcome.deferred.len();

        let Some(plan) = outcome.plan else {
            return Ok(report);
        };

        let (input_ids, blen, prefill_view, decode_view) = self.assemble_batch(&plan.slots, &plan.prefill_lens, plan.decode_count);

        let adapters_used: HashSet<AdapterId> = plan
            .slots
            .iter()
            .map(|s| s.adapter_id.clone())
            .filter(|id| id != &ember_common::empty_adapter_id())
            .collect();
        for id in &adapters_used {
            self.adapters.pin(id);
        }

        let forward_result = self.executor.forward(
            &input_ids,
            &blen,
            prefill_view.as_ref(),
            decode_view.as_ref(),
            &plan.adapter_runs,
        );

        self.adapters.unpin_all();

        let logits = match forward_result {
            Ok(logits) => logits,
            Err(e) => {
                warn!(error = %e, "executor forward failed, failing the whole step's batch");
                for slot in &plan.slots {
                    self.finish(slot.request_id, FinishReason::ExecutorFailure);
                    report.finished += 1;
                }
                return Ok(report);
            }
        };

        let vocab = self.executor.vocab_size();
        self.sample_and_advance(&plan.slots, &blen, &logits, vocab, &mut report);

        Ok(report)
    }

    fn assemble_batch(
        &self,
        slots: &[crate::planner::PlanSlot],
        prefill_lens: &[usize],
        decode_count: usize,
    ) -> (Vec<u32>, BatchLenInfo, Option<BatchedCacheView>, Option<BatchedCacheView>) {
        let mut input_ids = Vec::new();
        let mut indptr = vec![0i32];
        let mut prefill_caches = Vec::new();
        let mut decode_caches = Vec::new();

        let prefill_count = prefill_lens.len();
        for (i, slot) in slots.iter().enumerate() {
            let state = &self.requests[&slot.request_id];
            if i < prefill_count {
                input_ids.extend(state.prompt_ids.iter().copied());
                prefill_caches.push(&state.cache);
                let last = *indptr.last().unwrap();
                indptr.push(last + prefill_lens[i] as i32);
            } else {
                input_ids.push(state.decode_input_token());
                decode_caches.push(&state.cache);
            }
        }
        debug_assert_eq!(decode_caches.len(), decode_count);

        let doff: usize = prefill_lens.iter().sum();
        let blen = BatchLenInfo {
            prefill_lens: prefill_lens.to_vec(),
            decode: decode_count,
            indptr,
            doff,
        };
        let prefill_view = (!prefill_caches.is_empty()).then(|| build_batched_view(&prefill_caches));
        let decode_view = (!decode_caches.is_empty()).then(|| build_batched_view(&decode_caches));
        (input_ids, blen, prefill_view, decode_view)
    }

    fn sample_and_advance(
        &mut self,
        slots: &[crate::planner::PlanSlot],
        blen: &BatchLenInfo,
        logits: &[f32],
        vocab: usize,
        report: &mut StepReport,
    ) {
        let prefill_count = blen.prefill_lens.len();
        for (i, slot) in slots.iter().enumerate() {
            let row = if i < prefill_count {
                (blen.indptr[i + 1] - 1) as usize
            } else {
                blen.doff + (i - prefill_count)
            };
            let row_logits = &logits[row * vocab..(row + 1) * vocab];

            let Some(state) = self.requests.get_mut(&slot.request_id) else {
                continue;
            };
            let token = sampler::sample_token(row_logits, state.history(), &state.sampler, &mut self.rng);
            match state.record_token(token) {
                Ok(()) => {}
                Err(EmberError::PoolExhausted) => {
                    // No free page for this decode step's new slot. Leave the
                    // request exactly as it was (record_token reserves before
                    // mutating history) and retry it next step rather than
                    // treating a capacity condition as an executor fault.
                    debug!(request_id = slot.request_id, "decode deferred: page pool exhausted (backpressure)");
                    report.deferred += 1;
                    continue;
                }
                Err(e) => {
                    warn!(request_id = slot.request_id, error = %e, "failed to record sampled token, retiring request");
                    self.finish(slot.request_id, FinishReason::ExecutorFailure);
                    report.finished += 1;
                    continue;
                }
            }
            report.advanced += 1;

            let text = {
                let state = self.requests.get_mut(&slot.request_id).unwrap();
                let ids = state.generated_ids.clone();
                sampler::decode_incremental(
                    self.tokenizer.as_ref(),
                    &ids,
                    &mut state.prefix_offset,
                    &mut state.read_offset,
                )
            };
            if !text.is_empty() {
                if let Some(tx) = self.senders.get(&slot.request_id) {
                    let _ = tx.try_send(StreamEvent::Token(text));
                }
            }

            let finished = self.requests.get(&slot.request_id).and_then(|s| s.finish_reason());
            if let Some(reason) = finished {
                self.finish(slot.request_id, reason);
                report.finished += 1;
            }
        }
        debug!(advanced = report.advanced, finished = report.finished, "step complete");
    }
}
