//! End-to-end step-loop scenarios driving [`ember_core::engine::Engine`]
//! directly (bypassing the tokio admission channel) against the mock
//! executor and tokenizer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ember_backend::mock::{ByteTokenizer, MockExecutor};
use ember_backend::{AdapterRunBatch, BatchLenInfo, BatchedCacheView, ModelExecutor};
use ember_common::config::EngineConfig;
use ember_common::{empty_adapter_id, FinishReason, Result};
use ember_core::engine::{AdmitRequest, Engine, StreamEvent};
use ember_core::request::SamplerParams;
use tokio::sync::{mpsc, oneshot};

fn greedy() -> SamplerParams {
    SamplerParams {
        temperature: 0.0,
        top_p: 1.0,
        top_k: 0,
        repetition_penalty: 1.0,
    }
}

fn admit(
    engine: &mut Engine,
    id: u64,
    prompt_ids: Vec<u32>,
    adapter_id: &str,
    max_tokens: usize,
    stop_token_ids: HashSet<u32>,
) -> (mpsc::Receiver<StreamEvent>, Arc<AtomicBool>, Result<()>) {
    let (tx, rx) = mpsc::channel(32);
    let (ack_tx, _ack_rx) = oneshot::channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let req = AdmitRequest {
        id,
        prompt_ids,
        sampler: greedy(),
        adapter_id: adapter_id.to_string(),
        max_tokens,
        stop_token_ids,
        cancel: cancel.clone(),
        respond: tx,
        ack: ack_tx,
    };
    let result = engine.admit_direct(req);
    (rx, cancel, result)
}

fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> (usize, Option<FinishReason>) {
    let mut tokens = 0;
    let mut finished = None;
    while let Ok(evt) = rx.try_recv() {
        match evt {
            StreamEvent::Token(_) => tokens += 1,
            StreamEvent::Finished(r) => finished = Some(r),
        }
    }
    (tokens, finished)
}

#[test]
fn scenario_1_single_greedy_request_retires_with_max_tokens() {
    let executor = Arc::new(MockExecutor::new(256));
    let tokenizer = Arc::new(ByteTokenizer::new());
    let mut engine = Engine::new(EngineConfig::default(), executor, tokenizer);

    let (mut rx, _cancel, result) = admit(&mut engine, 1, vec![1, 200], &empty_adapter_id(), 3, HashSet::new());
    result.unwrap();

    let mut steps = 0;
    let mut finished = None;
    while finished.is_none() && steps < 10 {
        let report = engine.step().unwrap();
        steps += 1;
        if report.finished > 0 {
            let (_, f) = drain(&mut rx);
            finished = f;
        }
    }

    assert_eq!(steps, 3, "one step per generated token up to max_tokens");
    assert_eq!(finished, Some(FinishReason::MaxTokens));
}

/// A [`ModelExecutor`] that records the batch shape of every call it
/// receives, so planner output can be asserted end to end through the
/// engine rather than by calling the planner module directly.
struct RecordingExecutor {
    vocab: usize,
    calls: Mutex<Vec<(BatchLenInfo, AdapterRunBatch)>>,
}

impl RecordingExecutor {
    fn new(vocab: usize) -> Self {
        Self {
            vocab,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ModelExecutor for RecordingExecutor {
    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn forward(
        &self,
        input_ids: &[u32],
        blen: &BatchLenInfo,
        _prefill_view: Option<&BatchedCacheView>,
        _decode_view: Option<&BatchedCacheView>,
        adapter_runs: &AdapterRunBatch,
    ) -> Result<Vec<f32>> {
        self.calls.lock().unwrap().push((blen.clone(), adapter_runs.clone()));
        Ok(vec![0.0; input_ids.len() * self.vocab])
    }
}

#[test]
fn scenario_2_two_adapters_prefill_together_sorted_by_adapter_id() {
    let executor = Arc::new(RecordingExecutor::new(8));
    let tokenizer = Arc::new(ByteTokenizer::new());
    let mut engine = Engine::new(EngineConfig::default(), executor.clone(), tokenizer);

    admit(&mut engine, 1, vec![10, 11, 12], "B", 4, HashSet::new()).2.unwrap();
    admit(&mut engine, 2, vec![20, 21], "A", 4, HashSet::new()).2.unwrap();

    engine.step().unwrap();

    let calls = executor.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (blen, runs) = &calls[0];
    assert_eq!(blen.prefill_lens, vec![2, 3]); // A (len 2) sorts before B (len 3)
    assert_eq!(runs.ids, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(runs.lens, vec![1, 1]);
}

#[test]
fn scenario_3_mixed_prefill_and_decode_runs_merge_across_the_boundary() {
    let executor = Arc::new(RecordingExecutor::new(8));
    let tokenizer = Arc::new(ByteTokenizer::new());
    let mut engine = Engine::new(EngineConfig::default(), executor.clone(), tokenizer);

    // Single-token prompts so one step promotes both straight to decode.
    admit(&mut engine, 1, vec![5], "A", 10, HashSet::new()).2.unwrap();
    admit(&mut engine, 2, vec![6], &empty_adapter_id(), 10, HashSet::new()).2.unwrap();
    engine.step().unwrap();

    // A fresh prefill arrives for the second step.
    admit(&mut engine, 3, vec![1, 2, 3, 4, 5], "A", 10, HashSet::new()).2.unwrap();
    engine.step().unwrap();

    let calls = executor.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    let (blen, runs) = &calls[1];
    assert_eq!(blen.prefill_lens, vec![5]);
    assert_eq!(blen.decode, 2);
    assert_eq!(blen.doff, 5);
    assert_eq!(runs.ids, vec!["A".to_string(), empty_adapter_id()]);
    assert_eq!(runs.lens, vec![2, 1]);
    assert_eq!(runs.segment, vec![0, 2, 3]);
}

#[test]
fn scenario_4_stop_token_retires_request_and_releases_pages() {
    let executor = Arc::new(MockExecutor::new(256));
    let tokenizer = Arc::new(ByteTokenizer::new());
    let mut engine = Engine::new(EngineConfig::default(), executor, tokenizer);

    // MockExecutor's argmax for a single-token prompt [5] at row 0 is
    // (5 + 0 + 1) % 256 == 6, so the first generated token is always 6.
    let mut stop = HashSet::new();
    stop.insert(6u32);
    let (mut rx, _cancel, result) = admit(&mut engine, 1, vec![5], &empty_adapter_id(), 10, stop);
    result.unwrap();

    let pool = engine.pool().clone();
    assert!(pool.num_pages() > 0);

    let report = engine.step().unwrap();
    assert_eq!(report.finished, 1);
    let (_, finished) = drain(&mut rx);
    assert_eq!(finished, Some(FinishReason::StopTokenReached));
    assert_eq!(pool.num_pages(), 0, "retired request's pages are released");

    let next = engine.step().unwrap();
    assert_eq!(next.advanced, 0);
    assert_eq!(next.finished, 0);
}

#[test]
fn scenario_5_cancellation_retires_without_another_token() {
    let executor = Arc::new(MockExecutor::new(256));
    let tokenizer = Arc::new(ByteTokenizer::new());
    let mut engine = Engine::new(EngineConfig::default(), executor, tokenizer);

    let (mut rx, cancel, result) = admit(&mut engine, 1, vec![1, 2, 3], &empty_adapter_id(), 10, HashSet::new());
    result.unwrap();

    engine.step().unwrap(); // prefill: produces exactly one token
    let (tokens_before_cancel, _) = drain(&mut rx);
    assert_eq!(tokens_before_cancel, 1);

    cancel.store(true, Ordering::Release);
    let report = engine.step().unwrap();
    assert_eq!(report.finished, 1);

    let (tokens_after_cancel, finished) = drain(&mut rx);
    assert_eq!(tokens_after_cancel, 0, "canceled before planning produces no further token");
    assert_eq!(finished, Some(FinishReason::Canceled));
}

#[test]
fn scenario_6_page_exhaustion_yields_backpressure_until_the_first_retires() {
    let executor = Arc::new(MockExecutor::new(256));
    let tokenizer = Arc::new(ByteTokenizer::new());
    let mut config = EngineConfig::default();
    config.page_len = 16;
    config.pool_capacity_pages = 4;
    let mut engine = Engine::new(config, executor, tokenizer);

    let big_prompt: Vec<u32> = (0..60).map(|i| i % 200).collect();
    let (mut rx, _cancel, first) = admit(&mut engine, 1, big_prompt, &empty_adapter_id(), 1, HashSet::new());
    first.unwrap();
    assert_eq!(engine.pool().num_pages(), 4);

    let (_rx2, _cancel2, second) = admit(&mut engine, 2, vec![1, 2], &empty_adapter_id(), 1, HashSet::new());
    assert!(matches!(second, Err(ember_common::EmberError::Backpressure)));

    // Retire the first request (max_tokens=1: one step finishes it) and
    // confirm its pages come back.
    engine.step().unwrap();
    let (_, finished) = drain(&mut rx);
    assert_eq!(finished, Some(FinishReason::MaxTokens));
    assert_eq!(engine.pool().num_pages(), 0);

    let (_rx3, _cancel3, third) = admit(&mut engine, 3, vec![1, 2], &empty_adapter_id(), 1, HashSet::new());
    third.unwrap();
}

#[test]
fn scenario_7_decode_time_page_exhaustion_defers_the_slot_instead_of_failing() {
    let executor = Arc::new(MockExecutor::new(256));
    let tokenizer = Arc::new(ByteTokenizer::new());
    let mut config = EngineConfig::default();
    config.page_len = 4;
    config.pool_capacity_pages = 1;
    let mut engine = Engine::new(config, executor, tokenizer);

    // A four-token prompt exactly fills the pool's one page at admission.
    // The first decode step crosses the page boundary and finds no page
    // left to grow into.
    let (mut rx, _cancel, result) = admit(&mut engine, 1, vec![1, 2, 3, 4], &empty_adapter_id(), 3, HashSet::new());
    result.unwrap();
    assert_eq!(engine.pool().num_pages(), 1);

    let report = engine.step().unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.advanced, 0);
    assert_eq!(report.finished, 0);

    let (tokens, finished) = drain(&mut rx);
    assert_eq!(tokens, 0, "a deferred slot produces no token event");
    assert_eq!(finished, None, "a deferred slot must not be retired");
    assert_eq!(engine.pool().num_pages(), 1, "the request keeps its existing page");

    // Stepping again hits the exact same exhaustion, over and over, rather
    // than ever flipping to an executor-fault retirement.
    let report = engine.step().unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.finished, 0);
    let (_, finished) = drain(&mut rx);
    assert_eq!(finished, None);
}
