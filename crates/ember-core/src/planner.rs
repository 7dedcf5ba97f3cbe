//! Batch planner (C7): decides which requests get a slot this step within
//! the token budget, lays out the row order for the forward pass, and
//! run-length-encodes adapter ids for the fused LoRA GEMM.

use ember_backend::AdapterRunBatch;
use ember_common::AdapterId;

use crate::request::RequestId;

/// What the planner needs to know about one candidate request; deliberately
/// small and owned so the planner never borrows into the live request table.
#[derive(Debug, Clone)]
pub struct CandidateView {
    pub request_id: RequestId,
    pub adapter_id: AdapterId,
    /// Prompt length for a prefill candidate; ignored (always costs 1) for
    /// a decode candidate.
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct PlanSlot {
    pub request_id: RequestId,
    pub adapter_id: AdapterId,
    pub is_prefill: bool,
}

/// Everything the step loop needs to invoke the executor for one step, in
/// final row order (all prefill slots, then all decode slots).
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub slots: Vec<PlanSlot>,
    pub prefill_lens: Vec<usize>,
    pub decode_count: usize,
    pub adapter_runs: AdapterRunBatch,
}

#[derive(Debug, Clone, Default)]
pub struct PlanOutcome {
    pub plan: Option<Plan>,
    /// Requests present in this step's candidate pool but left out for lack
    /// of token budget; reconsidered next step.
    pub deferred: Vec<RequestId>,
}

/// Decode candidates are admitted first (continuous batching keeps
/// already-running sequences moving ahead of new prefills), then prefill
/// candidates fill whatever budget remains, both in the caller-supplied
/// (admission) order.
pub fn plan(
    decode_candidates: &[CandidateView],
    prefill_candidates: &[CandidateView],
    max_batch_tokens: usize,
    default_rank: usize,
) -> PlanOutcome {
    let mut deferred = Vec::new();
    let mut budget = max_batch_tokens;

    let mut accepted_decode = Vec::with_capacity(decode_candidates.len());
    for c in decode_candidates {
        if budget >= 1 {
            accepted_decode.push(c.clone());
            budget -= 1;
        } else {
            deferred.push(c.request_id);
        }
    }

    let mut accepted_prefill = Vec::with_capacity(prefill_candidates.len());
    for c in prefill_candidates {
        if c.len <= budget {
            budget -= c.len;
            accepted_prefill.push(c.clone());
        } else {
            deferred.push(c.request_id);
        }
    }

    if accepted_decode.is_empty() && accepted_prefill.is_empty() {
        return PlanOutcome { plan: None, deferred };
    }

    // Stable sort: requests sharing an adapter land contiguously while ties
    // (same adapter) keep their relative admission order, which is what
    // makes run-length encoding contiguous without reordering requests that
    // don't need it.
    accepted_prefill.sort_by(|a, b| a.adapter_id.cmp(&b.adapter_id));
    accepted_decode.sort_by(|a, b| a.adapter_id.cmp(&b.adapter_id));

    let prefill_lens: Vec<usize> = accepted_prefill.iter().map(|c| c.len).collect();
    let decode_count = accepted_decode.len();

    let mut slots = Vec::with_capacity(accepted_prefill.len() + accepted_decode.len());
    slots.extend(accepted_prefill.iter().map(|c| PlanSlot {
        request_id: c.request_id,
        adapter_id: c.adapter_id.clone(),
        is_prefill: true,
    }));
    slots.extend(accepted_decode.iter().map(|c| PlanSlot {
        request_id: c.request_id,
        adapter_id: c.adapter_id.clone(),
        is_prefill: false,
    }));

    let adapter_runs = run_length_encode(&slots, default_rank);

    PlanOutcome {
        plan: Some(Plan {
            slots,
            prefill_lens,
            decode_count,
            adapter_runs,
        }),
        deferred,
    }
}

fn run_length_encode(slots: &[PlanSlot], rank: usize) -> AdapterRunBatch {
    let mut ids: Vec<AdapterId> = Vec::new();
    let mut lens: Vec<usize> = Vec::new();
    for slot in slots {
        if ids.last() == Some(&slot.adapter_id) {
            *lens.last_mut().unwrap() += 1;
        } else {
            ids.push(slot.adapter_id.clone());
            lens.push(1);
        }
    }
    let mut segment = vec![0i32];
    for &len in &lens {
        let last = *segment.last().unwrap();
        segment.push(last + len as i32);
    }
    AdapterRunBatch {
        ids,
        lens,
        segment,
        rank,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: RequestId, adapter: &str, len: usize) -> CandidateView {
        CandidateView {
            request_id: id,
            adapter_id: adapter.to_string(),
            len,
        }
    }

    #[test]
    fn empty_candidates_yield_no_plan() {
        let outcome = plan(&[], &[], 1000, 16);
        assert!(outcome.plan.is_none());
        assert!(outcome.deferred.is_empty());
    }

    #[test]
    fn prefill_lens_and_doff_follow_accepted_order() {
        let prefill = vec![cand(1, "a", 5), cand(2, "a", 3)];
        let outcome = plan(&[], &prefill, 1000, 16);
        let p = outcome.plan.unwrap();
        assert_eq!(p.prefill_lens, vec![5, 3]);
        assert_eq!(p.decode_count, 0);
    }

    #[test]
    fn decode_prioritized_over_prefill_under_budget() {
        let decode = vec![cand(1, "a", 1), cand(2, "a", 1)];
        let prefill = vec![cand(3, "a", 10)];
        let outcome = plan(&decode, &prefill, 3, 16);
        let p = outcome.plan.unwrap();
        assert_eq!(p.decode_count, 2);
        assert!(p.prefill_lens.is_empty());
        assert_eq!(outcome.deferred, vec![3]);
    }

    #[test]
    fn mixed_adapters_run_length_encode_contiguously() {
        let prefill = vec![cand(1, "b", 2), cand(2, "a", 2), cand(3, "b", 2)];
        let outcome = plan(&[], &prefill, 1000, 16);
        let p = outcome.plan.unwrap();
        // stable sort by adapter id: a(2) then b(1), b(3)
        assert_eq!(p.adapter_runs.ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(p.adapter_runs.lens, vec![1, 2]);
        assert_eq!(p.adapter_runs.segment, vec![0, 1, 3]);
    }

    #[test]
    fn adapter_run_rank_uses_registry_default() {
        let prefill = vec![cand(1, "a", 2)];
        let outcome = plan(&[], &prefill, 1000, 32);
        assert_eq!(outcome.plan.unwrap().adapter_runs.rank, 32);
    }

    #[test]
    fn token_budget_defers_excess_prefill_requests() {
        let prefill = vec![cand(1, "a", 4), cand(2, "a", 4), cand(3, "a", 4)];
        let outcome = plan(&[], &prefill, 9, 16);
        let p = outcome.plan.unwrap();
        assert_eq!(p.prefill_lens, vec![4, 4]);
        assert_eq!(outcome.deferred, vec![3]);
    }
}
