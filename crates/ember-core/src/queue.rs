//! Request admission and cancellation (C9): the thread-safe front door the
//! API layer submits prompts through and streams tokens back out of.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ember_backend::Tokenizer;
use ember_common::{AdapterId, EmberError, Result};
use tokio::sync::{mpsc, oneshot};

use crate::adapter::LoraWeight;
use crate::engine::{AdminCommand, AdmitRequest, EngineStats, StreamEvent};
use crate::request::{RequestId, SamplerParams};

/// Per-request streaming queue depth. Bounded: a slow consumer applies
/// backpressure to the driver's `try_send` (which drops rather than
/// blocks the step loop — see [`crate::engine::Engine::step`]).
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

pub struct SubmitRequest {
    pub prompt: String,
    pub sampler: SamplerParams,
    pub adapter_id: AdapterId,
    pub max_tokens: usize,
    pub stop_token_ids: HashSet<u32>,
}

pub struct Submitted {
    pub request_id: RequestId,
    pub cancel: Arc<AtomicBool>,
    pub stream: mpsc::Receiver<StreamEvent>,
}

/// Handle the API layer holds to submit work to one running [`crate::engine::Engine`].
/// Cloneable; cancellation needs no round trip to the driver thread since it
/// flips an `Arc<AtomicBool>` the engine already polls every step.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::Sender<AdmitRequest>,
    next_id: Arc<AtomicU64>,
}

impl RequestQueue {
    pub fn new(tx: mpsc::Sender<AdmitRequest>) -> Self {
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Encodes the prompt, registers a cancellation flag and a bounded
    /// output stream, and waits for the driver thread to admit (or reject)
    /// the request before returning.
    pub async fn submit(&self, req: SubmitRequest, tokenizer: &dyn Tokenizer) -> Result<Submitted> {
        let prompt_ids = tokenizer.encode(&req.prompt);
        if prompt_ids.is_empty() {
            return Err(EmberError::InvalidSamplerParams(
                "prompt must encode to at least one token".to_string(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));
        let (respond, stream) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = oneshot::channel();

        let admit = AdmitRequest {
            id,
            prompt_ids,
            sampler: req.sampler,
            adapter_id: req.adapter_id,
            max_tokens: req.max_tokens,
            stop_token_ids: req.stop_token_ids,
            cancel: cancel.clone(),
            respond,
            ack: ack_tx,
        };

        self.tx.send(admit).await.map_err(|_| EmberError::Backpressure)?;
        ack_rx.await.map_err(|_| EmberError::Backpressure)??;

        Ok(Submitted {
            request_id: id,
            cancel,
            stream,
        })
    }

    /// Requests cancellation. The engine observes this no later than the
    /// start of its next step's planning phase.
    pub fn cancel(cancel: &Arc<AtomicBool>) {
        cancel.store(true, Ordering::Release);
    }
}

/// Handle for the administrative control surface (adapter loading, live
/// stats) — the `AdapterControl`/`Info` endpoints in the API layer.
#[derive(Clone)]
pub struct AdminHandle {
    tx: mpsc::Sender<AdminCommand>,
}

impl AdminHandle {
    pub fn new(tx: mpsc::Sender<AdminCommand>) -> Self {
        Self { tx }
    }

    pub async fn load_adapter(
        &self,
        id: AdapterId,
        raw_rank: usize,
        hidden_size: usize,
        weights: std::collections::HashMap<&'static str, LoraWeight>,
    ) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(AdminCommand::LoadAdapter {
                id,
                raw_rank,
                hidden_size,
                weights,
                ack,
            })
            .await
            .map_err(|_| EmberError::Backpressure)?;
        ack_rx.await.map_err(|_| EmberError::Backpressure)?
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(AdminCommand::Stats { ack })
            .await
            .map_err(|_| EmberError::Backpressure)?;
        ack_rx.await.map_err(|_| EmberError::Backpressure)
    }

    pub async fn remove_adapter(&self, id: AdapterId) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(AdminCommand::RemoveAdapter { id, ack })
            .await
            .map_err(|_| EmberError::Backpressure)?;
        ack_rx.await.map_err(|_| EmberError::Backpressure)?
    }

    pub async fn adapter_status(&self, id: AdapterId) -> Result<Option<(usize, usize)>> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(AdminCommand::AdapterStatus { id, ack })
            .await
            .map_err(|_| EmberError::Backpressure)?;
        ack_rx.await.map_err(|_| EmberError::Backpressure)
    }
}
