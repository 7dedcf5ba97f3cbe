//! HTTP control surface: the RPC-shaped `Info`/`Warmup`/`Prefill`/`Decode`/
//! `AdapterControl` endpoints plus a streaming `/v1/generate` SSE route, all
//! fronting one running [`ember_core::engine::Engine`] via the handles
//! [`ember_core::spawn`] returns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, IntCounter, TextEncoder};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use ember_backend::{ModelExecutor, Tokenizer};
use ember_common::config::EngineConfig;
use ember_common::{empty_adapter_id, AdapterId, FinishReason};
use ember_core::adapter::{LoraWeight, PROJECTIONS};
use ember_core::engine::StreamEvent;
use ember_core::queue::{AdminHandle, RequestQueue, SubmitRequest};
use ember_core::request::{RequestId, SamplerParams};

static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

#[derive(Clone)]
pub struct AppState {
    queue: RequestQueue,
    admin: AdminHandle,
    tokenizer: Arc<dyn Tokenizer>,
    model_id: String,
    // Live streams handed out by Prefill, kept around so Decode can pull the
    // next event from the same request.
    streams: Arc<Mutex<HashMap<RequestId, mpsc::Receiver<StreamEvent>>>>,
    cancels: Arc<Mutex<HashMap<RequestId, std::sync::Arc<std::sync::atomic::AtomicBool>>>>,
    requests_total: IntCounter,
    tokens_generated_total: IntCounter,
    ttft_seconds: Histogram,
}

/// Builds the router against an already-spawned engine. `model_id` is
/// whatever the embedder wants reported from `Info`.
pub fn app(
    config: EngineConfig,
    executor: Arc<dyn ModelExecutor>,
    tokenizer: Arc<dyn Tokenizer>,
    model_id: String,
) -> Router {
    ember_obs::init();
    ember_obs::spawn_gpu_polling();
    let (queue, admin) = ember_core::spawn(config, executor, tokenizer.clone());

    let state = AppState {
        queue,
        admin,
        tokenizer,
        model_id,
        streams: Arc::new(Mutex::new(HashMap::new())),
        cancels: Arc::new(Mutex::new(HashMap::new())),
        requests_total: prometheus::register_int_counter!(
            "ember_requests_total",
            "Total number of /v1/generate requests"
        )
        .expect("counter"),
        tokens_generated_total: prometheus::register_int_counter!(
            "ember_tokens_generated_total",
            "Total output tokens streamed to clients"
        )
        .expect("counter"),
        ttft_seconds: prometheus::register_histogram!(
            "ember_ttft_seconds",
            "Time to first streamed token"
        )
        .expect("histogram"),
    };

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/info", get(info))
        .route("/v1/warmup", post(warmup))
        .route("/v1/prefill", post(prefill))
        .route("/v1/decode", post(decode))
        .route("/v1/adapters", post(adapter_control))
        .route("/v1/generate", post(generate))
        .route("/v1/generate/:request_id", axum::routing::delete(cancel_generate))
        .with_state(state)
}

/// Convenience entry point for `ember-cli run`/`serve` and local testing:
/// wires the mock executor and byte tokenizer so the whole surface works
/// without real model weights.
pub fn mock_app() -> Router {
    let executor: Arc<dyn ModelExecutor> = Arc::new(ember_backend::mock::MockExecutor::default());
    let tokenizer: Arc<dyn Tokenizer> = Arc::new(ember_backend::mock::ByteTokenizer::new());
    app(EngineConfig::load(), executor, tokenizer, "mock".to_string())
}

async fn metrics() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    ENCODER.encode(&metric_families, &mut buffer).unwrap();
    ([("content-type", ENCODER.format_type().to_string())], buffer)
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match state.admin.stats().await {
        Ok(stats) => {
            ember_obs::KV_PAGES_IN_USE.set(stats.pages_in_use as i64);
            ember_obs::KV_PAGES_CAPACITY.set(stats.pool_capacity_pages as i64);
            ember_obs::QUEUE_DEPTH.set(stats.live_requests as i64);
            ember_obs::ADAPTERS_RESIDENT.set(stats.resident_adapters.len() as i64);
            (StatusCode::OK, "ready")
        }
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "not-ready"),
    }
}

#[derive(serde::Serialize, Default)]
struct InfoResponse {
    engine: String,
    model_id: String,
    resident_adapters: Vec<AdapterId>,
    pool_capacity_pages: usize,
    pages_in_use: usize,
    live_requests: usize,
}

async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    let stats = state.admin.stats().await.unwrap_or_default();
    Json(InfoResponse {
        engine: "ember".to_string(),
        model_id: state.model_id.clone(),
        resident_adapters: stats.resident_adapters,
        pool_capacity_pages: stats.pool_capacity_pages,
        pages_in_use: stats.pages_in_use,
        live_requests: stats.live_requests,
    })
}

#[derive(serde::Deserialize)]
struct WarmupRequest {
    num_tokens: usize,
    adapter_id: Option<AdapterId>,
}

#[derive(serde::Serialize)]
struct OkResponse {
    ok: bool,
    error: Option<String>,
}

/// Admits a synthetic prompt of `num_tokens` tokens, immediately cancels it,
/// and waits for it to retire — a dry run that forces the sequence cache's
/// page allocation through without holding pages afterward.
async fn warmup(State(state): State<AppState>, Json(req): Json<WarmupRequest>) -> Json<OkResponse> {
    let submit = SubmitRequest {
        prompt: "a".repeat(req.num_tokens.max(1)),
        sampler: SamplerParams::default(),
        adapter_id: req.adapter_id.unwrap_or_else(empty_adapter_id),
        max_tokens: 1,
        stop_token_ids: HashSet::new(),
    };
    match state.queue.submit(submit, state.tokenizer.as_ref()).await {
        Ok(submitted) => {
            RequestQueue::cancel(&submitted.cancel);
            let mut stream = submitted.stream;
            while stream.recv().await.is_some() {}
            Json(OkResponse { ok: true, error: None })
        }
        Err(e) => Json(OkResponse {
            ok: false,
            error: Some(e.to_string()),
        }),
    }
}

#[derive(serde::Deserialize)]
struct PromptSpec {
    prompt: String,
    adapter_id: Option<AdapterId>,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<usize>,
    repetition_penalty: Option<f32>,
    stop_token_ids: Option<Vec<u32>>,
}

impl PromptSpec {
    fn into_submit(self) -> SubmitRequest {
        SubmitRequest {
            prompt: self.prompt,
            sampler: SamplerParams {
                temperature: self.temperature.unwrap_or(1.0),
                top_p: self.top_p.unwrap_or(1.0),
                top_k: self.top_k.unwrap_or(0),
                repetition_penalty: self.repetition_penalty.unwrap_or(1.0),
            },
            adapter_id: self.adapter_id.unwrap_or_else(empty_adapter_id),
            max_tokens: self.max_tokens.unwrap_or(128),
            stop_token_ids: self.stop_token_ids.unwrap_or_default().into_iter().collect(),
        }
    }
}

#[derive(serde::Serialize)]
struct Generation {
    request_id: Option<RequestId>,
    text: String,
    finish_reason: Option<FinishReason>,
    error: Option<String>,
}

#[derive(serde::Deserialize)]
struct PrefillRequest {
    prompts: Vec<PromptSpec>,
}

#[derive(serde::Serialize)]
struct PrefillResponse {
    generations: Vec<Generation>,
    batch_handle: Vec<RequestId>,
}

/// Admits a batch of prompts and returns each one's first generated token
/// (or terminal reason), plus a `batch_handle` to keep decoding the ones
/// still live through [`decode`].
async fn prefill(State(state): State<AppState>, Json(req): Json<PrefillRequest>) -> Json<PrefillResponse> {
    let mut generations = Vec::with_capacity(req.prompts.len());
    let mut batch_handle = Vec::new();

    for spec in req.prompts {
        state.requests_total.inc();
        let start = std::time::Instant::now();
        match state.queue.submit(spec.into_submit(), state.tokenizer.as_ref()).await {
            Ok(submitted) => {
                let mut stream = submitted.stream;
                let first = stream.recv().await;
                state.ttft_seconds.observe(start.elapsed().as_secs_f64());
                state
                    .cancels
                    .lock()
                    .await
                    .insert(submitted.request_id, submitted.cancel);
                match first {
                    Some(StreamEvent::Token(text)) => {
                        state.tokens_generated_total.inc();
                        state.streams.lock().await.insert(submitted.request_id, stream);
                        batch_handle.push(submitted.request_id);
                        generations.push(Generation {
                            request_id: Some(submitted.request_id),
                            text,
                            finish_reason: None,
                            error: None,
                        });
                    }
                    Some(StreamEvent::Finished(reason)) => {
                        state.cancels.lock().await.remove(&submitted.request_id);
                        generations.push(Generation {
                            request_id: Some(submitted.request_id),
                            text: String::new(),
                            finish_reason: Some(reason),
                            error: None,
                        });
                    }
                    None => {
                        state.cancels.lock().await.remove(&submitted.request_id);
                        generations.push(Generation {
                            request_id: Some(submitted.request_id),
                            text: String::new(),
                            finish_reason: Some(FinishReason::ExecutorFailure),
                            error: None,
                        });
                    }
                }
            }
            Err(e) => generations.push(Generation {
                request_id: None,
                text: String::new(),
                finish_reason: None,
                error: Some(e.to_string()),
            }),
        }
    }

    Json(PrefillResponse { generations, batch_handle })
}

#[derive(serde::Deserialize)]
struct DecodeRequest {
    batch_handle: Vec<RequestId>,
}

#[derive(serde::Serialize)]
struct DecodeResponse {
    generations: Vec<Generation>,
    batch_handle: Option<Vec<RequestId>>,
}

/// Pulls the next event for each request id in `batch_handle`, dropping ids
/// that have retired and carrying the rest forward in the response.
async fn decode(State(state): State<AppState>, Json(req): Json<DecodeRequest>) -> Json<DecodeResponse> {
    let mut generations = Vec::with_capacity(req.batch_handle.len());
    let mut continued = Vec::new();

    for id in req.batch_handle {
        let event = {
            let mut streams = state.streams.lock().await;
            match streams.get_mut(&id) {
                Some(rx) => rx.recv().await,
                None => {
                    generations.push(Generation {
                        request_id: Some(id),
                        text: String::new(),
                        finish_reason: None,
                        error: Some("unknown batch handle".to_string()),
                    });
                    continue;
                }
            }
        };
        match event {
            Some(StreamEvent::Token(text)) => {
                state.tokens_generated_total.inc();
                continued.push(id);
                generations.push(Generation {
                    request_id: Some(id),
                    text,
                    finish_reason: None,
                    error: None,
                });
            }
            Some(StreamEvent::Finished(reason)) => {
                state.streams.lock().await.remove(&id);
                state.cancels.lock().await.remove(&id);
                generations.push(Generation {
                    request_id: Some(id),
                    text: String::new(),
                    finish_reason: Some(reason),
                    error: None,
                });
            }
            None => {
                state.streams.lock().await.remove(&id);
                state.cancels.lock().await.remove(&id);
                generations.push(Generation {
                    request_id: Some(id),
                    text: String::new(),
                    finish_reason: Some(FinishReason::ExecutorFailure),
                    error: None,
                });
            }
        }
    }

    let batch_handle = (!continued.is_empty()).then_some(continued);
    Json(DecodeResponse { generations, batch_handle })
}

#[derive(serde::Deserialize)]
struct RawProjection {
    a: Vec<f32>,
    b: Vec<f32>,
}

#[derive(serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum AdapterControlRequest {
    Load {
        id: AdapterId,
        raw_rank: usize,
        hidden_size: usize,
        weights: HashMap<String, RawProjection>,
    },
    Remove {
        id: AdapterId,
    },
    Status {
        id: AdapterId,
    },
}

#[derive(serde::Serialize)]
struct AdapterControlResponse {
    ok: bool,
    raw_rank: Option<usize>,
    padded_rank: Option<usize>,
    error: Option<String>,
}

async fn adapter_control(
    State(state): State<AppState>,
    Json(req): Json<AdapterControlRequest>,
) -> Json<AdapterControlResponse> {
    match req {
        AdapterControlRequest::Load {
            id,
            raw_rank,
            hidden_size,
            weights,
        } => {
            let mut parsed = HashMap::with_capacity(PROJECTIONS.len());
            for (name, raw) in weights {
                if let Some(key) = PROJECTIONS.iter().find(|&&p| p == name) {
                    parsed.insert(*key, LoraWeight { a: raw.a, b: raw.b });
                }
            }
            match state.admin.load_adapter(id, raw_rank, hidden_size, parsed).await {
                Ok(()) => Json(AdapterControlResponse {
                    ok: true,
                    raw_rank: Some(raw_rank),
                    padded_rank: None,
                    error: None,
                }),
                Err(e) => Json(AdapterControlResponse {
                    ok: false,
                    raw_rank: None,
                    padded_rank: None,
                    error: Some(e.to_string()),
                }),
            }
        }
        AdapterControlRequest::Remove { id } => match state.admin.remove_adapter(id).await {
            Ok(()) => Json(AdapterControlResponse {
                ok: true,
                raw_rank: None,
                padded_rank: None,
                error: None,
            }),
            Err(e) => Json(AdapterControlResponse {
                ok: false,
                raw_rank: None,
                padded_rank: None,
                error: Some(e.to_string()),
            }),
        },
        AdapterControlRequest::Status { id } => match state.admin.adapter_status(id).await {
            Ok(Some((raw_rank, padded_rank))) => Json(AdapterControlResponse {
                ok: true,
                raw_rank: Some(raw_rank),
                padded_rank: Some(padded_rank),
                error: None,
            }),
            Ok(None) => Json(AdapterControlResponse {
                ok: false,
                raw_rank: None,
                padded_rank: None,
                error: Some("adapter not loaded".to_string()),
            }),
            Err(e) => Json(AdapterControlResponse {
                ok: false,
                raw_rank: None,
                padded_rank: None,
                error: Some(e.to_string()),
            }),
        },
    }
}

#[derive(serde::Deserialize)]
struct GenerateRequest {
    prompt: String,
    adapter_id: Option<AdapterId>,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<usize>,
    repetition_penalty: Option<f32>,
    stop_token_ids: Option<Vec<u32>>,
}

/// Streams one request's tokens as SSE `token`/`finished` events. The
/// request id is sent as the first event so a client can cancel with
/// `DELETE /v1/generate/{id}`.
async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Sse<ReceiverStream<Result<Event, std::convert::Infallible>>>, (StatusCode, String)> {
    state.requests_total.inc();
    let spec = PromptSpec {
        prompt: req.prompt,
        adapter_id: req.adapter_id,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        repetition_penalty: req.repetition_penalty,
        stop_token_ids: req.stop_token_ids,
    };
    let submitted = state
        .queue
        .submit(spec.into_submit(), state.tokenizer.as_ref())
        .await
        .map_err(|e| (StatusCode::TOO_MANY_REQUESTS, e.to_string()))?;

    let request_id = submitted.request_id;
    state.cancels.lock().await.insert(request_id, submitted.cancel);

    let (tx, rx) = mpsc::channel::<Result<Event, std::convert::Infallible>>(16);
    let _ = tx
        .send(Ok(Event::default().event("request_id").data(request_id.to_string())))
        .await;

    let cancels = state.cancels.clone();
    let tokens_counter = state.tokens_generated_total.clone();
    let start = std::time::Instant::now();
    let ttft = state.ttft_seconds.clone();
    let mut first = true;
    let mut upstream = submitted.stream;
    tokio::spawn(async move {
        while let Some(event) = upstream.recv().await {
            if first {
                ttft.observe(start.elapsed().as_secs_f64());
                first = false;
            }
            let sse_event = match event {
                StreamEvent::Token(text) => {
                    tokens_counter.inc();
                    Event::default().event("token").data(text)
                }
                StreamEvent::Finished(reason) => {
                    cancels.lock().await.remove(&request_id);
                    Event::default()
                        .event("finished")
                        .data(serde_json::to_string(&reason).unwrap_or_default())
                }
            };
            if tx.send(Ok(sse_event)).await.is_err() {
                break;
            }
        }
        cancels.lock().await.remove(&request_id);
    });

    Ok(Sse::new(ReceiverStream::new(rx)))
}

async fn cancel_generate(State(state): State<AppState>, Path(request_id): Path<RequestId>) -> impl IntoResponse {
    match state.cancels.lock().await.get(&request_id) {
        Some(cancel) => {
            RequestQueue::cancel(cancel);
            (StatusCode::OK, "canceled")
        }
        None => (StatusCode::NOT_FOUND, "unknown request id"),
    }
}
