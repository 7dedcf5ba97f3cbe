//! Continuous-batching scheduler core: paged KV-cache management, LoRA
//! adapter batching, sampling, and the single-driver-thread step loop that
//! ties them together.

pub mod adapter;
pub mod engine;
pub mod kv;
pub mod page;
pub mod planner;
pub mod queue;
pub mod request;
pub mod sampler;

use std::sync::Arc;
use std::time::Duration;

use ember_backend::{ModelExecutor, Tokenizer};
use ember_common::config::EngineConfig;
use tokio::sync::mpsc;
use tracing::{info, instrument};

use engine::{AdminCommand, AdmitRequest, Engine};
use queue::{AdminHandle, RequestQueue};

/// Capacity of the admission channel between [`RequestQueue`] and the
/// driver task. Bounded so a submitter blocks (applying backpressure) once
/// the driver falls behind, rather than growing admissions without limit.
const ADMISSION_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the administrative command channel. Admin traffic is rare
/// (adapter loads, stats polls), so a small buffer is enough.
const ADMIN_CHANNEL_CAPACITY: usize = 64;

/// Spawns the engine's driver task and returns handles to it. Mirrors the
/// teacher's scheduler-start shape: one ticker, one owned mutable engine,
/// requests fanned in over a channel.
#[instrument(skip_all, fields(step_tick_ms = config.step_tick_ms))]
pub fn spawn(
    config: EngineConfig,
    executor: Arc<dyn ModelExecutor>,
    tokenizer: Arc<dyn Tokenizer>,
) -> (RequestQueue, AdminHandle) {
    let (tx, mut rx) = mpsc::channel::<AdmitRequest>(ADMISSION_CHANNEL_CAPACITY);
    let (admin_tx, mut admin_rx) = mpsc::channel::<AdminCommand>(ADMIN_CHANNEL_CAPACITY);
    let tick_ms = config.step_tick_ms;
    let mut engine = Engine::new(config, executor, tokenizer);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms));
        info!("engine driver task started");
        loop {
            ticker.tick().await;
            engine.drain_admissions(&mut rx);
            engine.drain_admin(&mut admin_rx);
            match engine.step() {
                Ok(report) if report.advanced > 0 || report.finished > 0 => {
                    tracing::debug!(?report, "step");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "step failed"),
            }
        }
    });

    (RequestQueue::new(tx), AdminHandle::new(admin_tx))
}
