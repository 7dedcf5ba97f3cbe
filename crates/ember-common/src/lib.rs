//! Shared error taxonomy, configuration, and small value types used across
//! the engine, backend, API, and CLI crates.

pub type Result<T> = core::result::Result<T, EmberError>;

/// Opaque adapter identity. The reserved value `"empty"` always resolves in
/// the registry and denotes "no adapter".
pub type AdapterId = String;

/// Returns the reserved adapter id that denotes "no adapter applied".
pub fn empty_adapter_id() -> AdapterId {
    "empty".to_string()
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum EmberError {
    #[error("page pool exhausted")]
    PoolExhausted,
    #[error("free_page called with an address not owned by this pool")]
    InvalidPage,
    #[error("adapter '{0}' is not loaded and not loadable")]
    AdapterNotFound(AdapterId),
    #[error("adapter weight shape mismatch: expected rank {expected_rank}, got {actual_rank}")]
    AdapterShapeMismatch {
        expected_rank: usize,
        actual_rank: usize,
    },
    #[error("invalid sampler params: {0}")]
    InvalidSamplerParams(String),
    #[error("sequence too long: {len} tokens exceeds limit of {max}")]
    SequenceTooLong { len: usize, max: usize },
    #[error("model executor failed: {0}")]
    ExecutorFailure(String),
    #[error("insufficient KV capacity, retry later")]
    Backpressure,
}

/// Terminal reason attached to a request's final stream event. Distinct from
/// `EmberError`: a single request's failure is delivered as data on its
/// stream, not propagated as a process-level `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    StopTokenReached,
    MaxTokens,
    Canceled,
    ExecutorFailure,
}

pub mod config {
    use serde::Deserialize;
    use std::env;
    use std::path::PathBuf;

    /// Engine configuration: page pool shape, adapter registry capacity,
    /// and scheduling knobs. Loaded the way the teacher's `RunnerConfig`
    /// is: an optional YAML file named by `EMBER_CONFIG`, else individual
    /// `EMBER_*` env var overrides on top of `Default`.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct EngineConfig {
        pub model_dir: PathBuf,
        pub page_len: usize,
        pub pool_capacity_pages: usize,
        pub num_layers: usize,
        pub num_heads: usize,
        pub head_dim: usize,
        pub default_adapter_rank: usize,
        pub adapter_capacity: usize,
        pub max_sequence_tokens: usize,
        pub step_tick_ms: u64,
        pub max_batch_tokens: usize,
    }

    impl Default for EngineConfig {
        fn default() -> Self {
            Self {
                model_dir: PathBuf::from("models"),
                page_len: 16,
                pool_capacity_pages: 4096,
                num_layers: 32,
                num_heads: 32,
                head_dim: 128,
                default_adapter_rank: 16,
                adapter_capacity: 4,
                max_sequence_tokens: 4096,
                step_tick_ms: 2,
                max_batch_tokens: 8192,
            }
        }
    }

    impl EngineConfig {
        pub fn load() -> Self {
            if let Ok(path) = env::var("EMBER_CONFIG") {
                let Ok(text) = std::fs::read_to_string(path) else {
                    return Self::default();
                };
                let Ok(cfg) = serde_yaml::from_str::<EngineConfig>(&text) else {
                    return Self::default();
                };
                return cfg;
            }
            let mut cfg = Self::default();
            if let Ok(dir) = env::var("EMBER_MODEL_DIR") {
                cfg.model_dir = PathBuf::from(dir);
            }
            if let Some(v) = env_usize("EMBER_PAGE_LEN") {
                cfg.page_len = v;
            }
            if let Some(v) = env_usize("EMBER_POOL_CAPACITY_PAGES") {
                cfg.pool_capacity_pages = v;
            }
            if let Some(v) = env_usize("EMBER_NUM_LAYERS") {
                cfg.num_layers = v;
            }
            if let Some(v) = env_usize("EMBER_NUM_HEADS") {
                cfg.num_heads = v;
            }
            if let Some(v) = env_usize("EMBER_HEAD_DIM") {
                cfg.head_dim = v;
            }
            if let Some(v) = env_usize("EMBER_DEFAULT_ADAPTER_RANK") {
                cfg.default_adapter_rank = v;
            }
            if let Some(v) = env_usize("EMBER_ADAPTER_CAPACITY") {
                cfg.adapter_capacity = v;
            }
            if let Some(v) = env_usize("EMBER_MAX_SEQUENCE_TOKENS") {
                cfg.max_sequence_tokens = v;
            }
            if let Some(v) = env::var("EMBER_STEP_TICK_MS").ok().and_then(|v| v.parse().ok()) {
                cfg.step_tick_ms = v;
            }
            if let Some(v) = env_usize("EMBER_MAX_BATCH_TOKENS") {
                cfg.max_batch_tokens = v;
            }
            cfg
        }
    }

    fn env_usize(key: &str) -> Option<usize> {
        env::var(key).ok().and_then(|v| v.parse().ok())
    }
}

