//! Observability utilities: tracing-subscriber init, scheduler/KV/adapter
//! gauges, and optional GPU metrics.

use once_cell::sync::Lazy;
use prometheus::{Gauge, IntGauge};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static GPU_UTIL: Lazy<Gauge> = Lazy::new(|| prometheus::register_gauge!("ember_gpu_utilization", "GPU utilization percent").unwrap());
static GPU_MEM_USED: Lazy<IntGauge> = Lazy::new(|| prometheus::register_int_gauge!("ember_gpu_memory_bytes", "GPU memory used (bytes)").unwrap());
static GPU_TEMP: Lazy<Gauge> = Lazy::new(|| prometheus::register_gauge!("ember_gpu_temperature_celsius", "GPU temperature in C").unwrap());

pub static QUEUE_DEPTH: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("ember_live_requests", "Requests currently admitted").unwrap());
pub static BATCH_SIZE: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("ember_last_batch_size", "Slot count of the last planned batch").unwrap());
pub static KV_PAGES_IN_USE: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("ember_kv_pages_in_use", "Page pool pages currently checked out").unwrap());
pub static KV_PAGES_CAPACITY: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("ember_kv_pages_capacity", "Page pool capacity in pages").unwrap());
pub static ADAPTERS_RESIDENT: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("ember_adapters_resident", "Adapters currently loaded in the registry").unwrap());

pub fn init() {
    // Touch statics to ensure registration and avoid dead_code warnings when NVML is disabled.
    let _ = &*GPU_UTIL;
    let _ = &*GPU_MEM_USED;
    let _ = &*GPU_TEMP;
    let _ = &*QUEUE_DEPTH;
    let _ = &*BATCH_SIZE;
    let _ = &*KV_PAGES_IN_USE;
    let _ = &*KV_PAGES_CAPACITY;
    let _ = &*ADAPTERS_RESIDENT;
}

pub fn spawn_gpu_polling() {
    #[cfg(feature = "nvidia")]
    tokio::spawn(async move {
        let nvml = match nvml_wrapper::NVML::init() { Ok(n) => n, Err(_) => return };
        let device = match nvml.device_by_index(0) { Ok(d) => d, Err(_) => return };
        loop {
            if let Ok(util) = device.utilization_rates() { GPU_UTIL.set(util.gpu as f64); }
            if let Ok(mem) = device.memory_info() { GPU_MEM_USED.set(mem.used as i64); }
            if let Ok(temp) = device.temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu) { GPU_TEMP.set(temp as f64); }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });
}

/// Wires `tracing-subscriber` with `RUST_LOG`-driven filtering, plus an
/// optional OTLP exporter when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
