use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::Router;
use clap::{Args, Parser, Subcommand};
use ember_backend::mock::{ByteTokenizer, MockExecutor};
use ember_backend::Tokenizer;
use ember_core::engine::{AdmitRequest, Engine, StreamEvent};
use ember_core::request::SamplerParams;

#[derive(Parser, Debug)]
#[command(name = "ember", version, about = "Continuous-batching LoRA inference engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP control surface.
    Serve,
    /// One-shot local generation against the mock executor, no server.
    Run(RunArgs),
    /// Inspect or mutate the adapter registry of a running engine.
    Adapters(AdaptersArgs),
    /// Print local CPU/memory stats.
    Stats,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long)]
    prompt: String,
    #[arg(short = 'n', long, default_value_t = 32)]
    max_tokens: usize,
}

#[derive(Args, Debug)]
struct AdaptersArgs {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    url: String,
    #[command(subcommand)]
    op: AdapterOp,
}

#[derive(Subcommand, Debug)]
enum AdapterOp {
    /// Load an adapter from a JSON file shaped `{raw_rank, hidden_size, weights}`.
    Load { id: String, path: String },
    Remove { id: String },
    Status { id: String },
}

#[tokio::main]
async fn main() {
    ember_obs::init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve().await,
        Commands::Run(args) => run_local(args).await,
        Commands::Adapters(args) => adapters(args).await,
        Commands::Stats => stats(),
    }
}

async fn serve() {
    let app: Router = ember_api::mock_app();
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", 8080)).await.unwrap();
    tracing::info!("listening on http://0.0.0.0:8080");
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await.unwrap();
}

/// Drives one request through a freshly constructed [`Engine`] directly,
/// bypassing the admission channel and the tick loop — a single process
/// stepping itself to completion, for quick local smoke tests.
async fn run_local(args: RunArgs) {
    let executor = Arc::new(MockExecutor::default());
    let tokenizer = Arc::new(ByteTokenizer::new());
    let mut engine = Engine::new(
        ember_common::config::EngineConfig::load(),
        executor,
        tokenizer.clone(),
    );

    let prompt_ids = tokenizer.encode(&args.prompt);
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let (ack_tx, _ack_rx) = tokio::sync::oneshot::channel();
    let req = AdmitRequest {
        id: 1,
        prompt_ids,
        sampler: SamplerParams::default(),
        adapter_id: ember_common::empty_adapter_id(),
        max_tokens: args.max_tokens,
        stop_token_ids: Default::default(),
        cancel: Arc::new(AtomicBool::new(false)),
        respond: tx,
        ack: ack_tx,
    };
    if let Err(e) = engine.admit_direct(req) {
        eprintln!("admission failed: {e}");
        return;
    }

    let mut out = String::new();
    loop {
        if let Err(e) = engine.step() {
            eprintln!("step failed: {e}");
            break;
        }
        let mut done = false;
        while let Ok(evt) = rx.try_recv() {
            match evt {
                StreamEvent::Token(t) => out.push_str(&t),
                StreamEvent::Finished(_) => done = true,
            }
        }
        if done {
            break;
        }
    }
    println!("{out}");
}

async fn adapters(args: AdaptersArgs) {
    let client = reqwest::Client::new();
    let body = match args.op {
        AdapterOp::Load { id, path } => {
            let text = match std::fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("failed to read {path}: {e}");
                    return;
                }
            };
            let mut payload: serde_json::Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("invalid adapter file {path}: {e}");
                    return;
                }
            };
            payload["op"] = serde_json::json!("load");
            payload["id"] = serde_json::json!(id);
            payload
        }
        AdapterOp::Remove { id } => serde_json::json!({"op": "remove", "id": id}),
        AdapterOp::Status { id } => serde_json::json!({"op": "status", "id": id}),
    };

    match client
        .post(format!("{}/v1/adapters", args.url))
        .json(&body)
        .send()
        .await
    {
        Ok(resp) => match resp.json::<serde_json::Value>().await {
            Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or_default()),
            Err(e) => eprintln!("invalid response: {e}"),
        },
        Err(e) => eprintln!("request failed: {e}"),
    }
}

fn stats() {
    use sysinfo::{CpuExt, System, SystemExt};
    let mut sys = System::new_all();
    sys.refresh_all();
    let total_mem = sys.total_memory();
    let used_mem = sys.used_memory();
    let cpu_avg: f32 = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / (sys.cpus().len() as f32);
    println!("CPU: {cpu_avg:.1}%");
    println!("Memory: {} / {} MiB", used_mem / 1024 / 1024, total_mem / 1024 / 1024);
    println!("see /metrics on a running `ember serve` for queue depth, batch size, and KV occupancy");
}
