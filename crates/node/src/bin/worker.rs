#![forbid(unsafe_code)]

//! The worker-node binary.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use hive_types::config::WorkerConfig;
use hive_worker::connector::MemoryQueue;
use hive_worker::runtime::NodeRuntime;
use std::fs;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
struct WorkerOpts {
    #[clap(long, help = "Path to the worker.toml configuration file.")]
    config: PathBuf,
    #[clap(
        long,
        help = "Seed the in-memory broker from a JSON-lines file (one message body per line). Development only."
    )]
    seed_messages: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    hive_telemetry::init::init_tracing()?;
    let metrics_sink = hive_telemetry::prometheus::install()?;
    hive_telemetry::sinks::SINK
        .set(metrics_sink)
        .map_err(|_| anyhow!("SINK must be set only once"))?;

    std::panic::set_hook(Box::new(|info| {
        eprintln!("WORKER_PANIC: {}", info);
    }));

    let opts = WorkerOpts::parse();
    let config: WorkerConfig = toml::from_str(&fs::read_to_string(&opts.config)?)?;
    config.validate().map_err(|e| anyhow!(e))?;
    tracing::info!(
        target: "worker",
        event = "startup",
        node_id = %config.node_runtime.node_id,
        config = ?opts.config
    );

    let telemetry_addr = config.telemetry_addr.parse()?;
    tokio::spawn(hive_telemetry::http::run_server(telemetry_addr));

    // The concrete broker client is deployment-specific; the in-process
    // broker keeps the worker runnable end-to-end without one.
    let queue = MemoryQueue::new();
    if let Some(path) = &opts.seed_messages {
        let mut seeded = 0usize;
        for line in fs::read_to_string(path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let body: serde_json::Value =
                serde_json::from_str(line).with_context(|| format!("bad seed line: {line}"))?;
            queue.enqueue(body);
            seeded += 1;
        }
        tracing::info!(target: "worker", seeded, "seeded in-memory broker");
    }

    let runtime = NodeRuntime::new(config, queue)?;
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "worker", event = "shutdown", reason = "ctrl-c");
            shutdown.cancel();
        }
    });

    eprintln!("WORKER_STARTUP_COMPLETE");
    runtime.run(cancel).await?;
    Ok(())
}
