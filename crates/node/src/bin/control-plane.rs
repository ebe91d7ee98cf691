#![forbid(unsafe_code)]

//! The control-plane binary.

use anyhow::{anyhow, Result};
use clap::Parser;
use hive_node::{open_store, start_control_plane};
use hive_types::config::ControlPlaneConfig;
use std::fs;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
struct ControlPlaneOpts {
    #[clap(long, help = "Path to the control-plane.toml configuration file.")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    hive_telemetry::init::init_tracing()?;
    let metrics_sink = hive_telemetry::prometheus::install()?;
    hive_telemetry::sinks::SINK
        .set(metrics_sink)
        .map_err(|_| anyhow!("SINK must be set only once"))?;

    std::panic::set_hook(Box::new(|info| {
        eprintln!("CONTROL_PLANE_PANIC: {}", info);
    }));

    let opts = ControlPlaneOpts::parse();
    let config: ControlPlaneConfig = match &opts.config {
        Some(path) => toml::from_str(&fs::read_to_string(path)?)?,
        None => ControlPlaneConfig::default(),
    };
    config.validate().map_err(|e| anyhow!(e))?;
    tracing::info!(target: "control-plane", event = "startup", config = ?opts.config);

    let telemetry_addr = config.listen.telemetry_addr.parse()?;
    tokio::spawn(hive_telemetry::http::run_server(telemetry_addr));

    let store = open_store(&config)?;
    let cancel = CancellationToken::new();
    let handle = start_control_plane(&config, store, cancel.clone()).await?;
    eprintln!("CONTROL_PLANE_STARTUP_COMPLETE");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target: "control-plane", event = "shutdown", reason = "ctrl-c");
        }
    }

    cancel.cancel();
    drop(handle);
    tracing::info!(target: "control-plane", event = "shutdown", reason = "complete");
    Ok(())
}
