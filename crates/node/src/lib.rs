#![forbid(unsafe_code)]

//! # Hive Node
//!
//! The deployable binaries: `control-plane` (REST + gRPC lease service +
//! dispatch + liveness), `worker` (one node of the fleet), and `agent-exec`
//! (the per-run sandbox child). Shared startup plumbing lives here.

use hive_control::dispatch::Dispatcher;
use hive_control::liveness::Reaper;
use hive_control::rest;
use hive_control::service::LeaseServiceImpl;
use hive_control::state::{AppState, SharedState};
use hive_ipc::lease::lease_service_server::LeaseServiceServer;
use hive_storage::{MemoryStore, RedbStore, Store};
use hive_types::config::{ControlPlaneConfig, StorageBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Opens the configured storage backend.
pub fn open_store(config: &ControlPlaneConfig) -> anyhow::Result<Arc<dyn Store>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!(target: "control-plane", "using the volatile in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Redb => {
            let path = config
                .storage
                .path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("storage.path is required for redb"))?;
            Ok(Arc::new(RedbStore::open(path)?))
        }
    }
}

/// Everything `control-plane` serves, bound and running. Returned to the
/// binary (and to tests) so both can drive the same assembly.
pub struct ControlPlaneHandle {
    /// The shared state, for inspection.
    pub state: SharedState,
    /// Bound REST address.
    pub rest_addr: std::net::SocketAddr,
    /// Bound gRPC address.
    pub grpc_addr: std::net::SocketAddr,
}

/// Binds and spawns the REST server, the gRPC lease service, the dispatch
/// loop, the liveness reaper, and the lease sweeper.
pub async fn start_control_plane(
    config: &ControlPlaneConfig,
    store: Arc<dyn Store>,
    cancel: CancellationToken,
) -> anyhow::Result<ControlPlaneHandle> {
    let state = AppState::new(store, config.dispatch.clone(), config.liveness.clone());

    let rest_listener = tokio::net::TcpListener::bind(&config.listen.rest_addr).await?;
    let rest_addr = rest_listener.local_addr()?;
    let rest_router = rest::router(Arc::clone(&state));
    let rest_cancel = cancel.clone();
    tokio::spawn(async move {
        let shutdown = async move { rest_cancel.cancelled().await };
        if let Err(e) = axum::serve(rest_listener, rest_router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(target: "control-plane", error = %e, "REST server failed");
        }
    });

    let grpc_listener = tokio::net::TcpListener::bind(&config.listen.grpc_addr).await?;
    let grpc_addr = grpc_listener.local_addr()?;
    let grpc_service = LeaseServiceServer::new(LeaseServiceImpl::new(Arc::clone(&state)));
    let grpc_cancel = cancel.clone();
    tokio::spawn(async move {
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(grpc_listener);
        let shutdown = async move { grpc_cancel.cancelled().await };
        if let Err(e) = tonic::transport::Server::builder()
            .add_service(grpc_service)
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await
        {
            tracing::error!(target: "control-plane", error = %e, "gRPC server failed");
        }
    });

    let dispatcher = Dispatcher::new(Arc::clone(&state));
    let dispatch_cancel = cancel.clone();
    tokio::spawn(async move { dispatcher.run(dispatch_cancel).await });

    let reaper = Reaper::new(Arc::clone(&state));
    let reap_cancel = cancel.clone();
    tokio::spawn(async move { reaper.run(reap_cancel).await });

    let _sweeper = state
        .leases
        .spawn_sweeper(Duration::from_secs(5), cancel.clone());

    tracing::info!(
        target: "control-plane",
        rest = %rest_addr,
        grpc = %grpc_addr,
        "control plane listening"
    );
    Ok(ControlPlaneHandle { state, rest_addr, grpc_addr })
}
