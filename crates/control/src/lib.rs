#![forbid(unsafe_code)]

//! # Hive Control
//!
//! The control plane: the REST surface for agents, versions, deployments,
//! nodes, and runs; the gRPC lease service that streams assignments to
//! worker nodes and receives Ack/Complete/Fail; the dispatch tick that turns
//! pending runs into leases via the placement scheduler; and the liveness
//! reaper that reclaims work from unreachable nodes.

/// The dispatch tick: pending runs → leases → streamed grants.
pub mod dispatch;
/// The run state-transition event bus.
pub mod events;
/// The heartbeat-based liveness reaper.
pub mod liveness;
/// The REST API surface.
pub mod rest;
/// The gRPC lease service and the puller registry.
pub mod service;
/// Shared control-plane state.
pub mod state;
