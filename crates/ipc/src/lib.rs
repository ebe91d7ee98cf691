//! # Hive IPC
//!
//! The gRPC contract between the control plane and worker nodes: a
//! server-streaming `Pull` that delivers lease grants, and unary
//! `Ack`/`Complete`/`Fail` reports. Generated from `proto/lease.proto`.

// Re-export the generated Protobuf/Tonic code. Nested inside `v1` to match
// the proto package hierarchy `hive.lease.v1`.
pub mod lease {
    pub mod v1 {
        tonic::include_proto!("hive.lease.v1");
    }
    // Flatten the API for users.
    pub use v1::*;
}
