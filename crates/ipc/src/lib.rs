// Path: crates/ipc/src/lib.rs
//! # Gantry IPC
//!
//! The protobuf wire contract: the gRPC control plane (registration,
//! control streams, inventory, relay, pairing, admin) and the data-plane
//! frame types carried either directly between workers or through the
//! controller relay.

// Re-export the generated Protobuf/Tonic code. Nested inside `v1` to
// match the proto package `gantry.v1`.
pub mod v1 {
    tonic::include_proto!("gantry.v1");
}

mod convert;

#[cfg(test)]
mod tests;
