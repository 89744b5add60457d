// Path: crates/telemetry/src/lib.rs
//! Structured logging bootstrap for the Gantry binaries.

mod init;

pub use init::init_tracing;
