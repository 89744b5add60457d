// Path: crates/worker/src/lib.rs
//! The Gantry worker agent.
//!
//! Registers with the controller, holds the control stream, serves the
//! mutual-TLS data listener, and executes migrations in either role:
//! as SOURCE it opens a data channel (direct or relayed) and drives the
//! transfer engine; as TARGET it authorizes the incoming source and
//! consumes chunk streams into the resource store.

pub mod channel;
pub mod connector;
pub mod data_server;
pub mod executor;
pub mod frames;
pub mod host;
pub mod receiver;
pub mod server;
pub mod store;

pub use connector::Connector;
pub use executor::Executor;
pub use server::run_worker;
pub use store::{FsResourceStore, ResourceStore};
