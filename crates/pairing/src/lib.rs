// Path: crates/pairing/src/lib.rs
//! Trust bootstrap over a short human-transcribed code.
//!
//! One host generates a 6-character code and shows it to the operator;
//! the operator types it into the other host, which dials back with an
//! ephemeral X25519 public key bound to the code by a SHA-256 verifier.
//! After mutual verification both hosts derive a session key and promote
//! each other's certificate into their trust stores. Codes are
//! single-use and expire after five minutes; sources that hammer the
//! exchange endpoint are banned temporarily.

pub mod rate_limit;
pub mod service;
pub mod session;

pub use service::PairingService;
pub use session::{PairingManager, PairingOutcome, RedeemSession};

/// Pairing code lifetime.
pub const CODE_TTL_SECS: u64 = 300;
