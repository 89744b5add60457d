// Path: crates/transfer/src/sizer.rs
//! Dynamic chunk sizing.
//!
//! The size is re-evaluated after every ten checkpoints: a window where
//! every checkpoint arrived within two seconds of its predecessor
//! doubles the chunk size (capped at 4 MiB); any slower window halves it
//! (floored at 256 KiB). The adjustment is advisory to the sender only —
//! receivers accept any size within the bounds.

use crate::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use std::time::{Duration, Instant};

/// Checkpoints per adjustment window.
const WINDOW: usize = 10;
/// A gap under this is a "fast" arrival.
const FAST_GAP: Duration = Duration::from_secs(2);

/// Tracks checkpoint arrival gaps and adjusts the chunk size.
#[derive(Debug)]
pub struct ChunkSizer {
    current: usize,
    gaps: Vec<Duration>,
    last_checkpoint: Instant,
}

impl ChunkSizer {
    /// Starts at `initial`, clamped into the legal bounds.
    pub fn new(initial: usize, now: Instant) -> Self {
        Self {
            current: initial.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
            gaps: Vec::with_capacity(WINDOW),
            last_checkpoint: now,
        }
    }

    /// The chunk size the sender should use next.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Records a checkpoint arrival; every tenth closes the window and
    /// applies the adjustment.
    pub fn record_checkpoint(&mut self, at: Instant) {
        self.gaps
            .push(at.saturating_duration_since(self.last_checkpoint));
        self.last_checkpoint = at;

        if self.gaps.len() < WINDOW {
            return;
        }
        let all_fast = self.gaps.iter().all(|gap| *gap < FAST_GAP);
        self.gaps.clear();

        if all_fast {
            self.current = (self.current * 2).min(MAX_CHUNK_SIZE);
        } else if self.current > MIN_CHUNK_SIZE {
            self.current = (self.current / 2).max(MIN_CHUNK_SIZE);
        }
    }
}
