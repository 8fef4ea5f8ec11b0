//! Monotonic id generator.

use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out increasing ids starting at 1. Ids are never reused.
#[derive(Debug)]
pub struct SequenceId {
    next: AtomicU64,
}

impl SequenceId {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Take the next id.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceId {
    fn default() -> Self {
        Self::new()
    }
}
