use crate::download::interval::{Interval, IntervalSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    Sequential,
    BiasedRandom,
}

/// Picks which free bytes a worker leases next.
pub trait SelectionStrategy: Send + Sync + std::fmt::Debug {
    /// Chooses an interval inside `candidates` of at most `max_len` bytes.
    /// Returned intervals end on a `block_size` boundary unless they reach the
    /// end of a candidate run.
    fn pick(&self, candidates: &IntervalSet, block_size: u64, max_len: u64) -> Option<Interval>;
}

pub fn strategy_for(policy: SelectionPolicy) -> Arc<dyn SelectionStrategy> {
    match policy {
        SelectionPolicy::Sequential => Arc::new(Sequential),
        SelectionPolicy::BiasedRandom => Arc::new(BiasedRandom::default()),
    }
}

/// Takes up to `max_len` bytes from `start`, trimming the end back to a block
/// boundary when that keeps at least one byte.
fn take_aligned(run: Interval, start: u64, block_size: u64, max_len: u64) -> Interval {
    let max_len = max_len.max(1);
    let limit = start.saturating_add(max_len - 1);
    if limit >= run.high {
        return Interval::new(start, run.high);
    }
    if block_size > 0 {
        let aligned_excl = (limit + 1) / block_size * block_size;
        if aligned_excl > start {
            return Interval::new(start, aligned_excl - 1);
        }
    }
    Interval::new(start, limit)
}

/// Lowest free offset first.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl SelectionStrategy for Sequential {
    fn pick(&self, candidates: &IntervalSet, block_size: u64, max_len: u64) -> Option<Interval> {
        let run = candidates.first()?;
        Some(take_aligned(run, run.low, block_size, max_len))
    }
}

/// Sequential for the leading bytes (so the head of the file is usable
/// early), random block starts afterwards to spread sources across the file.
#[derive(Debug, Clone, Copy)]
pub struct BiasedRandom {
    /// Out of 100: chance to take the lowest free block.
    pub sequential_percent: u64,
}

impl Default for BiasedRandom {
    fn default() -> Self {
        Self {
            sequential_percent: 50,
        }
    }
}

fn random_u64() -> Option<u64> {
    let mut b = [0u8; 8];
    getrandom::getrandom(&mut b).ok()?;
    Some(u64::from_le_bytes(b))
}

impl SelectionStrategy for BiasedRandom {
    fn pick(&self, candidates: &IntervalSet, block_size: u64, max_len: u64) -> Option<Interval> {
        let first = candidates.first()?;
        let Some(roll) = random_u64() else {
            tracing::debug!("no randomness available; falling back to sequential selection");
            return Some(take_aligned(first, first.low, block_size, max_len));
        };
        if roll % 100 < self.sequential_percent {
            return Some(take_aligned(first, first.low, block_size, max_len));
        }

        let total = candidates.size();
        let mut target = (roll >> 8) % total;
        for run in candidates.iter() {
            if target >= run.len() {
                target -= run.len();
                continue;
            }
            let offset = run.low + target;
            let start = if block_size > 0 {
                (offset / block_size * block_size).max(run.low)
            } else {
                offset
            };
            return Some(take_aligned(*run, start, block_size, max_len));
        }
        Some(take_aligned(first, first.low, block_size, max_len))
    }
}
