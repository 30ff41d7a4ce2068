use crate::download::hash_tree::ContentHash;
use crate::download::source::{RemoteSource, SourceKey};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Result of offering a candidate to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Already known (pooled or in use); soft fields were merged.
    Duplicate,
    /// Content hash or size contradicts the session's file.
    Conflict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub eligible: usize,
    pub busy: usize,
    pub in_use: usize,
}

impl PoolCounts {
    pub fn known(&self) -> usize {
        self.eligible + self.busy + self.in_use
    }
}

/// Orders the pool of candidate sources. Implementations are shared between
/// the session loop and gossip delivery, so every method takes `&self`.
pub trait SourceRanker: Send + Sync {
    fn add_to_pool(&self, source: RemoteSource) -> AddOutcome;

    /// Takes the eligible source most likely to succeed fast, marking it in
    /// use until it is returned or forgotten.
    fn get_best(&self, now: Instant) -> Option<RemoteSource>;

    /// Puts an in-use source back, with whatever retry stamp it now carries.
    fn return_source(&self, source: RemoteSource);

    /// Drops an in-use or pooled source for good.
    fn forget(&self, key: &SourceKey);

    fn has_eligible(&self, now: Instant) -> bool;

    /// Earliest moment a busy source becomes eligible again.
    fn next_retry(&self, now: Instant) -> Option<Instant>;

    fn counts(&self, now: Instant) -> PoolCounts;

    /// Pooled and in-use sources, for persistence.
    fn snapshot(&self) -> Vec<RemoteSource>;
}

#[derive(Debug, Default)]
struct Pool {
    hash: Option<ContentHash>,
    sources: HashMap<SourceKey, RemoteSource>,
    in_use: HashMap<SourceKey, RemoteSource>,
    forgotten: HashSet<SourceKey>,
}

/// Ranking by expected time to first byte: multicast replies first, then
/// better remote queue positions, then directly reachable hosts before
/// firewall-to-firewall pushes before blind pushes. Partial sources last.
#[derive(Debug)]
pub struct DefaultRanker {
    file_size: u64,
    pool: Mutex<Pool>,
}

type Score = (bool, i64, u8, bool, u32, i64, u32);

fn score(s: &RemoteSource) -> Score {
    let reach = if !s.needs_push {
        2
    } else if s.firewall_capable {
        1
    } else {
        0
    };
    (
        s.from_multicast,
        -(s.stats.queue_position.unwrap_or(0) as i64),
        reach,
        !s.is_partial(),
        s.stats.successes,
        -(s.stats.consecutive_failures as i64),
        s.speed_hint,
    )
}

impl DefaultRanker {
    pub fn new(file_size: u64, hash: Option<ContentHash>) -> Self {
        Self {
            file_size,
            pool: Mutex::new(Pool {
                hash,
                ..Pool::default()
            }),
        }
    }

    fn pool(&self) -> MutexGuard<'_, Pool> {
        match self.pool.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn conflicts(&self, pool: &Pool, source: &RemoteSource) -> bool {
        if source.file_size != self.file_size {
            return true;
        }
        matches!((pool.hash, source.content_hash), (Some(a), Some(b)) if a != b)
    }
}

impl SourceRanker for DefaultRanker {
    fn add_to_pool(&self, mut source: RemoteSource) -> AddOutcome {
        let mut pool = self.pool();
        if self.conflicts(&pool, &source) {
            tracing::debug!(source = %source.address(), "rejecting source with conflicting content");
            return AddOutcome::Conflict;
        }
        if source.content_hash.is_none() {
            source.content_hash = pool.hash;
        }
        let key = source.key();
        if let Some(existing) = pool.sources.get_mut(&key) {
            existing.from_multicast |= source.from_multicast;
            existing.speed_hint = existing.speed_hint.max(source.speed_hint);
            return AddOutcome::Duplicate;
        }
        if pool.in_use.contains_key(&key) {
            return AddOutcome::Duplicate;
        }
        // A source dropped earlier may come back through a fresh search.
        pool.forgotten.remove(&key);
        pool.sources.insert(key, source);
        AddOutcome::Added
    }

    fn get_best(&self, now: Instant) -> Option<RemoteSource> {
        let mut pool = self.pool();
        let key = pool
            .sources
            .iter()
            .filter(|(_, s)| !s.is_busy(now))
            .max_by(|(ka, a), (kb, b)| score(a).cmp(&score(b)).then_with(|| kb.cmp(ka)))
            .map(|(k, _)| k.clone())?;
        let mut source = pool.sources.remove(&key)?;
        source.stats.last_attempt = Some(now);
        pool.in_use.insert(key, source.clone());
        Some(source)
    }

    fn return_source(&self, source: RemoteSource) {
        let mut pool = self.pool();
        let key = source.key();
        if pool.in_use.remove(&key).is_none() && pool.forgotten.contains(&key) {
            return;
        }
        if self.conflicts(&pool, &source) {
            return;
        }
        pool.sources.insert(key, source);
    }

    fn forget(&self, key: &SourceKey) {
        let mut pool = self.pool();
        pool.in_use.remove(key);
        pool.sources.remove(key);
        pool.forgotten.insert(key.clone());
    }

    fn has_eligible(&self, now: Instant) -> bool {
        self.pool().sources.values().any(|s| !s.is_busy(now))
    }

    fn next_retry(&self, now: Instant) -> Option<Instant> {
        self.pool()
            .sources
            .values()
            .filter_map(|s| s.stats.retry_after.filter(|t| *t > now))
            .min()
    }

    fn counts(&self, now: Instant) -> PoolCounts {
        let pool = self.pool();
        let busy = pool.sources.values().filter(|s| s.is_busy(now)).count();
        PoolCounts {
            eligible: pool.sources.len() - busy,
            busy,
            in_use: pool.in_use.len(),
        }
    }

    fn snapshot(&self) -> Vec<RemoteSource> {
        let pool = self.pool();
        let mut all: Vec<RemoteSource> = pool
            .sources
            .values()
            .chain(pool.in_use.values())
            .cloned()
            .collect();
        all.sort_by_key(RemoteSource::key);
        all
    }
}
