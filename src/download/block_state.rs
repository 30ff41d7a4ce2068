use crate::download::errors::{BlockStateError, LeaseError};
use crate::download::hash_tree::HashTree;
use crate::download::interval::{Interval, IntervalSet};
use crate::download::selection::SelectionStrategy;
use crate::download::verifier::{ChunkVerifier, WriterJob};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};

pub type Result<T> = std::result::Result<T, BlockStateError>;

pub const DEFAULT_HOPELESS_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy)]
pub struct BlockOptions {
    /// Failed chunks are freed for re-download instead of kept on disk.
    pub discard_corrupt: bool,
    pub hopeless_ratio: f64,
    /// Lease alignment while no hash tree is known.
    pub default_block_size: u64,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            discard_corrupt: true,
            hopeless_ratio: DEFAULT_HOPELESS_RATIO,
            default_block_size: 16 * 1024,
        }
    }
}

/// The part of the ledger that survives a restart. Leased and pending
/// ranges describe in-flight work and are never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub verified: IntervalSet,
    #[serde(default)]
    pub partial: IntervalSet,
    #[serde(default)]
    pub corrupt: IntervalSet,
    #[serde(default)]
    pub lost_bytes: u64,
    #[serde(default)]
    pub hash_tree: Option<HashTree>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCounts {
    pub file_size: u64,
    pub free: u64,
    pub leased: u64,
    pub pending: u64,
    pub partial: u64,
    pub verified: u64,
    pub corrupt: u64,
    pub lost: u64,
}

/// Cloned view of every set, for tests and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockSets {
    pub leased: IntervalSet,
    pub pending: IntervalSet,
    pub partial: IntervalSet,
    pub verified: IntervalSet,
    pub corrupt: IntervalSet,
}

impl BlockSets {
    /// True when no byte sits in two sets.
    pub fn is_partitioned(&self) -> bool {
        let sets = [
            &self.leased,
            &self.pending,
            &self.partial,
            &self.verified,
            &self.corrupt,
        ];
        for (i, a) in sets.iter().enumerate() {
            for b in &sets[i + 1..] {
                if a.overlaps_set(b) {
                    return false;
                }
            }
        }
        true
    }
}

/// Byte-range bookkeeping for one file. Every byte is in at most one of
/// leased, pending, partial, verified or corrupt; anything else is free.
#[derive(Debug, Clone)]
pub struct BlockLedger {
    file_size: u64,
    leased: IntervalSet,
    pending: IntervalSet,
    partial: IntervalSet,
    verified: IntervalSet,
    corrupt: IntervalSet,
    /// Verified bytes accepted while no tree was known.
    unchecked: IntervalSet,
    lost_bytes: u64,
    tree: Option<Arc<HashTree>>,
    opts: BlockOptions,
    in_flight: usize,
    fault: Option<BlockStateError>,
}

impl BlockLedger {
    pub fn new(file_size: u64, opts: BlockOptions) -> Self {
        Self {
            file_size,
            leased: IntervalSet::new(),
            pending: IntervalSet::new(),
            partial: IntervalSet::new(),
            verified: IntervalSet::new(),
            corrupt: IntervalSet::new(),
            unchecked: IntervalSet::new(),
            lost_bytes: 0,
            tree: None,
            opts,
            in_flight: 0,
            fault: None,
        }
    }

    /// Rebuilds a ledger from a snapshot, clipping to the file and resolving
    /// overlaps in favour of verified, then corrupt, then partial.
    pub fn restore(file_size: u64, opts: BlockOptions, snap: BlockSnapshot) -> Self {
        let full = IntervalSet::full(file_size);
        let mut verified = snap.verified.intersect(&full);
        let mut corrupt = snap.corrupt.intersect(&full);
        corrupt.remove_all(&verified);
        let mut partial = snap.partial.intersect(&full);
        partial.remove_all(&verified);
        partial.remove_all(&corrupt);

        let tree = snap
            .hash_tree
            .filter(|t| t.file_size() == file_size)
            .map(Arc::new);
        let mut unchecked = IntervalSet::new();
        if tree.is_none() {
            verified.add_all(&partial);
            partial.clear();
            unchecked = verified.clone();
        }

        Self {
            file_size,
            verified,
            partial,
            corrupt,
            unchecked,
            lost_bytes: snap.lost_bytes,
            tree,
            ..Self::new(file_size, opts)
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn hash_tree(&self) -> Option<Arc<HashTree>> {
        self.tree.clone()
    }

    pub fn fault(&self) -> Option<&BlockStateError> {
        self.fault.as_ref()
    }

    pub fn record_fault(&mut self, err: BlockStateError) {
        if self.fault.is_none() {
            self.fault = Some(err);
        }
    }

    fn corrupt_is_leasable(&self) -> bool {
        self.opts.discard_corrupt && self.tree.is_some()
    }

    /// Lease alignment: the tree's chunk size when known.
    pub fn block_size(&self) -> u64 {
        self.tree
            .as_ref()
            .map_or(self.opts.default_block_size, |t| t.chunk_size())
    }

    pub fn free(&self) -> IntervalSet {
        let mut claimed = self.leased.clone();
        claimed.add_all(&self.pending);
        claimed.add_all(&self.partial);
        claimed.add_all(&self.verified);
        if !self.corrupt_is_leasable() {
            claimed.add_all(&self.corrupt);
        }
        claimed.invert(self.file_size)
    }

    pub fn lease_white(
        &mut self,
        candidates: Option<&IntervalSet>,
        max_len: u64,
        strategy: &dyn SelectionStrategy,
    ) -> std::result::Result<Interval, LeaseError> {
        if let Some(fault) = &self.fault {
            return Err(LeaseError::Block(fault.clone()));
        }
        let free = self.free();
        if free.is_empty() {
            return Err(LeaseError::NoSuchElement);
        }
        let pool = match candidates {
            Some(offered) => free.intersect(offered),
            None => free,
        };
        let Some(picked) = strategy.pick(&pool, self.block_size(), max_len) else {
            return Err(LeaseError::NoSuchRange);
        };
        if !pool.contains(&picked) {
            return Err(LeaseError::Block(BlockStateError::Violation {
                op: "lease",
                interval: picked,
                expected: "free",
            }));
        }
        self.corrupt.remove(picked);
        self.leased.add(picked);
        Ok(picked)
    }

    pub fn release(&mut self, interval: Interval) -> Result<()> {
        if !self.leased.contains(&interval) {
            return Err(BlockStateError::NotLeased(interval));
        }
        self.leased.remove(interval);
        Ok(())
    }

    /// leased -> pending.
    pub fn begin_write(&mut self, interval: Interval, len: usize) -> Result<()> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        if interval.len() != len as u64 {
            return Err(BlockStateError::LengthMismatch {
                interval,
                actual: len,
            });
        }
        if !self.leased.contains(&interval) {
            return Err(BlockStateError::Violation {
                op: "write",
                interval,
                expected: "leased",
            });
        }
        self.leased.remove(interval);
        self.pending.add(interval);
        self.in_flight += 1;
        Ok(())
    }

    /// Undoes `begin_write` for a write that never reached the disk. The
    /// bytes go back to free and the ledger faults, since nothing can be
    /// written any more.
    pub fn abort_write(&mut self, interval: Interval, err: BlockStateError) {
        self.pending.remove(interval);
        self.in_flight = self.in_flight.saturating_sub(1);
        self.record_fault(err);
    }

    /// pending -> partial (or straight to verified without a tree). Returns
    /// the chunks the write completed.
    pub fn finish_write(&mut self, interval: Interval) -> Result<Vec<Interval>> {
        if !self.pending.contains(&interval) {
            return Err(BlockStateError::Violation {
                op: "finish_write",
                interval,
                expected: "pending",
            });
        }
        self.pending.remove(interval);
        match self.tree.clone() {
            Some(tree) => {
                self.partial.add(interval);
                Ok(self.ready_chunks_touching(&tree, &interval))
            }
            None => {
                self.verified.add(interval);
                self.unchecked.add(interval);
                Ok(Vec::new())
            }
        }
    }

    fn ready_chunks_touching(&self, tree: &HashTree, interval: &Interval) -> Vec<Interval> {
        tree.chunks_touching(interval)
            .filter_map(|idx| tree.chunk_bounds(idx))
            .filter(|bounds| self.partial.contains(bounds))
            .collect()
    }

    /// Every chunk currently fully inside partial.
    pub fn ready_chunks(&self) -> Vec<Interval> {
        let Some(tree) = &self.tree else {
            return Vec::new();
        };
        self.partial
            .iter()
            .flat_map(|run| tree.chunks_within(run))
            .map(|(_, bounds)| bounds)
            .collect()
    }

    /// partial -> verified or corrupt. Returns false when the chunk was no
    /// longer wholly partial.
    pub fn apply_verification(&mut self, chunk: Interval, ok: bool) -> bool {
        if !self.partial.contains(&chunk) {
            return false;
        }
        self.partial.remove(chunk);
        if ok {
            self.verified.add(chunk);
        } else {
            self.corrupt.add(chunk);
            self.lost_bytes = self.lost_bytes.saturating_add(chunk.len());
        }
        true
    }

    /// Installs the first tree offered. Bytes accepted without one go back
    /// to partial; returns true when a verification pass is needed.
    pub fn set_hash_tree(&mut self, tree: HashTree) -> Result<bool> {
        if tree.file_size() != self.file_size {
            return Err(BlockStateError::TreeSizeMismatch {
                expected: self.file_size,
                actual: tree.file_size(),
            });
        }
        if self.tree.is_some() {
            return Ok(false);
        }
        self.tree = Some(Arc::new(tree));
        let moved = std::mem::take(&mut self.unchecked);
        self.verified.remove_all(&moved);
        self.partial.add_all(&moved);
        Ok(!self.partial.is_empty())
    }

    pub fn note_job_queued(&mut self) {
        self.in_flight += 1;
    }

    pub fn note_job_done(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// No writes or verification passes outstanding.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight == 0
    }

    pub fn is_complete(&self) -> bool {
        let counted = if self.corrupt_is_leasable() {
            0
        } else {
            self.corrupt.size()
        };
        self.verified.size() + counted == self.file_size
    }

    pub fn is_hopeless(&self) -> bool {
        self.file_size > 0
            && self.lost_bytes as f64 >= self.opts.hopeless_ratio * self.file_size as f64
    }

    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes
    }

    pub fn counts(&self) -> BlockCounts {
        BlockCounts {
            file_size: self.file_size,
            free: self.free().size(),
            leased: self.leased.size(),
            pending: self.pending.size(),
            partial: self.partial.size(),
            verified: self.verified.size(),
            corrupt: self.corrupt.size(),
            lost: self.lost_bytes,
        }
    }

    pub fn sets(&self) -> BlockSets {
        BlockSets {
            leased: self.leased.clone(),
            pending: self.pending.clone(),
            partial: self.partial.clone(),
            verified: self.verified.clone(),
            corrupt: self.corrupt.clone(),
        }
    }

    pub fn snapshot(&self) -> BlockSnapshot {
        BlockSnapshot {
            verified: self.verified.clone(),
            partial: self.partial.clone(),
            corrupt: self.corrupt.clone(),
            lost_bytes: self.lost_bytes,
            hash_tree: self.tree.as_deref().cloned(),
        }
    }

    /// Forgets all downloaded data. Only valid with nothing leased or
    /// pending.
    pub fn reset(&mut self) -> Result<()> {
        if let Some(iv) = self.leased.first().or(self.pending.first()) {
            return Err(BlockStateError::Violation {
                op: "reset",
                interval: iv,
                expected: "idle",
            });
        }
        self.partial.clear();
        self.verified.clear();
        self.corrupt.clear();
        self.unchecked.clear();
        self.lost_bytes = 0;
        self.fault = None;
        Ok(())
    }
}

pub(crate) struct Shared {
    ledger: Mutex<BlockLedger>,
    changed: watch::Sender<u64>,
    tree_requested: AtomicBool,
    path: PathBuf,
    strategy: Arc<dyn SelectionStrategy>,
}

impl Shared {
    pub(crate) fn ledger(&self) -> MutexGuard<'_, BlockLedger> {
        match self.ledger.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("block ledger lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }

    pub(crate) fn notify(&self) {
        self.changed.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Shared handle on one file's ledger plus its single disk writer task.
/// All set transitions happen under one lock; disk writes and chunk
/// verification run on the writer task.
#[derive(Clone)]
pub struct BlockState {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<WriterJob>,
}

impl BlockState {
    pub async fn open(
        path: impl Into<PathBuf>,
        file_size: u64,
        opts: BlockOptions,
        strategy: Arc<dyn SelectionStrategy>,
        snapshot: Option<BlockSnapshot>,
    ) -> Result<Self> {
        let path = path.into();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|source| BlockStateError::disk("open", &path, source))?;
        file.set_len(file_size)
            .await
            .map_err(|source| BlockStateError::disk("set_len", &path, source))?;

        let ledger = match snapshot {
            Some(snap) => BlockLedger::restore(file_size, opts, snap),
            None => BlockLedger::new(file_size, opts),
        };
        let needs_pass = !ledger.ready_chunks().is_empty();
        let (changed, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            ledger: Mutex::new(ledger),
            changed,
            tree_requested: AtomicBool::new(false),
            path,
            strategy,
        });
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(ChunkVerifier::new(shared.clone(), file).run(rx));

        let state = Self { shared, jobs };
        if needs_pass {
            state.enqueue(WriterJob::Reverify)?;
        }
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        self.shared.path()
    }

    fn enqueue(&self, job: WriterJob) -> Result<()> {
        self.shared.ledger().note_job_queued();
        if self.jobs.send(job).is_err() {
            self.shared.ledger().note_job_done();
            return Err(BlockStateError::Closed);
        }
        Ok(())
    }

    fn fail_fast(&self, ledger: &mut BlockLedger, err: &BlockStateError) {
        if err.is_fatal() {
            tracing::error!(path = %self.path().display(), error = %err, "block state fault");
            ledger.record_fault(err.clone());
        }
    }

    pub fn lease_white(
        &self,
        candidates: Option<&IntervalSet>,
        max_len: u64,
    ) -> std::result::Result<Interval, LeaseError> {
        let res = {
            let mut ledger = self.shared.ledger();
            let res = ledger.lease_white(candidates, max_len, self.shared.strategy.as_ref());
            if let Err(LeaseError::Block(err)) = &res {
                self.fail_fast(&mut ledger, err);
            }
            res
        };
        self.shared.notify();
        res
    }

    pub fn release(&self, interval: Interval) -> Result<()> {
        let res = self.shared.ledger().release(interval);
        if res.is_ok() {
            self.shared.notify();
        }
        res
    }

    /// Moves `interval` from leased to pending and queues the disk write.
    /// Never waits on the disk.
    pub fn write(&self, interval: Interval, data: Vec<u8>) -> Result<()> {
        {
            let mut ledger = self.shared.ledger();
            if let Err(err) = ledger.begin_write(interval, data.len()) {
                self.fail_fast(&mut ledger, &err);
                drop(ledger);
                self.shared.notify();
                return Err(err);
            }
        }
        self.shared.notify();
        if self.jobs.send(WriterJob::Write { interval, data }).is_err() {
            tracing::error!(path = %self.path().display(), range = %interval, "block writer gone");
            self.shared
                .ledger()
                .abort_write(interval, BlockStateError::Closed);
            self.shared.notify();
            return Err(BlockStateError::Closed);
        }
        Ok(())
    }

    /// Waits until the file is complete, the ledger faulted, or no write or
    /// verification is outstanding.
    pub async fn wait_for_outstanding_writes(&self) {
        let mut rx = self.shared.changed.subscribe();
        loop {
            {
                let ledger = self.shared.ledger();
                if ledger.is_complete() || ledger.fault().is_some() || ledger.is_idle() {
                    return;
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Flushes file data to stable storage after all queued writes.
    pub async fn sync(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(WriterJob::Sync { reply })?;
        rx.await.map_err(|_| BlockStateError::Closed)?
    }

    /// Drops every downloaded byte and zeroes the file.
    pub async fn wipe(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(WriterJob::Wipe { reply })?;
        rx.await.map_err(|_| BlockStateError::Closed)?
    }

    pub fn set_hash_tree(&self, tree: HashTree) -> Result<bool> {
        let pass = self.shared.ledger().set_hash_tree(tree)?;
        if pass {
            tracing::info!(path = %self.path().display(), "hash tree arrived late; verifying written data");
            self.enqueue(WriterJob::Reverify)?;
        }
        self.shared.notify();
        Ok(pass)
    }

    pub fn hash_tree(&self) -> Option<Arc<HashTree>> {
        self.shared.ledger().hash_tree()
    }

    pub fn chunk_size(&self) -> Option<u64> {
        self.hash_tree().map(|t| t.chunk_size())
    }

    /// Single-flight guard: true for exactly one caller until released or a
    /// tree is installed.
    pub fn try_claim_tree_request(&self) -> bool {
        if self.hash_tree().is_some() {
            return false;
        }
        !self.shared.tree_requested.swap(true, Ordering::AcqRel)
    }

    /// Lets another worker try after a failed tree request.
    pub fn release_tree_request(&self) {
        self.shared.tree_requested.store(false, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.shared.ledger().is_complete()
    }

    pub fn is_hopeless(&self) -> bool {
        self.shared.ledger().is_hopeless()
    }

    pub fn fault(&self) -> Option<BlockStateError> {
        self.shared.ledger().fault().cloned()
    }

    pub fn file_size(&self) -> u64 {
        self.shared.ledger().file_size()
    }

    pub fn free(&self) -> IntervalSet {
        self.shared.ledger().free()
    }

    pub fn has_free_within(&self, offered: Option<&IntervalSet>) -> bool {
        let free = self.free();
        match offered {
            Some(ranges) => !free.intersect(ranges).is_empty(),
            None => !free.is_empty(),
        }
    }

    pub fn counts(&self) -> BlockCounts {
        self.shared.ledger().counts()
    }

    pub fn sets(&self) -> BlockSets {
        self.shared.ledger().sets()
    }

    pub fn snapshot(&self) -> BlockSnapshot {
        self.shared.ledger().snapshot()
    }

    /// Bumped on every ledger transition.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.changed.subscribe()
    }
}
