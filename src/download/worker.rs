use crate::download::block_state::BlockState;
use crate::download::errors::LeaseError;
use crate::download::hash_tree::ContentHash;
use crate::download::interval::{Interval, IntervalSet};
use crate::download::mesh::{AltLocations, MeshFeedback, sources_from_alts};
use crate::download::negotiator::{ConnectionNegotiator, NegotiatorOptions};
use crate::download::outcome::{ConnectionOutcome, NegotiationError, StreamError};
use crate::download::progress::TransferProgress;
use crate::download::push::{PushClass, PushRegistry, PushSender};
use crate::download::ranker::SourceRanker;
use crate::download::rate_limit::{ConnectionClass, RateLimiters};
use crate::download::session::{SessionConfig, SessionEvent};
use crate::download::source::RemoteSource;
use crate::download::types::WorkerId;
use crate::net::Connector;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

/// What the session does with a worker's source once the worker exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing left to fetch from it right now.
    Idle,
    /// Eligible again after the delay.
    RetryAfter(Duration),
    /// Dropped for good.
    Forget,
    /// Stopped from outside: pause, stop, or a queue replacement.
    Cancelled,
}

#[derive(Debug)]
pub struct WorkerReport {
    pub id: WorkerId,
    pub source: RemoteSource,
    pub disposition: Disposition,
    pub written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Connecting,
    Queued(u32),
    Downloading,
}

struct WorkerEntry {
    address: String,
    progress: Arc<TransferProgress>,
    phase: WorkerPhase,
    cancel: CancellationToken,
}

/// Counts by phase, for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCounts {
    pub connecting: usize,
    pub queued: usize,
    pub downloading: usize,
}

impl WorkerCounts {
    pub fn total(&self) -> usize {
        self.connecting + self.queued + self.downloading
    }

    /// Workers that are not parked in a remote queue.
    pub fn active(&self) -> usize {
        self.connecting + self.downloading
    }
}

/// Range a thief will ask for, and whose window it comes from.
pub(crate) struct StealPlan {
    victim: WorkerId,
    progress: Arc<TransferProgress>,
    range: Interval,
}

/// Everything the workers of one session share.
pub struct SwarmContext {
    pub(crate) blocks: BlockState,
    pub(crate) ranker: Arc<dyn SourceRanker>,
    pub(crate) mesh: Arc<dyn MeshFeedback>,
    pub(crate) alts: AltLocations,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) push: PushRegistry,
    pub(crate) push_sender: Arc<dyn PushSender>,
    pub(crate) limiters: RateLimiters,
    pub(crate) slots: Arc<Semaphore>,
    pub(crate) config: SessionConfig,
    pub(crate) file_name: String,
    pub(crate) content_hash: Option<ContentHash>,
    pub(crate) events: broadcast::Sender<SessionEvent>,
    /// Woken whenever a worker changes phase or a new source arrives.
    pub(crate) changed: Notify,
    steal_lock: tokio::sync::Mutex<()>,
    workers: Mutex<HashMap<WorkerId, WorkerEntry>>,
    next_worker: AtomicU64,
}

pub(crate) struct ContextParts {
    pub blocks: BlockState,
    pub ranker: Arc<dyn SourceRanker>,
    pub mesh: Arc<dyn MeshFeedback>,
    pub connector: Arc<dyn Connector>,
    pub push: PushRegistry,
    pub push_sender: Arc<dyn PushSender>,
    pub limiters: RateLimiters,
    pub slots: Arc<Semaphore>,
    pub config: SessionConfig,
    pub file_name: String,
    pub content_hash: Option<ContentHash>,
    pub events: broadcast::Sender<SessionEvent>,
}

impl SwarmContext {
    pub(crate) fn new(parts: ContextParts) -> Self {
        Self {
            alts: AltLocations::new(parts.config.max_alts),
            blocks: parts.blocks,
            ranker: parts.ranker,
            mesh: parts.mesh,
            connector: parts.connector,
            push: parts.push,
            push_sender: parts.push_sender,
            limiters: parts.limiters,
            slots: parts.slots,
            config: parts.config,
            file_name: parts.file_name,
            content_hash: parts.content_hash,
            events: parts.events,
            changed: Notify::new(),
            steal_lock: tokio::sync::Mutex::new(()),
            workers: Mutex::new(HashMap::new()),
            next_worker: AtomicU64::new(1),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<WorkerId, WorkerEntry>> {
        match self.workers.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn worker_counts(&self) -> WorkerCounts {
        let mut counts = WorkerCounts::default();
        for w in self.workers().values() {
            match w.phase {
                WorkerPhase::Connecting => counts.connecting += 1,
                WorkerPhase::Queued(_) => counts.queued += 1,
                WorkerPhase::Downloading => counts.downloading += 1,
            }
        }
        counts
    }

    /// Combined measured rate of all workers, bytes per second.
    pub fn bandwidth(&self) -> f64 {
        self.workers()
            .values()
            .filter_map(|w| w.progress.bandwidth())
            .sum()
    }

    fn set_phase(&self, id: WorkerId, phase: WorkerPhase) {
        let changed = match self.workers().get_mut(&id) {
            Some(w) if w.phase != phase => {
                w.phase = phase;
                true
            }
            _ => false,
        };
        if changed {
            self.changed.notify_one();
        }
    }

    fn others_active(&self, me: WorkerId) -> bool {
        self.workers()
            .iter()
            .any(|(id, w)| *id != me && !matches!(w.phase, WorkerPhase::Queued(_)))
    }

    /// Decides whether a queued worker keeps its place. Over capacity, a
    /// worse-placed queued worker is cancelled instead; if none exists the
    /// caller should give way.
    fn keep_queued(&self, me: WorkerId, position: u32) -> bool {
        let workers = self.workers();
        if workers.len() <= self.config.swarm_capacity {
            return true;
        }
        let worst = workers
            .iter()
            .filter(|(id, _)| **id != me)
            .filter_map(|(id, w)| match w.phase {
                WorkerPhase::Queued(p) if p > position => Some((p, *id)),
                _ => None,
            })
            .max();
        match worst {
            Some((p, id)) => {
                tracing::debug!(worker = %id, position = p, "replacing worse-queued worker");
                if let Some(w) = workers.get(&id) {
                    w.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Picks the slowest measured downloading worker and the part of its
    /// window a thief would take. Ties go to the largest remaining window;
    /// workers with no measurement yet come last.
    pub(crate) fn find_victim(
        &self,
        thief: Option<WorkerId>,
        thief_bw: Option<f64>,
    ) -> Option<StealPlan> {
        let candidates: Vec<(WorkerId, Arc<TransferProgress>, Interval, Option<f64>)> = self
            .workers()
            .iter()
            .filter(|(id, w)| Some(**id) != thief && w.phase == WorkerPhase::Downloading)
            .filter_map(|(id, w)| {
                let rem = w.progress.remaining()?;
                Some((*id, w.progress.clone(), rem, w.progress.bandwidth()))
            })
            .collect();

        candidates
            .into_iter()
            .filter_map(|(victim, progress, remaining, victim_bw)| {
                let range = self.steal_range(remaining, thief_bw, victim_bw)?;
                let plan = StealPlan {
                    victim,
                    progress,
                    range,
                };
                Some((victim_bw, remaining.len(), plan))
            })
            .min_by(|(abw, alen, _), (bbw, blen, _)| {
                let by_speed = match (abw, bbw) {
                    (Some(a), Some(b)) => a.total_cmp(b),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                by_speed.then(blen.cmp(alen))
            })
            .map(|(_, _, plan)| plan)
    }

    /// Part of `remaining` a thief may ask for. Large windows are split in
    /// the middle, chunk-aligned when a tree is known. A small tail goes
    /// whole, and only away from a victim with a measured rate that is
    /// slower than the thief, or stalled when the thief is unmeasured.
    fn steal_range(
        &self,
        remaining: Interval,
        thief_bw: Option<f64>,
        victim_bw: Option<f64>,
    ) -> Option<Interval> {
        let cfg = &self.config;
        let len = remaining.len();
        if len >= cfg.min_split_size.saturating_mul(2) {
            let mut start = remaining.low + len / 2;
            if let Some(chunk) = self.blocks.chunk_size() {
                let aligned = start.div_ceil(chunk) * chunk;
                if aligned <= remaining.high {
                    start = aligned;
                }
            }
            return Some(Interval::new(start, remaining.high));
        }
        if !cfg.steal_small_tails {
            return None;
        }
        let victim_bw = victim_bw?;
        let faster = thief_bw.is_some_and(|bw| bw > victim_bw);
        let stalled = thief_bw.is_none() && victim_bw < cfg.min_acceptable_speed as f64;
        (faster || stalled).then_some(remaining)
    }

    /// Whether starting another worker could find work.
    pub fn has_work(&self) -> bool {
        self.blocks.has_free_within(None) || self.find_victim(None, None).is_some()
    }

    pub(crate) fn negotiator_options(&self) -> NegotiatorOptions {
        NegotiatorOptions {
            io_timeout: self.config.io_timeout,
            max_queue_position: self.config.max_queue_position,
            firewall_capable: true,
            min_queue_poll: self.config.min_queue_poll,
            max_queue_poll: self.config.max_queue_poll,
        }
    }

    /// Feeds gossip heard from a source back into the pool.
    fn absorb_gossip(&self, alts: Vec<String>, nalts: Vec<String>) {
        for addr in &nalts {
            self.alts.record_bad(addr);
        }
        let fresh: Vec<String> = alts
            .into_iter()
            .filter(|a| !self.alts.is_bad(a))
            .collect();
        if fresh.is_empty() {
            return;
        }
        let size = self.blocks.file_size();
        let mut added = 0usize;
        for source in sources_from_alts(&fresh, &self.file_name, size, self.content_hash) {
            if self.ranker.add_to_pool(source) == crate::download::ranker::AddOutcome::Added {
                added += 1;
            }
        }
        if added > 0 {
            tracing::debug!(added, "learned sources from alternate locations");
            self.changed.notify_one();
        }
    }
}

/// Drives one source: connect, lease or steal a range, negotiate, stream,
/// repeat. Leased bytes not written when the worker ends are always
/// released, including on cancellation.
pub struct SourceWorker {
    id: WorkerId,
    ctx: Arc<SwarmContext>,
    source: RemoteSource,
    cancel: CancellationToken,
    progress: Arc<TransferProgress>,
    conn: Option<ConnectionNegotiator>,
    partial_rounds: u32,
    written: u64,
    _permit: Option<OwnedSemaphorePermit>,
}

impl SourceWorker {
    /// Registers a worker for `source` with the context.
    pub fn new(
        ctx: Arc<SwarmContext>,
        source: RemoteSource,
        cancel: CancellationToken,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let id = WorkerId(ctx.next_worker.fetch_add(1, Ordering::Relaxed));
        let progress = Arc::new(TransferProgress::new());
        ctx.workers().insert(
            id,
            WorkerEntry {
                address: source.address(),
                progress: progress.clone(),
                phase: WorkerPhase::Connecting,
                cancel: cancel.clone(),
            },
        );
        ctx.emit(SessionEvent::WorkerStarted {
            worker: id,
            source: source.address(),
        });
        ctx.changed.notify_one();
        Self {
            id,
            ctx,
            source,
            cancel,
            progress,
            conn: None,
            partial_rounds: 0,
            written: 0,
            _permit: permit,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub async fn run(mut self) -> WorkerReport {
        let cancel = self.cancel.clone();
        let disposition = tokio::select! {
            biased;
            _ = cancel.cancelled() => Disposition::Cancelled,
            d = self.work() => d,
        };
        self.release_window();
        self.conn = None;
        match disposition {
            Disposition::RetryAfter(delay) => {
                self.source.stats.retry_after = Some(Instant::now() + delay);
            }
            Disposition::Idle => {
                self.source.stats.retry_after = Some(Instant::now() + self.ctx.config.idle_wait);
            }
            Disposition::Forget | Disposition::Cancelled => {}
        }
        tracing::debug!(
            worker = %self.id,
            source = %self.source.address(),
            ?disposition,
            written = self.written,
            "worker exiting"
        );
        WorkerReport {
            id: self.id,
            source: self.source.clone(),
            disposition,
            written: self.written,
        }
    }

    fn release_window(&self) {
        if let Some(tail) = self.progress.finish_window()
            && let Err(err) = self.ctx.blocks.release(tail)
        {
            tracing::error!(worker = %self.id, range = %tail, error = %err, "failed to release lease");
        }
    }

    fn release_all(&self, ranges: Vec<Interval>) {
        for iv in ranges {
            if let Err(err) = self.ctx.blocks.release(iv) {
                tracing::error!(worker = %self.id, range = %iv, error = %err, "failed to release lease");
            }
        }
    }

    async fn work(&mut self) -> Disposition {
        loop {
            let blocks = &self.ctx.blocks;
            if blocks.fault().is_some() || blocks.is_complete() {
                return Disposition::Idle;
            }

            if self.conn.as_ref().is_none_or(|c| !c.is_reusable()) {
                self.conn = None;
                self.ctx.set_phase(self.id, WorkerPhase::Connecting);
                match self.establish().await {
                    Ok(conn) => self.conn = Some(conn),
                    Err(err) => match self.on_failure(err) {
                        Some(disposition) => return disposition,
                        None => continue,
                    },
                }
            }

            self.fetch_tree_if_needed().await;

            let max_len = self.lease_size();
            let offered = self.source.stats.available_ranges.clone();
            let step = match self.ctx.blocks.lease_white(offered.as_ref(), max_len) {
                Ok(lease) => {
                    self.progress.begin(lease);
                    let res = self.request(lease).await;
                    self.exchange_white(res).await
                }
                Err(LeaseError::NoSuchRange) => {
                    tracing::debug!(worker = %self.id, "source has none of the free ranges");
                    Some(Disposition::RetryAfter(self.ctx.config.retry.no_ranges))
                }
                Err(LeaseError::NoSuchElement) => self.steal().await,
                Err(LeaseError::Block(err)) => {
                    tracing::error!(worker = %self.id, error = %err, "lease failed");
                    Some(Disposition::Idle)
                }
            };
            if let Some(disposition) = step {
                return disposition;
            }
        }
    }

    async fn establish(&mut self) -> Result<ConnectionNegotiator, NegotiationError> {
        let can_push = self.source.needs_push || !self.source.source_id.is_empty();
        let push_first = self.source.needs_push || self.source.from_multicast;
        if push_first && can_push {
            match self.connect_push().await {
                Ok(conn) => return Ok(conn),
                Err(err) if self.source.needs_push => return Err(err),
                Err(_) => {}
            }
        }
        let direct = ConnectionNegotiator::connect(
            self.ctx.connector.as_ref(),
            &self.source,
            self.ctx.config.connect_timeout,
            self.ctx.negotiator_options(),
        )
        .await;
        match direct {
            Ok(conn) => Ok(conn),
            Err(err) if !push_first && can_push => {
                tracing::debug!(source = %self.source.address(), error = %err, "direct connect failed; trying push");
                self.connect_push().await
            }
            Err(err) => Err(err),
        }
    }

    async fn connect_push(&mut self) -> Result<ConnectionNegotiator, NegotiationError> {
        let class = if self.source.from_alt_location {
            PushClass::Gossip
        } else {
            PushClass::Standard
        };
        let limit = match class {
            PushClass::Standard => self.ctx.config.push_timeout,
            PushClass::Gossip => self.ctx.config.gossip_push_timeout,
        };
        let wait = self.ctx.push.register(self.source.push_key());
        if !self.ctx.push_sender.send_push(&self.source) {
            return Err(NegotiationError::PushTimeout);
        }
        let stream = wait.wait(limit).await?;
        tracing::debug!(source = %self.source.address(), "push connection arrived");
        Ok(ConnectionNegotiator::from_stream(
            stream,
            &self.source,
            ConnectionClass::Relayed,
            self.ctx.negotiator_options(),
        ))
    }

    async fn fetch_tree_if_needed(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if !conn.tree_advertised() || self.source.content_hash.is_none() {
            return;
        }
        let blocks = &self.ctx.blocks;
        if !blocks.try_claim_tree_request() {
            return;
        }
        match conn.request_hash_tree().await {
            Ok(ConnectionOutcome::ThexResponse { tree }) => match blocks.set_hash_tree(tree) {
                Ok(_) => {
                    tracing::info!(source = %self.source.address(), "hash tree received");
                }
                Err(err) => {
                    tracing::warn!(source = %self.source.address(), error = %err, "rejected hash tree");
                    blocks.release_tree_request();
                }
            },
            Ok(_) => blocks.release_tree_request(),
            Err(err) => {
                tracing::debug!(source = %self.source.address(), error = %err, "hash tree request failed");
                blocks.release_tree_request();
            }
        }
    }

    /// Lease size: one chunk, shrunk when few free bytes are left to share
    /// between several workers.
    fn lease_size(&self) -> u64 {
        let cfg = &self.ctx.config;
        let chunk = self
            .ctx
            .blocks
            .chunk_size()
            .unwrap_or(cfg.default_chunk_size)
            .max(1);
        let active = self.ctx.worker_counts().active().max(1) as u64;
        if active > 1 {
            let free = self.ctx.blocks.free().size();
            if free < chunk.saturating_mul(active) {
                return (free / active).max(cfg.min_split_size).min(chunk);
            }
        }
        chunk
    }

    async fn request(&mut self, range: Interval) -> Result<ConnectionOutcome, NegotiationError> {
        let (alts, nalts) = self.ctx.alts.to_send(&self.source.address());
        let Some(conn) = self.conn.as_mut() else {
            return Err(NegotiationError::Closed);
        };
        let res = conn.negotiate_range(range, true, &alts, &nalts).await;
        if let Some(available) = conn.available_ranges() {
            self.source.stats.available_ranges = Some(available.clone());
        }
        self.source.stats.tree_advertised |= conn.tree_advertised();
        let (heard, failed) = conn.take_alt_locations();
        self.ctx.absorb_gossip(heard, failed);
        res
    }

    /// Handles the reply to a white-range request. `None` continues the loop.
    async fn exchange_white(
        &mut self,
        res: Result<ConnectionOutcome, NegotiationError>,
    ) -> Option<Disposition> {
        match res {
            Ok(ConnectionOutcome::Connected { granted }) => {
                let cut = self.progress.restrict(granted);
                self.release_all(cut);
                self.report(true);
                self.stream(granted).await
            }
            Ok(ConnectionOutcome::Queued { position, poll }) => {
                self.release_window();
                self.report(true);
                self.wait_in_queue(position, poll).await
            }
            Ok(outcome) => {
                self.release_window();
                self.report(outcome_is_good(&outcome));
                self.on_outcome(outcome)
            }
            Err(err) => {
                self.release_window();
                self.on_failure(err)
            }
        }
    }

    async fn steal(&mut self) -> Option<Disposition> {
        if self.source.is_partial() {
            // A partial source only serves what it advertised; no stealing.
            tracing::trace!(worker = %self.id, "partial source has nothing free to serve");
            return Some(Disposition::RetryAfter(self.ctx.config.retry.no_ranges));
        }
        let ctx = self.ctx.clone();
        let _steal = ctx.steal_lock.lock().await;
        let Some(plan) = ctx.find_victim(Some(self.id), self.progress.bandwidth()) else {
            tracing::trace!(worker = %self.id, "nothing free and nothing worth stealing");
            return Some(Disposition::Idle);
        };
        tracing::debug!(worker = %self.id, victim = %plan.victim, range = %plan.range, "attempting steal");

        let res = self.request(plan.range).await;
        let granted = match res {
            Ok(ConnectionOutcome::Connected { granted }) => granted,
            Ok(ConnectionOutcome::Queued { position, poll }) => {
                self.report(true);
                drop(_steal);
                return self.wait_in_queue(position, poll).await;
            }
            Ok(outcome) => {
                self.report(outcome_is_good(&outcome));
                return self.on_outcome(outcome);
            }
            Err(err) => return self.on_failure(err),
        };
        self.report(true);

        if granted.high < plan.range.high {
            self.discard_body().await;
            return self.on_error(NegotiationError::BadStealer {
                requested: plan.range,
                granted,
            });
        }
        let Some(tail) = plan.progress.stop_at(plan.range.low.max(granted.low)) else {
            // Victim finished or left meanwhile; nobody is at fault.
            tracing::debug!(worker = %self.id, victim = %plan.victim, "steal target vanished");
            self.discard_body().await;
            return None;
        };
        self.progress.begin(tail);
        tracing::debug!(worker = %self.id, victim = %plan.victim, range = %tail, "stole range");
        ctx.emit(SessionEvent::Stolen {
            thief: self.id,
            victim: plan.victim,
            range: tail,
        });
        drop(_steal);
        self.stream(granted).await
    }

    /// Reads and drops a granted body this worker owns nothing of.
    async fn discard_body(&mut self) {
        let idle = TransferProgress::new();
        let limiter = crate::download::rate_limit::RateLimiter::unlimited();
        if let Some(conn) = self.conn.as_mut() {
            let _ = conn.stream_into(&self.ctx.blocks, &idle, &limiter).await;
        }
    }

    async fn stream(&mut self, granted: Interval) -> Option<Disposition> {
        self.partial_rounds = 0;
        self.ctx.set_phase(self.id, WorkerPhase::Downloading);
        self.ctx.emit(SessionEvent::RangeGranted {
            worker: self.id,
            range: granted,
        });
        let Some(conn) = self.conn.as_mut() else {
            self.release_window();
            return self.on_error(NegotiationError::Closed);
        };
        let limiter = self.ctx.limiters.for_class(conn.class());
        let res = conn
            .stream_into(&self.ctx.blocks, &self.progress, &limiter)
            .await;
        self.release_window();
        match res {
            Ok(end) => {
                self.written += end.written;
                self.source.record_success();
                self.source.stats.queue_position = None;
                self.ctx.alts.record_good(&self.source.address());
                tracing::trace!(
                    worker = %self.id,
                    range = %granted,
                    written = end.written,
                    stopped_early = end.stopped_early,
                    "range done"
                );
                None
            }
            Err(StreamError::Block(err)) => {
                tracing::error!(worker = %self.id, error = %err, "write rejected");
                Some(Disposition::Idle)
            }
            Err(err) => {
                tracing::warn!(
                    worker = %self.id,
                    source = %self.source.address(),
                    error = %err,
                    "transfer interrupted"
                );
                self.conn = None;
                Some(self.io_failure())
            }
        }
    }

    async fn wait_in_queue(&mut self, position: u32, poll: Duration) -> Option<Disposition> {
        self.source.stats.queue_position = Some(position);
        self.ctx.set_phase(self.id, WorkerPhase::Queued(position));
        self.ctx.emit(SessionEvent::Queued {
            worker: self.id,
            position,
        });
        if !self.ctx.keep_queued(self.id, position) {
            tracing::debug!(worker = %self.id, position, "giving up queue slot for a fresh source");
            return Some(Disposition::RetryAfter(poll));
        }
        tracing::debug!(worker = %self.id, position, poll_ms = poll.as_millis() as u64, "remotely queued");
        tokio::time::sleep(poll).await;
        None
    }

    fn on_partial_data(&mut self) -> Option<Disposition> {
        self.partial_rounds += 1;
        if self.partial_rounds > self.ctx.config.max_partial_rounds {
            return Some(Disposition::RetryAfter(self.ctx.config.retry.no_ranges));
        }
        None
    }

    fn on_outcome(&mut self, outcome: ConnectionOutcome) -> Option<Disposition> {
        let retry = &self.ctx.config.retry;
        match outcome {
            ConnectionOutcome::PartialData => self.on_partial_data(),
            ConnectionOutcome::NoData => Some(self.demote(retry.no_ranges)),
            ConnectionOutcome::NoFile => Some(self.demote(retry.not_found_cooldown)),
            ConnectionOutcome::Connected { .. }
            | ConnectionOutcome::Queued { .. }
            | ConnectionOutcome::ThexResponse { .. } => None,
        }
    }

    fn busy_delay(&self) -> Duration {
        let retry = &self.ctx.config.retry;
        if self.ctx.others_active(self.id) {
            retry.busy_some_active
        } else {
            retry.busy_none_active
        }
    }

    /// Tells the mesh how a negotiation attempt went, then acts on it.
    fn on_failure(&mut self, err: NegotiationError) -> Option<Disposition> {
        self.report(matches!(
            err,
            NegotiationError::Busy { .. }
                | NegotiationError::QueueFull { .. }
                | NegotiationError::RangeNotAvailable { .. }
        ));
        self.on_error(err)
    }

    /// What a missing range means: more to try from this source, or
    /// nothing it has that we still need.
    fn missing_range_outcome(&self, available: Option<&IntervalSet>) -> ConnectionOutcome {
        match available {
            Some(ranges) if !self.ctx.blocks.has_free_within(Some(ranges)) => {
                ConnectionOutcome::NoData
            }
            _ => ConnectionOutcome::PartialData,
        }
    }

    /// Maps a failed exchange to what happens to the source. `None` keeps
    /// the worker going.
    fn on_error(&mut self, err: NegotiationError) -> Option<Disposition> {
        let retry = self.ctx.config.retry.clone();
        tracing::debug!(worker = %self.id, source = %self.source.address(), error = %err, "negotiation failed");
        let disposition = match err {
            NegotiationError::RangeNotAvailable { available } => {
                let outcome = self.missing_range_outcome(available.as_ref());
                return self.on_outcome(outcome);
            }
            NegotiationError::NotFound | NegotiationError::NotSharing => {
                self.retract();
                return self.on_outcome(ConnectionOutcome::NoFile);
            }
            NegotiationError::Busy { retry_after } => {
                Disposition::RetryAfter(retry_after.unwrap_or_default().max(self.busy_delay()))
            }
            NegotiationError::QueueFull { .. } => Disposition::RetryAfter(self.busy_delay()),
            NegotiationError::ContentMismatch => {
                tracing::warn!(source = %self.source.address(), "source serves different content");
                self.retract();
                Disposition::Forget
            }
            NegotiationError::Malformed(_)
            | NegotiationError::UnknownCode(_)
            | NegotiationError::BadGrant { .. }
            | NegotiationError::BadStealer { .. }
            | NegotiationError::BadTree(_) => {
                if crate::logging::warn_throttled("misbehaving_source", Duration::from_secs(30)) {
                    tracing::warn!(source = %self.source.address(), error = %err, "misbehaving source");
                }
                self.demote(retry.not_found_cooldown)
            }
            NegotiationError::CantConnect(_)
            | NegotiationError::PushTimeout
            | NegotiationError::Timeout(_)
            | NegotiationError::Io { .. }
            | NegotiationError::Closed => {
                self.conn = None;
                if self.source.from_alt_location {
                    self.retract();
                }
                self.io_failure()
            }
        };
        Some(disposition)
    }

    /// Short backoff after one failure, long after two in a row.
    fn io_failure(&mut self) -> Disposition {
        let retry = &self.ctx.config.retry;
        self.source.record_failure();
        if self.source.stats.total_failures >= self.ctx.config.max_source_failures {
            return Disposition::Forget;
        }
        if self.source.stats.consecutive_failures >= 2 {
            Disposition::RetryAfter(retry.abandon)
        } else {
            Disposition::RetryAfter(retry.failed)
        }
    }

    fn demote(&mut self, cooldown: Duration) -> Disposition {
        self.source.record_failure();
        if self.source.stats.total_failures >= self.ctx.config.max_source_failures {
            Disposition::Forget
        } else {
            Disposition::RetryAfter(cooldown)
        }
    }

    fn report(&self, succeeded: bool) {
        self.ctx.mesh.report_outcome(&self.source, succeeded);
    }

    fn retract(&self) {
        self.ctx.alts.record_bad(&self.source.address());
        if self.source.from_alt_location {
            self.ctx.mesh.retract(&self.source);
        }
    }
}

/// Whether the mesh should hear of an outcome as a working location.
fn outcome_is_good(outcome: &ConnectionOutcome) -> bool {
    !matches!(outcome, ConnectionOutcome::NoFile)
}

impl Drop for SourceWorker {
    fn drop(&mut self) {
        if let Some(tail) = self.progress.close()
            && let Err(err) = self.ctx.blocks.release(tail)
        {
            tracing::error!(worker = %self.id, range = %tail, error = %err, "failed to release lease on drop");
        }
        self.ctx.workers().remove(&self.id);
        self.ctx.emit(SessionEvent::WorkerExited {
            worker: self.id,
            source: self.source.address(),
            written: self.written,
        });
        self.ctx.changed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::block_state::BlockOptions;
    use crate::download::protocol::parse_request_head;
    use crate::download::ranker::DefaultRanker;
    use crate::download::selection::Sequential;
    use crate::net::BoxedStream;
    use futures_util::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
    use tokio::time::timeout;

    const SIZE: u64 = 1000;
    const LIMIT: Duration = Duration::from_secs(5);

    /// Replies to requests from one shared script, in order, across all
    /// connections. Once the script is used up the connection stays open
    /// and silent.
    #[derive(Default)]
    struct Scripted {
        replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
        requests: Arc<Mutex<Vec<Vec<u8>>>>,
        connects: AtomicUsize,
    }

    impl Scripted {
        fn push(&self, reply: Vec<u8>) {
            self.replies.lock().expect("replies").push_back(reply);
        }

        fn requested_ranges(&self) -> Vec<Option<Interval>> {
            self.requests
                .lock()
                .expect("requests")
                .iter()
                .map(|raw| {
                    parse_request_head(raw)
                        .expect("request head")
                        .range()
                        .expect("range header")
                })
                .collect()
        }

        fn open(&self) -> BoxedStream {
            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(serve(server, self.replies.clone(), self.requests.clone()));
            Box::new(client)
        }
    }

    async fn serve(
        mut stream: DuplexStream,
        replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
        requests: Arc<Mutex<Vec<Vec<u8>>>>,
    ) {
        let mut byte = [0u8; 1];
        loop {
            let mut raw = Vec::new();
            while !raw.ends_with(b"\r\n\r\n") {
                if stream.read_exact(&mut byte).await.is_err() {
                    return;
                }
                raw.push(byte[0]);
            }
            requests.lock().expect("requests").push(raw);
            let next = replies.lock().expect("replies").pop_front();
            let Some(reply) = next else {
                let _ = stream.read(&mut byte).await;
                return;
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }

    impl Connector for Scripted {
        fn connect<'a>(
            &'a self,
            _host: &'a str,
            _port: u16,
            _connect_timeout: Duration,
        ) -> BoxFuture<'a, std::io::Result<BoxedStream>> {
            self.connects.fetch_add(1, Ordering::Relaxed);
            let stream = self.open();
            Box::pin(async move { Ok(stream) })
        }
    }

    /// Delivers a push request by connecting back at once.
    struct Loopback {
        registry: PushRegistry,
        swarm: Arc<Scripted>,
    }

    impl PushSender for Loopback {
        fn send_push(&self, source: &RemoteSource) -> bool {
            self.registry.accept_inbound(
                &source.file_name,
                source.file_index,
                &source.source_id,
                self.swarm.open(),
            )
        }
    }

    #[derive(Default)]
    struct RecordingMesh {
        reports: Mutex<Vec<(String, bool)>>,
        retracted: Mutex<Vec<String>>,
    }

    impl MeshFeedback for RecordingMesh {
        fn report_outcome(&self, source: &RemoteSource, succeeded: bool) {
            self.reports
                .lock()
                .expect("reports")
                .push((source.address(), succeeded));
        }

        fn retract(&self, source: &RemoteSource) {
            self.retracted.lock().expect("retracted").push(source.address());
        }
    }

    #[derive(Default)]
    struct Harness {
        swarm: Arc<Scripted>,
        mesh: Arc<RecordingMesh>,
        push: PushRegistry,
    }

    impl Harness {
        async fn context(&self, tag: &str, size: u64) -> Arc<SwarmContext> {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos();
            let path = std::env::temp_dir().join(format!("rust-swarm-worker-{tag}-{nanos}.part"));
            let blocks = BlockState::open(
                path,
                size,
                BlockOptions::default(),
                Arc::new(Sequential),
                None,
            )
            .await
            .expect("open blocks");
            let (events, _) = broadcast::channel(64);
            Arc::new(SwarmContext::new(ContextParts {
                blocks,
                ranker: Arc::new(DefaultRanker::new(size, None)),
                mesh: self.mesh.clone(),
                connector: self.swarm.clone(),
                push: self.push.clone(),
                push_sender: Arc::new(Loopback {
                    registry: self.push.clone(),
                    swarm: self.swarm.clone(),
                }),
                limiters: RateLimiters::unlimited(),
                slots: Arc::new(Semaphore::new(16)),
                config: SessionConfig {
                    io_timeout: LIMIT,
                    ..SessionConfig::default()
                },
                file_name: "f.bin".to_string(),
                content_hash: None,
                events,
            }))
        }
    }

    fn source(host: &str) -> RemoteSource {
        RemoteSource::new(host, 6346, "f.bin", SIZE)
    }

    fn reply(head: &str, body: &[u8]) -> Vec<u8> {
        let mut out = head.as_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    async fn run(ctx: &Arc<SwarmContext>, source: RemoteSource) -> WorkerReport {
        let worker = SourceWorker::new(ctx.clone(), source, CancellationToken::new(), None);
        timeout(LIMIT, worker.run()).await.expect("worker finished")
    }

    #[tokio::test]
    async fn unmeasured_victim_keeps_a_small_tail() {
        let h = Harness::default();
        let ctx = h.context("victim", SIZE).await;
        let victim = SourceWorker::new(ctx.clone(), source("10.0.0.1"), CancellationToken::new(), None);
        let lease = ctx.blocks.lease_white(None, SIZE).expect("lease");
        victim.progress.begin(lease);
        ctx.set_phase(victim.id(), WorkerPhase::Downloading);

        assert!(ctx.find_victim(None, None).is_none());
        assert!(ctx.find_victim(None, Some(1_000_000.0)).is_none());
        assert!(!ctx.has_work());

        // Roughly 66 B/s once measured, far below the acceptable speed.
        victim.progress.record_bytes(10);
        tokio::time::sleep(Duration::from_millis(300)).await;
        victim.progress.record_bytes(10);
        let plan = ctx.find_victim(None, None).expect("stalled victim");
        assert_eq!(plan.victim, victim.id());
        assert_eq!(plan.range, lease);
        assert!(ctx.find_victim(None, Some(1.0)).is_none());
        assert!(ctx.find_victim(None, Some(10_000.0)).is_some());

        drop(victim);
        assert_eq!(ctx.blocks.counts().leased, 0);
    }

    #[tokio::test]
    async fn large_window_is_split_in_the_middle() {
        let h = Harness::default();
        let size = 100_000;
        let ctx = h.context("split", size).await;
        let victim = SourceWorker::new(ctx.clone(), source("10.0.0.1"), CancellationToken::new(), None);
        let lease = ctx.blocks.lease_white(None, size).expect("lease");
        assert_eq!(lease, Interval::new(0, size - 1));
        victim.progress.begin(lease);
        ctx.set_phase(victim.id(), WorkerPhase::Downloading);

        let plan = ctx.find_victim(None, None).expect("split");
        assert_eq!(plan.range, Interval::new(50_000, size - 1));
        assert!(ctx.find_victim(Some(victim.id()), None).is_none());
    }

    #[tokio::test]
    async fn cancelling_mid_body_releases_the_rest_of_the_lease() {
        let h = Harness::default();
        h.swarm.push(reply(
            "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-999/1000\r\nContent-Length: 1000\r\n\r\n",
            &[7u8; 300],
        ));
        let ctx = h.context("cancel", SIZE).await;
        let cancel = CancellationToken::new();
        let worker = SourceWorker::new(ctx.clone(), source("10.0.0.1"), cancel.clone(), None);
        let task = tokio::spawn(worker.run());

        timeout(LIMIT, async {
            while ctx.blocks.counts().verified < 300 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("first bytes written");
        assert_eq!(ctx.blocks.counts().leased, 700);

        cancel.cancel();
        let report = timeout(LIMIT, task).await.expect("exit").expect("join");
        assert_eq!(report.disposition, Disposition::Cancelled);
        let counts = ctx.blocks.counts();
        assert_eq!(counts.leased, 0);
        assert_eq!(counts.verified, 300);
        assert_eq!(counts.free, 700);
        assert_eq!(ctx.worker_counts().total(), 0);
    }

    #[tokio::test]
    async fn gossip_source_without_the_file_is_reported_and_retracted() {
        let h = Harness::default();
        h.swarm.push(reply("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n", b""));
        let ctx = h.context("gossip", SIZE).await;
        let mut gossiped = source("10.0.0.1");
        gossiped.from_alt_location = true;

        let report = run(&ctx, gossiped).await;
        let cooldown = ctx.config.retry.not_found_cooldown;
        assert_eq!(report.disposition, Disposition::RetryAfter(cooldown));
        assert_eq!(report.source.stats.total_failures, 1);
        assert_eq!(
            *h.mesh.reports.lock().expect("reports"),
            vec![("10.0.0.1:6346".to_string(), false)]
        );
        assert_eq!(
            *h.mesh.retracted.lock().expect("retracted"),
            vec!["10.0.0.1:6346".to_string()]
        );
        assert!(ctx.alts.is_bad("10.0.0.1:6346"));
        assert_eq!(ctx.blocks.counts().leased, 0);
    }

    #[tokio::test]
    async fn partial_source_is_leased_within_its_advertised_ranges() {
        let h = Harness::default();
        h.swarm.push(reply(
            "HTTP/1.1 416 Range Not Satisfiable\r\nX-Available-Ranges: bytes 500-999\r\nContent-Length: 0\r\n\r\n",
            b"",
        ));
        h.swarm.push(reply(
            "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 500-999/1000\r\nContent-Length: 500\r\n\r\n",
            &[3u8; 500],
        ));
        let ctx = h.context("partial", SIZE).await;

        let report = run(&ctx, source("10.0.0.1")).await;
        assert_eq!(
            report.disposition,
            Disposition::RetryAfter(ctx.config.retry.no_ranges)
        );
        assert!(report.source.is_partial());
        assert_eq!(report.source.stats.total_failures, 0);
        assert_eq!(
            h.swarm.requested_ranges(),
            vec![Some(Interval::new(0, 999)), Some(Interval::new(500, 999))]
        );
        assert_eq!(
            *h.mesh.reports.lock().expect("reports"),
            vec![
                ("10.0.0.1:6346".to_string(), true),
                ("10.0.0.1:6346".to_string(), true)
            ]
        );

        ctx.blocks.wait_for_outstanding_writes().await;
        let counts = ctx.blocks.counts();
        assert_eq!(counts.verified, 500);
        assert_eq!(counts.free, 500);
        assert_eq!(counts.leased, 0);
    }

    #[tokio::test]
    async fn source_with_nothing_still_needed_is_demoted() {
        let h = Harness::default();
        h.swarm.push(reply(
            "HTTP/1.1 416 Range Not Satisfiable\r\nX-Available-Ranges: bytes 0-499\r\nContent-Length: 0\r\n\r\n",
            b"",
        ));
        let ctx = h.context("nodata", SIZE).await;
        let have = IntervalSet::single(Interval::new(0, 499));
        let iv = ctx.blocks.lease_white(Some(&have), 500).expect("lease");
        ctx.blocks.write(iv, vec![1u8; 500]).expect("write");
        ctx.blocks.wait_for_outstanding_writes().await;

        let report = run(&ctx, source("10.0.0.1")).await;
        assert_eq!(
            report.disposition,
            Disposition::RetryAfter(ctx.config.retry.no_ranges)
        );
        assert_eq!(report.source.stats.total_failures, 1);
        assert_eq!(h.swarm.requested_ranges(), vec![Some(Interval::new(500, 999))]);
        assert_eq!(ctx.blocks.counts().leased, 0);
    }

    #[tokio::test]
    async fn firewalled_source_is_reached_by_push_first() {
        let h = Harness::default();
        let body: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
        h.swarm.push(reply(
            "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-999/1000\r\nContent-Length: 1000\r\n\r\n",
            &body,
        ));
        let ctx = h.context("push", SIZE).await;
        let mut firewalled = source("192.168.1.5");
        firewalled.needs_push = true;
        firewalled.source_id = "ABCDEF0123".to_string();

        let report = run(&ctx, firewalled).await;
        assert_eq!(report.disposition, Disposition::Idle);
        assert_eq!(report.written, SIZE);
        assert_eq!(h.swarm.connects.load(Ordering::Relaxed), 0);
        assert_eq!(h.push.waiting_count(), 0);
        ctx.blocks.wait_for_outstanding_writes().await;
        assert!(ctx.blocks.is_complete());
    }
}
