use crate::download::block_state::{BlockCounts, BlockOptions, BlockSnapshot, BlockState};
use crate::download::errors::{BlockStateError, ControlError, DownloadStoreError};
use crate::download::hash_tree::{ContentHash, HashTree};
use crate::download::interval::Interval;
use crate::download::mesh::{DEFAULT_MAX_ALTS, MeshFeedback, SilentMesh};
use crate::download::push::{NoPushRoute, PushRegistry, PushSender};
use crate::download::ranker::{AddOutcome, DefaultRanker, PoolCounts, SourceRanker};
use crate::download::rate_limit::RateLimiters;
use crate::download::selection::{SelectionPolicy, strategy_for};
use crate::download::source::RemoteSource;
use crate::download::store::{self, KnownFileEntry, SESSION_RECORD_VERSION, SessionRecord};
use crate::download::types::{ConnectionSpeed, DownloadId, DownloadState, WorkerId};
use crate::download::worker::{
    ContextParts, Disposition, SourceWorker, SwarmContext, WorkerCounts, WorkerReport,
};
use crate::net::{BoxedStream, Connector};
use futures_util::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CHUNK_SIZE: u64 = 100_000;
pub const MIN_SPLIT_SIZE: u64 = 16 * 1024;
const EVENT_CAPACITY: usize = 256;

/// Backoff applied to a source after each kind of failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// After a connect or transfer failure.
    pub failed: Duration,
    /// The source had none of the bytes still needed.
    pub no_ranges: Duration,
    /// Busy while this session has no other active worker.
    pub busy_none_active: Duration,
    /// Busy while other workers are already transferring.
    pub busy_some_active: Duration,
    /// After two failures in a row.
    pub abandon: Duration,
    /// After 404/410 or a protocol violation.
    pub not_found_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            failed: Duration::from_secs(60),
            no_ranges: Duration::from_secs(300),
            busy_none_active: Duration::from_secs(60),
            busy_some_active: Duration::from_secs(600),
            abandon: Duration::from_secs(1800),
            not_found_cooldown: Duration::from_secs(3600),
        }
    }
}

/// Tuning for one download session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Workers that may connect or transfer at once. Queued workers may add
    /// the same number again.
    pub swarm_capacity: usize,
    /// Lease size while no hash tree is known.
    pub default_chunk_size: u64,
    /// Smallest range that is ever split between two workers.
    pub min_split_size: u64,
    /// Bytes per second under which a worker counts as stalled.
    pub min_acceptable_speed: u64,
    /// Allow stealing a whole tail shorter than two split sizes.
    pub steal_small_tails: bool,
    pub selection: SelectionPolicy,
    pub discard_corrupt: bool,
    pub hopeless_ratio: f64,
    /// Failures after which a source is dropped for good.
    pub max_source_failures: u32,
    /// Remote queue positions beyond this count as a full queue.
    pub max_queue_position: u32,
    /// Bounds on the poll interval a remote queue may ask for.
    pub min_queue_poll: Duration,
    pub max_queue_poll: Duration,
    /// Upper bound on how long the session loop sleeps between checks.
    pub idle_wait: Duration,
    /// How long to wait for new sources before giving up.
    pub locate_wait: Duration,
    /// Consecutive "range not available" replies tolerated per source.
    pub max_partial_rounds: u32,
    pub connect_timeout: Duration,
    pub push_timeout: Duration,
    pub gossip_push_timeout: Duration,
    pub io_timeout: Duration,
    pub max_alts: usize,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            swarm_capacity: ConnectionSpeed::Broadband.swarm_capacity(),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            min_split_size: MIN_SPLIT_SIZE,
            min_acceptable_speed: 500,
            steal_small_tails: true,
            selection: SelectionPolicy::BiasedRandom,
            discard_corrupt: true,
            hopeless_ratio: crate::download::block_state::DEFAULT_HOPELESS_RATIO,
            max_source_failures: 5,
            max_queue_position: 50,
            min_queue_poll: Duration::from_secs(1),
            max_queue_poll: Duration::from_secs(180),
            idle_wait: Duration::from_secs(5),
            locate_wait: Duration::from_secs(120),
            max_partial_rounds: 3,
            connect_timeout: Duration::from_secs(10),
            push_timeout: Duration::from_secs(20),
            gossip_push_timeout: Duration::from_secs(6),
            io_timeout: Duration::from_secs(30),
            max_alts: DEFAULT_MAX_ALTS,
            retry: RetryPolicy::default(),
        }
    }
}

/// Something observable happened inside a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        state: DownloadState,
    },
    WorkerStarted {
        worker: WorkerId,
        source: String,
    },
    RangeGranted {
        worker: WorkerId,
        range: Interval,
    },
    Queued {
        worker: WorkerId,
        position: u32,
    },
    /// `thief` took over `range` from the tail of `victim`'s window.
    Stolen {
        thief: WorkerId,
        victim: WorkerId,
        range: Interval,
    },
    WorkerExited {
        worker: WorkerId,
        source: String,
        written: u64,
    },
    CorruptionDetected {
        lost_bytes: u64,
    },
    Completed {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionDecision {
    /// Keep downloading and accept the damaged bytes.
    Keep,
    /// Throw every byte away; the session ends in `CorruptFile`.
    Discard,
}

/// The user-facing side of a session.
pub trait CompletionHandler: Send + Sync {
    fn on_corruption_detected<'a>(
        &'a self,
        status: &'a SessionStatus,
    ) -> BoxFuture<'a, CorruptionDecision>;

    fn on_completed<'a>(&'a self, status: &'a SessionStatus, path: &'a Path) -> BoxFuture<'a, ()>;
}

/// Decides without asking anyone. Used when running headless.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDecision {
    pub keep_corrupt: bool,
}

impl CompletionHandler for AutoDecision {
    fn on_corruption_detected<'a>(
        &'a self,
        status: &'a SessionStatus,
    ) -> BoxFuture<'a, CorruptionDecision> {
        Box::pin(async move {
            tracing::warn!(
                download = %status.id,
                file = %status.file_name,
                lost = status.blocks.lost,
                keep = self.keep_corrupt,
                "corruption detected"
            );
            if self.keep_corrupt {
                CorruptionDecision::Keep
            } else {
                CorruptionDecision::Discard
            }
        })
    }

    fn on_completed<'a>(&'a self, status: &'a SessionStatus, path: &'a Path) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::info!(download = %status.id, path = %path.display(), "download complete");
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub id: DownloadId,
    pub file_name: String,
    pub file_size: u64,
    pub state: DownloadState,
    /// When a waiting state (busy, locating) is expected to end.
    pub expected_exit_unix_secs: Option<u64>,
    pub blocks: BlockCounts,
    pub workers: WorkerCounts,
    pub sources: PoolCounts,
    /// Bytes per second over all workers.
    pub bandwidth: f64,
    pub eta_secs: Option<u64>,
    pub corruption_pending: bool,
    pub last_error: Option<String>,
    pub final_path: Option<PathBuf>,
}

/// What a new or recovered session starts from.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub id: DownloadId,
    pub file_name: String,
    pub file_size: u64,
    pub content_hash: Option<ContentHash>,
    /// Backing file for the incomplete download.
    pub part_path: PathBuf,
    /// Where the finished file is moved.
    pub complete_dir: PathBuf,
    /// Known-files list appended to on completion.
    pub known_files: Option<PathBuf>,
    pub snapshot: Option<BlockSnapshot>,
    pub hash_tree: Option<HashTree>,
    pub sources: Vec<RemoteSource>,
    /// Recovered parked state; a fresh session starts `Paused`.
    pub initial_state: Option<DownloadState>,
    pub last_error: Option<String>,
    pub created_unix_secs: u64,
}

impl SessionParams {
    pub fn new(
        id: DownloadId,
        file_name: impl Into<String>,
        file_size: u64,
        part_path: impl Into<PathBuf>,
        complete_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            file_name: file_name.into(),
            file_size,
            content_hash: None,
            part_path: part_path.into(),
            complete_dir: complete_dir.into(),
            known_files: None,
            snapshot: None,
            hash_tree: None,
            sources: Vec::new(),
            initial_state: None,
            last_error: None,
            created_unix_secs: store::unix_now(),
        }
    }

    /// Params for resuming from a stored record.
    pub fn from_record(
        record: SessionRecord,
        part_path: impl Into<PathBuf>,
        complete_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: record.id,
            file_name: record.file_name,
            file_size: record.file_size,
            content_hash: record.content_hash,
            part_path: part_path.into(),
            complete_dir: complete_dir.into(),
            known_files: None,
            snapshot: Some(record.blocks),
            hash_tree: None,
            sources: record.sources,
            initial_state: Some(record.state),
            last_error: record.last_error,
            created_unix_secs: record.created_unix_secs,
        }
    }
}

/// Collaborators a session talks to. Several sessions may share them.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn Connector>,
    pub mesh: Arc<dyn MeshFeedback>,
    pub push: PushRegistry,
    pub push_sender: Arc<dyn PushSender>,
    pub limiters: RateLimiters,
    /// Process-wide cap on open transfer connections.
    pub slots: Arc<Semaphore>,
    pub handler: Arc<dyn CompletionHandler>,
}

impl SessionDeps {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            mesh: Arc::new(SilentMesh),
            push: PushRegistry::new(),
            push_sender: Arc::new(NoPushRoute),
            limiters: RateLimiters::unlimited(),
            slots: Arc::new(Semaphore::new(1024)),
            handler: Arc::new(AutoDecision::default()),
        }
    }
}

struct Runner {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Control {
    state: DownloadState,
    runner: Option<Runner>,
    corruption_pending: bool,
    expected_exit: Option<u64>,
    last_error: Option<String>,
    final_path: Option<PathBuf>,
}

struct SessionInner {
    id: DownloadId,
    complete_dir: PathBuf,
    known_files: Option<PathBuf>,
    created_unix_secs: u64,
    ctx: Arc<SwarmContext>,
    handler: Arc<dyn CompletionHandler>,
    control: Mutex<Control>,
    status_tx: watch::Sender<SessionStatus>,
}

impl SessionInner {
    fn control(&self) -> MutexGuard<'_, Control> {
        match self.control.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn status(&self) -> SessionStatus {
        let (state, expected_exit, corruption_pending, last_error, final_path) = {
            let c = self.control();
            (
                c.state,
                c.expected_exit,
                c.corruption_pending,
                c.last_error.clone(),
                c.final_path.clone(),
            )
        };
        let ctx = &self.ctx;
        let blocks = ctx.blocks.counts();
        let bandwidth = ctx.bandwidth();
        let eta_secs = (bandwidth > 0.0)
            .then(|| (blocks.file_size.saturating_sub(blocks.verified) as f64 / bandwidth) as u64);
        SessionStatus {
            id: self.id,
            file_name: ctx.file_name.clone(),
            file_size: blocks.file_size,
            state,
            expected_exit_unix_secs: expected_exit,
            blocks,
            workers: ctx.worker_counts(),
            sources: ctx.ranker.counts(Instant::now()),
            bandwidth,
            eta_secs,
            corruption_pending,
            last_error,
            final_path,
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }

    fn announce(&self, state: DownloadState) {
        tracing::info!(download = %self.id, ?state, "download state changed");
        self.ctx.emit(SessionEvent::StateChanged { state });
        self.publish();
    }
}

/// One file being fetched from a swarm of sources. Cheap to clone; all
/// clones control the same session.
#[derive(Clone)]
pub struct DownloadSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for DownloadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl DownloadSession {
    /// Opens the backing file and builds the session. Nothing is fetched
    /// until `start` or `resume`.
    pub async fn open(
        params: SessionParams,
        config: SessionConfig,
        deps: SessionDeps,
    ) -> Result<Self, BlockStateError> {
        let opts = BlockOptions {
            discard_corrupt: config.discard_corrupt,
            hopeless_ratio: config.hopeless_ratio,
            default_block_size: config.min_split_size.max(1),
        };
        let mut snapshot = params.snapshot;
        if let Some(tree) = params.hash_tree {
            snapshot.get_or_insert_with(BlockSnapshot::default).hash_tree = Some(tree);
        }
        let blocks = BlockState::open(
            &params.part_path,
            params.file_size,
            opts,
            strategy_for(config.selection),
            snapshot,
        )
        .await?;

        let ranker = Arc::new(DefaultRanker::new(params.file_size, params.content_hash));
        for source in params.sources {
            ranker.add_to_pool(source);
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let ctx = Arc::new(SwarmContext::new(ContextParts {
            blocks,
            ranker,
            mesh: deps.mesh,
            connector: deps.connector,
            push: deps.push,
            push_sender: deps.push_sender,
            limiters: deps.limiters,
            slots: deps.slots,
            config,
            file_name: params.file_name,
            content_hash: params.content_hash,
            events,
        }));

        // Only parked states survive a restart; anything that was running
        // comes back paused and is resumed by the owner.
        let state = match params.initial_state {
            Some(s) if s.is_resumable() || s.is_terminal() => s,
            _ => DownloadState::Paused,
        };
        let control = Control {
            state,
            runner: None,
            corruption_pending: false,
            expected_exit: None,
            last_error: params.last_error,
            final_path: None,
        };
        let (status_tx, _) = watch::channel(placeholder_status(params.id, &ctx, state));
        let inner = Arc::new(SessionInner {
            id: params.id,
            complete_dir: params.complete_dir,
            known_files: params.known_files,
            created_unix_secs: params.created_unix_secs,
            ctx,
            handler: deps.handler,
            control: Mutex::new(control),
            status_tx,
        });
        inner.publish();
        Ok(Self { inner })
    }

    pub fn id(&self) -> DownloadId {
        self.inner.id
    }

    pub fn state(&self) -> DownloadState {
        self.inner.control().state
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.ctx.events.subscribe()
    }

    pub fn blocks(&self) -> &BlockState {
        &self.inner.ctx.blocks
    }

    /// Waits until the session reaches a state matching `pred`.
    pub async fn wait_for_state(&self, pred: impl Fn(DownloadState) -> bool) -> DownloadState {
        let mut rx = self.subscribe_status();
        loop {
            let state = rx.borrow_and_update().state;
            if pred(state) {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Starts a session that has never run.
    pub fn start(&self) -> Result<(), ControlError> {
        let mut c = self.inner.control();
        if c.state.is_terminal() {
            return Err(ControlError::Terminal(c.state));
        }
        if c.state != DownloadState::Paused || c.runner.is_some() {
            return Err(ControlError::InvalidTransition {
                op: "start",
                from: c.state,
            });
        }
        self.spawn_runner(&mut c, false);
        drop(c);
        self.inner.announce(DownloadState::Connecting);
        Ok(())
    }

    pub fn pause(&self) -> Result<(), ControlError> {
        let mut c = self.inner.control();
        match c.state {
            DownloadState::Paused => return Ok(()),
            s if s.is_terminal() => return Err(ControlError::Terminal(s)),
            s @ (DownloadState::Hashing | DownloadState::Saving) => {
                return Err(ControlError::InvalidTransition {
                    op: "pause",
                    from: s,
                });
            }
            _ => {}
        }
        if let Some(runner) = &c.runner {
            runner.cancel.cancel();
        }
        c.state = DownloadState::Paused;
        c.corruption_pending = false;
        c.expected_exit = None;
        drop(c);
        self.inner.announce(DownloadState::Paused);
        Ok(())
    }

    /// Continues from a parked state. A corrupt file restarts from zero.
    pub fn resume(&self) -> Result<(), ControlError> {
        let mut c = self.inner.control();
        if c.corruption_pending {
            return Err(ControlError::InvalidTransition {
                op: "resume",
                from: c.state,
            });
        }
        if !c.state.is_resumable() {
            if c.state.is_terminal() {
                return Err(ControlError::Terminal(c.state));
            }
            return Err(ControlError::InvalidTransition {
                op: "resume",
                from: c.state,
            });
        }
        let wipe_first = c.state == DownloadState::CorruptFile;
        self.spawn_runner(&mut c, wipe_first);
        drop(c);
        self.inner.announce(DownloadState::Connecting);
        Ok(())
    }

    /// Abandons the download. Downloaded bytes stay on disk.
    pub fn stop(&self) -> Result<(), ControlError> {
        let mut c = self.inner.control();
        match c.state {
            DownloadState::Aborted => return Ok(()),
            s if s.is_terminal() => return Err(ControlError::Terminal(s)),
            DownloadState::Saving => {
                return Err(ControlError::InvalidTransition {
                    op: "stop",
                    from: DownloadState::Saving,
                });
            }
            _ => {}
        }
        if let Some(runner) = &c.runner {
            runner.cancel.cancel();
        }
        c.state = DownloadState::Aborted;
        c.corruption_pending = false;
        c.expected_exit = None;
        drop(c);
        self.inner.announce(DownloadState::Aborted);
        Ok(())
    }

    /// Stops the running loop without recording a state change, and waits
    /// for every worker to hand back its lease. Used at shutdown so that
    /// the stored state still says what was running.
    pub async fn halt(&self) {
        let runner = self.inner.control().runner.take();
        if let Some(runner) = runner {
            runner.cancel.cancel();
            if let Err(err) = runner.handle.await {
                tracing::warn!(download = %self.inner.id, error = %err, "session task failed");
            }
        }
        self.inner.ctx.blocks.wait_for_outstanding_writes().await;
    }

    fn spawn_runner(&self, c: &mut Control, wipe_first: bool) {
        if let Some(old) = c.runner.take() {
            old.cancel.cancel();
        }
        let cancel = CancellationToken::new();
        c.state = DownloadState::Connecting;
        c.corruption_pending = false;
        c.expected_exit = None;
        let run = SessionRun {
            inner: self.inner.clone(),
            scope: cancel.child_token(),
            cancel: cancel.clone(),
            workers: JoinSet::new(),
            keep_corrupt: false,
        };
        let handle = tokio::spawn(run.run(wipe_first));
        c.runner = Some(Runner { cancel, handle });
    }

    /// Offers newly discovered sources. Returns how many were new.
    pub fn add_candidate_sources(&self, sources: Vec<RemoteSource>) -> usize {
        let ctx = &self.inner.ctx;
        let mut added = 0usize;
        let mut conflicts = 0usize;
        for source in sources {
            match ctx.ranker.add_to_pool(source) {
                AddOutcome::Added => added += 1,
                AddOutcome::Duplicate => {}
                AddOutcome::Conflict => conflicts += 1,
            }
        }
        if added > 0 {
            ctx.changed.notify_one();
        }
        tracing::debug!(download = %self.inner.id, added, conflicts, "candidate sources offered");
        self.inner.publish();
        added
    }

    /// Hands an inbound push connection to the worker waiting for it.
    pub fn accept_inbound_connection(
        &self,
        file_name: &str,
        file_index: u64,
        source_id: &str,
        stream: BoxedStream,
    ) -> bool {
        self.inner
            .ctx
            .push
            .accept_inbound(file_name, file_index, source_id, stream)
    }

    /// Current persistent form of the session.
    pub fn record(&self) -> SessionRecord {
        let (state, last_error) = {
            let c = self.inner.control();
            (c.state, c.last_error.clone())
        };
        let ctx = &self.inner.ctx;
        SessionRecord {
            version: SESSION_RECORD_VERSION,
            id: self.inner.id,
            file_name: ctx.file_name.clone(),
            file_size: ctx.blocks.file_size(),
            content_hash: ctx.content_hash,
            state,
            blocks: ctx.blocks.snapshot(),
            sources: ctx.ranker.snapshot(),
            last_error,
            created_unix_secs: self.inner.created_unix_secs,
            updated_unix_secs: store::unix_now(),
        }
    }
}

fn placeholder_status(id: DownloadId, ctx: &SwarmContext, state: DownloadState) -> SessionStatus {
    SessionStatus {
        id,
        file_name: ctx.file_name.clone(),
        file_size: ctx.blocks.file_size(),
        state,
        expected_exit_unix_secs: None,
        blocks: BlockCounts::default(),
        workers: WorkerCounts::default(),
        sources: PoolCounts::default(),
        bandwidth: 0.0,
        eta_secs: None,
        corruption_pending: false,
        last_error: None,
        final_path: None,
    }
}

fn unix_at(now: Instant, at: Instant) -> u64 {
    store::unix_now() + at.saturating_duration_since(now).as_secs()
}

/// The loop behind one `start`/`resume`. Its state changes are dropped once
/// it has been cancelled, so a pause or stop always wins.
struct SessionRun {
    inner: Arc<SessionInner>,
    cancel: CancellationToken,
    /// Parent of all worker tokens; replaced after each drain.
    scope: CancellationToken,
    workers: JoinSet<WorkerReport>,
    keep_corrupt: bool,
}

impl SessionRun {
    fn set_state(&self, state: DownloadState) -> bool {
        {
            let mut c = self.inner.control();
            if self.cancel.is_cancelled() {
                return false;
            }
            if c.state == state {
                drop(c);
                self.inner.publish();
                return true;
            }
            c.state = state;
            if !matches!(state, DownloadState::Busy | DownloadState::IterativeLocating) {
                c.expected_exit = None;
            }
        }
        self.inner.announce(state);
        true
    }

    fn set_expected_exit(&self, at: Option<u64>) {
        self.inner.control().expected_exit = at;
    }

    fn fail(&self, err: &BlockStateError) {
        let state = match err {
            BlockStateError::DiskFailed { .. } | BlockStateError::Closed => DownloadState::DiskProblem,
            _ => DownloadState::Aborted,
        };
        tracing::error!(download = %self.inner.id, error = %err, ?state, "download failed");
        self.inner.control().last_error = Some(err.to_string());
        self.set_state(state);
    }

    fn fail_store(&self, err: &DownloadStoreError) {
        tracing::error!(download = %self.inner.id, error = %err, "download failed");
        self.inner.control().last_error = Some(err.to_string());
        self.set_state(DownloadState::DiskProblem);
    }

    async fn run(mut self, wipe_first: bool) {
        let ctx = self.inner.ctx.clone();
        if wipe_first {
            tracing::info!(download = %self.inner.id, "restarting corrupt download from scratch");
            if let Err(err) = ctx.blocks.wipe().await {
                self.fail(&err);
                return;
            }
        }
        let mut locating_since: Option<Instant> = None;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(err) = ctx.blocks.fault() {
                self.drain_workers().await;
                self.fail(&err);
                return;
            }
            if ctx.blocks.is_hopeless() && !self.keep_corrupt {
                self.drain_workers().await;
                match self.ask_corruption().await {
                    Some(CorruptionDecision::Keep) => {
                        self.keep_corrupt = true;
                        continue;
                    }
                    Some(CorruptionDecision::Discard) => {
                        self.discard().await;
                        return;
                    }
                    None => break,
                }
            }
            if ctx.blocks.is_complete() {
                self.drain_workers().await;
                self.finish().await;
                return;
            }

            self.spawn_workers();
            let now = Instant::now();
            let mut wait = ctx.config.idle_wait;
            let workers = ctx.worker_counts();
            if workers.total() > 0 {
                locating_since = None;
                let state = if workers.downloading > 0 {
                    DownloadState::Downloading
                } else if workers.queued > 0 {
                    DownloadState::RemoteQueued
                } else {
                    DownloadState::Connecting
                };
                self.set_state(state);
            } else {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = ctx.blocks.wait_for_outstanding_writes() => {}
                }
                if ctx.blocks.is_complete() || ctx.blocks.fault().is_some() {
                    continue;
                }
                let pool = ctx.ranker.counts(now);
                if pool.eligible > 0 {
                    locating_since = None;
                    self.set_state(DownloadState::WaitingForConnections);
                } else if pool.busy > 0 {
                    locating_since = None;
                    let until = ctx.ranker.next_retry(now);
                    self.set_expected_exit(until.map(|t| unix_at(now, t)));
                    if let Some(t) = until {
                        wait = wait.min(t.saturating_duration_since(now).max(Duration::from_millis(10)));
                    }
                    self.set_state(DownloadState::Busy);
                } else {
                    let since = *locating_since.get_or_insert_with(|| {
                        ctx.mesh.locate_more(ctx.content_hash, &ctx.file_name);
                        now
                    });
                    let deadline = since + ctx.config.locate_wait;
                    if now >= deadline {
                        tracing::info!(download = %self.inner.id, "no sources found; giving up");
                        self.set_state(DownloadState::GaveUp);
                        return;
                    }
                    wait = wait.min(deadline - now);
                    self.set_expected_exit(Some(unix_at(now, deadline)));
                    self.set_state(DownloadState::IterativeLocating);
                }
            }
            if !self.wait_for_change(wait).await {
                break;
            }
        }
        self.drain_workers().await;
        self.inner.publish();
    }

    /// Starts workers while capacity, connection slots, sources and work
    /// remain.
    fn spawn_workers(&mut self) {
        let ctx = self.inner.ctx.clone();
        let cap = ctx.config.swarm_capacity.max(1);
        loop {
            let counts = ctx.worker_counts();
            if counts.active() >= cap || counts.total() >= cap * 2 {
                return;
            }
            if !ctx.has_work() {
                return;
            }
            let Ok(permit) = ctx.slots.clone().try_acquire_owned() else {
                return;
            };
            let Some(source) = ctx.ranker.get_best(Instant::now()) else {
                return;
            };
            let worker = SourceWorker::new(ctx.clone(), source, self.scope.child_token(), Some(permit));
            tracing::debug!(download = %self.inner.id, worker = %worker.id(), "worker started");
            self.workers.spawn(worker.run());
        }
    }

    /// Returns false once cancelled.
    async fn wait_for_change(&mut self, limit: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            Some(res) = self.workers.join_next(), if !self.workers.is_empty() => {
                self.on_report(res);
                true
            }
            _ = self.inner.ctx.changed.notified() => true,
            _ = tokio::time::sleep(limit) => true,
        }
    }

    fn on_report(&self, res: Result<WorkerReport, JoinError>) {
        let ranker = &self.inner.ctx.ranker;
        match res {
            Ok(report) => match report.disposition {
                Disposition::Forget => {
                    tracing::debug!(source = %report.source.address(), "dropping source");
                    ranker.forget(&report.source.key());
                }
                _ => ranker.return_source(report.source),
            },
            Err(err) => {
                tracing::error!(download = %self.inner.id, error = %err, "worker task failed");
            }
        }
        self.inner.publish();
    }

    /// Cancels every worker and waits until each has returned its source
    /// and released its lease.
    async fn drain_workers(&mut self) {
        self.scope.cancel();
        while let Some(res) = self.workers.join_next().await {
            self.on_report(res);
        }
        self.scope = self.cancel.child_token();
    }

    async fn ask_corruption(&mut self) -> Option<CorruptionDecision> {
        let lost = self.inner.ctx.blocks.counts().lost;
        self.inner.ctx.emit(SessionEvent::CorruptionDetected { lost_bytes: lost });
        self.inner.control().corruption_pending = true;
        if !self.set_state(DownloadState::WaitingForUser) {
            return None;
        }
        let status = self.inner.status();
        let handler = self.inner.handler.clone();
        let decision = tokio::select! {
            _ = self.cancel.cancelled() => None,
            d = handler.on_corruption_detected(&status) => Some(d),
        };
        self.inner.control().corruption_pending = false;
        self.inner.publish();
        tracing::info!(download = %self.inner.id, ?decision, "corruption decision");
        decision
    }

    async fn discard(&mut self) {
        if let Err(err) = self.inner.ctx.blocks.wipe().await {
            self.fail(&err);
            return;
        }
        self.set_state(DownloadState::CorruptFile);
    }

    /// Hashing, then moving the file into place.
    async fn finish(&mut self) {
        let ctx = self.inner.ctx.clone();
        if !self.set_state(DownloadState::Hashing) {
            return;
        }
        if let Err(err) = ctx.blocks.sync().await {
            self.fail(&err);
            return;
        }
        if let Some(expected) = ctx.content_hash {
            let hashed = tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = store::hash_file(ctx.blocks.path()) => res,
            };
            match hashed {
                Ok(actual) if actual == expected => {}
                Ok(actual) => {
                    tracing::warn!(
                        download = %self.inner.id,
                        expected = %expected.to_hex(),
                        actual = %actual.to_hex(),
                        "whole-file hash mismatch"
                    );
                    match self.ask_corruption().await {
                        Some(CorruptionDecision::Keep) => {}
                        Some(CorruptionDecision::Discard) => {
                            self.discard().await;
                            return;
                        }
                        None => return,
                    }
                }
                Err(err) => {
                    self.fail_store(&err);
                    return;
                }
            }
        }

        if !self.set_state(DownloadState::Saving) {
            return;
        }
        let final_path =
            match store::finalize_download(ctx.blocks.path(), &self.inner.complete_dir, &ctx.file_name)
                .await
            {
                Ok(path) => path,
                Err(err) => {
                    self.fail_store(&err);
                    return;
                }
            };
        if let Some(known) = &self.inner.known_files {
            let entry = KnownFileEntry {
                file_name: ctx.file_name.clone(),
                file_size: ctx.blocks.file_size(),
                content_hash: ctx.content_hash,
                completed_unix_secs: store::unix_now(),
            };
            if let Err(err) = store::append_known_entry(known, entry).await {
                tracing::warn!(path = %known.display(), error = %err, "failed to update known files");
            }
        }
        self.inner.control().final_path = Some(final_path.clone());
        let status = self.inner.status();
        self.inner.handler.on_completed(&status, &final_path).await;
        ctx.emit(SessionEvent::Completed { path: final_path });
        self.set_state(DownloadState::Complete);
    }
}
