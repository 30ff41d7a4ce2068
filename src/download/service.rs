use crate::download::errors::{DownloadError, DownloadStoreError};
use crate::download::hash_tree::ContentHash;
use crate::download::session::{
    DownloadSession, SessionConfig, SessionDeps, SessionParams, SessionStatus,
};
use crate::download::source::RemoteSource;
use crate::download::store::{self, RecoveredSession};
use crate::download::types::{DownloadId, DownloadState};
use crate::net::BoxedStream;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

pub type Result<T> = std::result::Result<T, DownloadError>;

#[derive(Debug, Clone)]
pub struct DownloadServiceConfig {
    /// Session records and part files.
    pub download_dir: PathBuf,
    /// Finished files.
    pub incoming_dir: PathBuf,
    pub known_files: PathBuf,
    pub persist_every: Duration,
    /// Resume recovered sessions that were running at shutdown.
    pub auto_resume: bool,
    pub session: SessionConfig,
}

impl DownloadServiceConfig {
    pub fn from_data_dir(data_dir: &Path) -> Self {
        Self {
            download_dir: data_dir.join("download"),
            incoming_dir: data_dir.join("incoming"),
            known_files: data_dir.join("known_files.json"),
            persist_every: Duration::from_secs(30),
            auto_resume: true,
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadServiceStatus {
    pub running: bool,
    pub sessions: usize,
    pub active: usize,
    pub recovered_on_start: usize,
    pub started_at: Instant,
}

/// Request to fetch a new file.
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub file_name: String,
    pub file_size: u64,
    pub content_hash: Option<ContentHash>,
    pub sources: Vec<RemoteSource>,
    /// Start fetching right away instead of parking the session paused.
    pub start: bool,
}

pub enum DownloadCommand {
    Ping {
        reply: oneshot::Sender<()>,
    },
    Add {
        download: NewDownload,
        reply: oneshot::Sender<Result<DownloadId>>,
    },
    AddSources {
        id: DownloadId,
        sources: Vec<RemoteSource>,
        reply: oneshot::Sender<Result<usize>>,
    },
    Pause {
        id: DownloadId,
        reply: oneshot::Sender<Result<()>>,
    },
    Resume {
        id: DownloadId,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        id: DownloadId,
        reply: oneshot::Sender<Result<()>>,
    },
    Session {
        id: DownloadId,
        reply: oneshot::Sender<Result<DownloadSession>>,
    },
    List {
        reply: oneshot::Sender<Vec<SessionStatus>>,
    },
    /// A firewalled source connected back to us after a push request.
    InboundPush {
        file_name: String,
        file_index: u64,
        source_id: String,
        stream: BoxedStream,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl std::fmt::Debug for DownloadCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ping { .. } => "Ping",
            Self::Add { .. } => "Add",
            Self::AddSources { .. } => "AddSources",
            Self::Pause { .. } => "Pause",
            Self::Resume { .. } => "Resume",
            Self::Stop { .. } => "Stop",
            Self::Session { .. } => "Session",
            Self::List { .. } => "List",
            Self::InboundPush { .. } => "InboundPush",
            Self::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub struct DownloadServiceHandle {
    tx: mpsc::Sender<DownloadCommand>,
}

impl DownloadServiceHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> DownloadCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    pub async fn ping(&self) -> Result<()> {
        self.call(|reply| DownloadCommand::Ping { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| DownloadCommand::Shutdown { reply }).await
    }

    pub async fn add(&self, download: NewDownload) -> Result<DownloadId> {
        self.call(|reply| DownloadCommand::Add { download, reply })
            .await?
    }

    pub async fn add_sources(&self, id: DownloadId, sources: Vec<RemoteSource>) -> Result<usize> {
        self.call(|reply| DownloadCommand::AddSources { id, sources, reply })
            .await?
    }

    pub async fn pause(&self, id: DownloadId) -> Result<()> {
        self.call(|reply| DownloadCommand::Pause { id, reply }).await?
    }

    pub async fn resume(&self, id: DownloadId) -> Result<()> {
        self.call(|reply| DownloadCommand::Resume { id, reply }).await?
    }

    pub async fn stop(&self, id: DownloadId) -> Result<()> {
        self.call(|reply| DownloadCommand::Stop { id, reply }).await?
    }

    pub async fn session(&self, id: DownloadId) -> Result<DownloadSession> {
        self.call(|reply| DownloadCommand::Session { id, reply })
            .await?
    }

    pub async fn list(&self) -> Result<Vec<SessionStatus>> {
        self.call(|reply| DownloadCommand::List { reply }).await
    }

    pub async fn inbound_push(
        &self,
        file_name: String,
        file_index: u64,
        source_id: String,
        stream: BoxedStream,
    ) -> Result<bool> {
        self.call(|reply| DownloadCommand::InboundPush {
            file_name,
            file_index,
            source_id,
            stream,
            reply,
        })
        .await
    }
}

pub async fn start_service(
    cfg: DownloadServiceConfig,
    deps: SessionDeps,
) -> Result<(
    DownloadServiceHandle,
    watch::Receiver<DownloadServiceStatus>,
    tokio::task::JoinHandle<Result<()>>,
)> {
    ensure_dirs(&cfg).await?;
    let recovered = store::scan_recoverable_sessions(&cfg.download_dir).await?;
    let recovered_count = recovered.len();

    let mut service = Service {
        cfg,
        deps,
        sessions: BTreeMap::new(),
    };
    for entry in recovered {
        service.recover(entry).await;
    }

    let (tx, rx) = mpsc::channel(128);
    let started_at = Instant::now();
    let (status_tx, status_rx) = watch::channel(DownloadServiceStatus {
        running: true,
        sessions: service.sessions.len(),
        active: service.active_count(),
        recovered_on_start: recovered_count,
        started_at,
    });
    let join = tokio::spawn(service.run(rx, status_tx));
    Ok((DownloadServiceHandle { tx }, status_rx, join))
}

async fn ensure_dirs(cfg: &DownloadServiceConfig) -> Result<()> {
    for dir in [&cfg.download_dir, &cfg.incoming_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| DownloadStoreError::EnsureDir {
                path: dir.clone(),
                source,
            })?;
    }
    Ok(())
}

struct Entry {
    session: DownloadSession,
    /// Record already removed from disk after completion.
    retired: bool,
}

struct Service {
    cfg: DownloadServiceConfig,
    deps: SessionDeps,
    sessions: BTreeMap<DownloadId, Entry>,
}

impl Service {
    fn params(&self, mut params: SessionParams) -> SessionParams {
        params.known_files = Some(self.cfg.known_files.clone());
        params
    }

    async fn recover(&mut self, entry: RecoveredSession) {
        let RecoveredSession {
            record_path,
            part_path,
            record,
            source,
        } = entry;
        if record.state == DownloadState::Complete {
            if let Err(err) = store::remove_record(&record_path).await {
                tracing::warn!(path = %record_path.display(), error = %err, "failed to remove stale record");
            }
            return;
        }
        let was_running = record.state.is_active();
        let id = record.id;
        let params = self.params(SessionParams::from_record(
            record,
            part_path,
            self.cfg.incoming_dir.clone(),
        ));
        let session =
            match DownloadSession::open(params, self.cfg.session.clone(), self.deps.clone()).await {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(download = %id, error = %err, "failed to reopen recovered download");
                    return;
                }
            };
        tracing::info!(
            download = %id,
            file = %session.status().file_name,
            from = ?source,
            state = ?session.state(),
            "recovered download"
        );
        if was_running
            && self.cfg.auto_resume
            && let Err(err) = session.resume()
        {
            tracing::warn!(download = %id, error = %err, "failed to resume recovered download");
        }
        self.sessions.insert(
            id,
            Entry {
                session,
                retired: false,
            },
        );
    }

    fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|e| e.session.state().is_active())
            .count()
    }

    fn get(&self, id: DownloadId) -> Result<&DownloadSession> {
        self.sessions
            .get(&id)
            .map(|e| &e.session)
            .ok_or(DownloadError::UnknownDownload(id))
    }

    async fn add(&mut self, download: NewDownload) -> Result<DownloadId> {
        let id = store::allocate_next_id(&self.cfg.download_dir).await?;
        let mut params = self.params(SessionParams::new(
            id,
            download.file_name,
            download.file_size,
            store::part_path_for(&self.cfg.download_dir, id),
            self.cfg.incoming_dir.clone(),
        ));
        params.content_hash = download.content_hash;
        params.sources = download.sources;
        let session = DownloadSession::open(params, self.cfg.session.clone(), self.deps.clone()).await?;
        store::save_record(&store::record_path_for(&self.cfg.download_dir, id), &session.record())
            .await?;
        if download.start {
            session.start()?;
        }
        tracing::info!(download = %id, file = %session.status().file_name, "download added");
        self.sessions.insert(
            id,
            Entry {
                session,
                retired: false,
            },
        );
        Ok(id)
    }

    /// Writes every live record; drops the record of finished downloads.
    async fn persist_all(&mut self) {
        let dir = self.cfg.download_dir.clone();
        for (id, entry) in self.sessions.iter_mut() {
            if entry.retired {
                continue;
            }
            let path = store::record_path_for(&dir, *id);
            if entry.session.state() == DownloadState::Complete {
                match store::remove_record(&path).await {
                    Ok(()) => entry.retired = true,
                    Err(err) => {
                        tracing::warn!(download = %id, error = %err, "failed to remove finished record");
                    }
                }
                continue;
            }
            if let Err(err) = store::save_record(&path, &entry.session.record()).await {
                tracing::warn!(download = %id, error = %err, "failed to persist download");
            }
        }
    }

    fn status(&self, running: bool, recovered: usize, started_at: Instant) -> DownloadServiceStatus {
        DownloadServiceStatus {
            running,
            sessions: self.sessions.len(),
            active: self.active_count(),
            recovered_on_start: recovered,
            started_at,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<DownloadCommand>,
        status_tx: watch::Sender<DownloadServiceStatus>,
    ) -> Result<()> {
        let (recovered, started_at) = {
            let st = status_tx.borrow();
            (st.recovered_on_start, st.started_at)
        };
        let mut persist = tokio::time::interval(self.cfg.persist_every.max(Duration::from_millis(10)));
        persist.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        persist.tick().await;

        loop {
            let cmd = tokio::select! {
                cmd = rx.recv() => cmd,
                _ = persist.tick() => {
                    self.persist_all().await;
                    let _ = status_tx.send(self.status(true, recovered, started_at));
                    continue;
                }
            };
            let Some(cmd) = cmd else {
                break;
            };
            tracing::trace!(?cmd, "download command");
            match cmd {
                DownloadCommand::Ping { reply } => {
                    let _ = reply.send(());
                }
                DownloadCommand::Add { download, reply } => {
                    let res = self.add(download).await;
                    let _ = reply.send(res);
                }
                DownloadCommand::AddSources { id, sources, reply } => {
                    let res = self.get(id).map(|s| s.add_candidate_sources(sources));
                    let _ = reply.send(res);
                }
                DownloadCommand::Pause { id, reply } => {
                    let res = self.get(id).and_then(|s| s.pause().map_err(DownloadError::from));
                    let _ = reply.send(res);
                }
                DownloadCommand::Resume { id, reply } => {
                    let res = self.get(id).and_then(|s| s.resume().map_err(DownloadError::from));
                    let _ = reply.send(res);
                }
                DownloadCommand::Stop { id, reply } => {
                    let res = self.get(id).and_then(|s| s.stop().map_err(DownloadError::from));
                    let _ = reply.send(res);
                }
                DownloadCommand::Session { id, reply } => {
                    let _ = reply.send(self.get(id).cloned());
                }
                DownloadCommand::List { reply } => {
                    let list = self.sessions.values().map(|e| e.session.status()).collect();
                    let _ = reply.send(list);
                }
                DownloadCommand::InboundPush {
                    file_name,
                    file_index,
                    source_id,
                    stream,
                    reply,
                } => {
                    let matched =
                        self.deps
                            .push
                            .accept_inbound(&file_name, file_index, &source_id, stream);
                    let _ = reply.send(matched);
                }
                DownloadCommand::Shutdown { reply } => {
                    self.halt_all().await;
                    let _ = status_tx.send(self.status(false, recovered, started_at));
                    let _ = reply.send(());
                    return Ok(());
                }
            }
            let _ = status_tx.send(self.status(true, recovered, started_at));
        }

        self.halt_all().await;
        let _ = status_tx.send(self.status(false, recovered, started_at));
        Ok(())
    }

    async fn halt_all(&mut self) {
        for entry in self.sessions.values() {
            entry.session.halt().await;
        }
        self.persist_all().await;
        tracing::info!(sessions = self.sessions.len(), "download service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::session::SessionDeps;
    use crate::net::TcpConnector;
    use std::sync::Arc;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("rust-swarm-download-{tag}-{nanos}"));
        p
    }

    fn deps() -> SessionDeps {
        SessionDeps::new(Arc::new(TcpConnector))
    }

    fn new_download(name: &str, size: u64) -> NewDownload {
        NewDownload {
            file_name: name.to_string(),
            file_size: size,
            content_hash: None,
            sources: Vec::new(),
            start: false,
        }
    }

    #[tokio::test]
    async fn start_service_creates_download_and_incoming_dirs() {
        let root = temp_dir("dirs");
        let cfg = DownloadServiceConfig::from_data_dir(&root);
        let (handle, _status_rx, join) = start_service(cfg.clone(), deps()).await.expect("start");

        assert!(cfg.download_dir.exists());
        assert!(cfg.incoming_dir.exists());

        handle.shutdown().await.expect("shutdown");
        join.await.expect("join").expect("service");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn service_add_control_and_shutdown_flow() {
        let root = temp_dir("flow");
        let cfg = DownloadServiceConfig::from_data_dir(&root);
        let (handle, mut status_rx, join) = start_service(cfg.clone(), deps()).await.expect("start");

        handle.ping().await.expect("ping");
        assert!(status_rx.borrow().running);
        assert_eq!(status_rx.borrow().sessions, 0);

        let id = handle.add(new_download("a.bin", 1000)).await.expect("add");
        assert_eq!(id, DownloadId(1));
        assert!(store::record_path_for(&cfg.download_dir, id).exists());
        let list = handle.list().await.expect("list");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].state, DownloadState::Paused);

        let added = handle
            .add_sources(id, vec![RemoteSource::new("127.0.0.1", 9, "a.bin", 1000)])
            .await
            .expect("sources");
        assert_eq!(added, 1);
        handle.stop(id).await.expect("stop");
        assert!(matches!(
            handle.resume(id).await,
            Err(DownloadError::Control(_))
        ));
        assert!(matches!(
            handle.pause(DownloadId(42)).await,
            Err(DownloadError::UnknownDownload(DownloadId(42)))
        ));

        handle.shutdown().await.expect("shutdown");
        status_rx.changed().await.expect("status changed");
        assert!(!status_rx.borrow().running);
        join.await.expect("join").expect("service");

        let (record, _) = store::load_record_with_fallback(&store::record_path_for(&cfg.download_dir, id))
            .await
            .expect("record");
        assert_eq!(record.state, DownloadState::Aborted);
        assert_eq!(record.sources.len(), 1);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn service_recovers_stored_sessions_on_start() {
        let root = temp_dir("recover");
        let mut cfg = DownloadServiceConfig::from_data_dir(&root);
        cfg.auto_resume = false;
        {
            let (handle, _status_rx, join) = start_service(cfg.clone(), deps()).await.expect("start");
            handle.add(new_download("a.bin", 10)).await.expect("add a");
            handle.add(new_download("b.bin", 20)).await.expect("add b");
            handle.shutdown().await.expect("shutdown");
            join.await.expect("join").expect("service");
        }

        let (handle, status_rx, join) = start_service(cfg, deps()).await.expect("restart");
        assert_eq!(status_rx.borrow().sessions, 2);
        assert_eq!(status_rx.borrow().recovered_on_start, 2);
        let names: Vec<String> = handle
            .list()
            .await
            .expect("list")
            .into_iter()
            .map(|s| s.file_name)
            .collect();
        assert_eq!(names, vec!["a.bin".to_string(), "b.bin".to_string()]);
        let next = handle.add(new_download("c.bin", 5)).await.expect("add c");
        assert_eq!(next, DownloadId(3));

        handle.shutdown().await.expect("shutdown");
        join.await.expect("join").expect("service");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn unmatched_push_is_refused() {
        let root = temp_dir("push");
        let cfg = DownloadServiceConfig::from_data_dir(&root);
        let (handle, _status_rx, join) = start_service(cfg, deps()).await.expect("start");
        let (a, _b) = tokio::io::duplex(64);
        let matched = handle
            .inbound_push("a.bin".to_string(), 0, "abcd".to_string(), Box::new(a))
            .await
            .expect("push");
        assert!(!matched);
        handle.shutdown().await.expect("shutdown");
        join.await.expect("join").expect("service");
        let _ = std::fs::remove_dir_all(&root);
    }
}
