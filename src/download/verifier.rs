use crate::download::block_state::{Result, Shared};
use crate::download::errors::BlockStateError;
use crate::download::interval::Interval;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

pub(crate) enum WriterJob {
    Write {
        interval: Interval,
        data: Vec<u8>,
    },
    /// Verify every chunk already wholly in partial.
    Reverify,
    Sync {
        reply: oneshot::Sender<Result<()>>,
    },
    Wipe {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Owns the backing file. Applies queued writes in order, then hashes every
/// chunk a write completed and promotes or demotes it.
pub(crate) struct ChunkVerifier {
    shared: Arc<Shared>,
    file: tokio::fs::File,
}

impl ChunkVerifier {
    pub(crate) fn new(shared: Arc<Shared>, file: tokio::fs::File) -> Self {
        Self { shared, file }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WriterJob>) {
        while let Some(job) = rx.recv().await {
            match job {
                WriterJob::Write { interval, data } => self.handle_write(interval, &data).await,
                WriterJob::Reverify => {
                    let ready = self.shared.ledger().ready_chunks();
                    self.verify(ready).await;
                }
                WriterJob::Sync { reply } => {
                    let res = self.sync().await;
                    let _ = reply.send(res);
                }
                WriterJob::Wipe { reply } => {
                    let res = self.wipe().await;
                    let _ = reply.send(res);
                }
            }
            self.shared.ledger().note_job_done();
            self.shared.notify();
        }
        tracing::debug!(path = %self.shared.path().display(), "chunk writer stopped");
    }

    async fn handle_write(&mut self, interval: Interval, data: &[u8]) {
        if self.shared.ledger().fault().is_some() {
            return;
        }
        if let Err(err) = self.write_at(interval.low, data).await {
            self.fail(err);
            return;
        }
        let ready = {
            let mut ledger = self.shared.ledger();
            match ledger.finish_write(interval) {
                Ok(ready) => ready,
                Err(err) => {
                    tracing::error!(range = %interval, error = %err, "write completion fault");
                    ledger.record_fault(err);
                    return;
                }
            }
        };
        tracing::trace!(range = %interval, ready = ready.len(), "range written");
        self.verify(ready).await;
    }

    async fn verify(&mut self, chunks: Vec<Interval>) {
        if chunks.is_empty() {
            return;
        }
        let Some(tree) = self.shared.ledger().hash_tree() else {
            return;
        };
        for chunk in chunks {
            let mut buf = vec![0u8; chunk.len() as usize];
            if let Err(err) = self.read_at(chunk.low, &mut buf).await {
                self.fail(err);
                return;
            }
            let ok = tree.verify_chunk(tree.chunk_index(chunk.low), &buf);
            let applied = self.shared.ledger().apply_verification(chunk, ok);
            if !applied {
                continue;
            }
            if ok {
                tracing::trace!(range = %chunk, "chunk verified");
            } else {
                tracing::warn!(
                    path = %self.shared.path().display(),
                    range = %chunk,
                    "chunk failed hash verification"
                );
            }
            self.shared.notify();
        }
    }

    fn fail(&self, err: BlockStateError) {
        tracing::error!(path = %self.shared.path().display(), error = %err, "disk failure");
        self.shared.ledger().record_fault(err);
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.shared.path().to_path_buf();
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|source| BlockStateError::disk("seek", &path, source))?;
        self.file
            .write_all(data)
            .await
            .map_err(|source| BlockStateError::disk("write", &path, source))?;
        self.file
            .flush()
            .await
            .map_err(|source| BlockStateError::disk("flush", &path, source))
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let path = self.shared.path().to_path_buf();
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|source| BlockStateError::disk("seek", &path, source))?;
        self.file
            .read_exact(buf)
            .await
            .map_err(|source| BlockStateError::disk("read", &path, source))?;
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        if let Some(fault) = self.shared.ledger().fault() {
            return Err(fault.clone());
        }
        let path = self.shared.path().to_path_buf();
        self.file
            .sync_data()
            .await
            .map_err(|source| BlockStateError::disk("sync", &path, source))
    }

    async fn wipe(&mut self) -> Result<()> {
        let path = self.shared.path().to_path_buf();
        let size = self.shared.ledger().file_size();
        self.file
            .set_len(0)
            .await
            .map_err(|source| BlockStateError::disk("truncate", &path, source))?;
        self.file
            .set_len(size)
            .await
            .map_err(|source| BlockStateError::disk("set_len", &path, source))?;
        self.shared.ledger().reset()
    }
}

#[cfg(test)]
mod tests {
    use crate::download::block_state::{BlockOptions, BlockSnapshot, BlockState};
    use crate::download::hash_tree::HashTree;
    use crate::download::interval::Interval;
    use crate::download::selection::Sequential;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("rust-swarm-verifier-{tag}-{nanos}"));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    async fn open(root: &std::path::Path, size: u64, opts: BlockOptions) -> BlockState {
        BlockState::open(
            root.join("file.part"),
            size,
            opts,
            Arc::new(Sequential),
            None,
        )
        .await
        .expect("open")
    }

    #[tokio::test]
    async fn good_chunks_are_promoted_and_bytes_land_on_disk() {
        let root = temp_dir("good");
        let data = content(8192);
        let state = open(&root, 8192, BlockOptions::default()).await;
        state
            .set_hash_tree(HashTree::build(&data, 2048).expect("tree"))
            .expect("tree");

        let iv = state.lease_white(None, 8192).expect("lease");
        assert_eq!(iv, Interval::new(0, 8191));
        state
            .write(iv, data.clone())
            .expect("write");
        state.wait_for_outstanding_writes().await;

        assert!(state.is_complete());
        assert_eq!(state.counts().verified, 8192);
        state.sync().await.expect("sync");
        let on_disk = tokio::fs::read(state.path()).await.expect("read");
        assert_eq!(on_disk, data);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn corrupt_chunk_is_counted_and_freed_for_release() {
        let root = temp_dir("corrupt");
        let data = content(8192);
        let state = open(&root, 8192, BlockOptions::default()).await;
        state
            .set_hash_tree(HashTree::build(&data, 2048).expect("tree"))
            .expect("tree");

        let iv = state.lease_white(None, 2048).expect("lease");
        let mut bad = data[..2048].to_vec();
        bad[100] ^= 0x55;
        state.write(iv, bad).expect("write");
        state.wait_for_outstanding_writes().await;

        let counts = state.counts();
        assert_eq!(counts.corrupt, 2048);
        assert_eq!(counts.lost, 2048);
        assert_eq!(counts.verified, 0);
        assert!(state.free().contains(&iv));
        assert_eq!(state.lease_white(None, 2048).expect("re-lease"), iv);
        assert!(state.sets().is_partitioned());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn late_tree_triggers_one_verification_pass() {
        let root = temp_dir("late-tree");
        let data = content(4096);
        let state = open(&root, 4096, BlockOptions::default()).await;

        let iv = state.lease_white(None, 4096).expect("lease");
        let mut written = data.clone();
        written[3000] ^= 0xff;
        state.write(iv, written).expect("write");
        state.wait_for_outstanding_writes().await;
        assert!(state.is_complete());

        let pass = state
            .set_hash_tree(HashTree::build(&data, 1024).expect("tree"))
            .expect("tree");
        assert!(pass);
        state.wait_for_outstanding_writes().await;
        let counts = state.counts();
        assert_eq!(counts.verified, 3072);
        assert_eq!(counts.corrupt, 1024);
        assert!(!state.is_complete());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn reopening_with_partial_snapshot_verifies_ready_chunks() {
        let root = temp_dir("reopen");
        let data = content(4096);
        tokio::fs::write(root.join("file.part"), &data)
            .await
            .expect("seed");
        let snap = BlockSnapshot {
            partial: [Interval::new(0, 4095)].into_iter().collect(),
            hash_tree: Some(HashTree::build(&data, 1024).expect("tree")),
            ..BlockSnapshot::default()
        };
        let state = BlockState::open(
            root.join("file.part"),
            4096,
            BlockOptions::default(),
            Arc::new(Sequential),
            Some(snap),
        )
        .await
        .expect("open");
        state.wait_for_outstanding_writes().await;
        assert!(state.is_complete());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn wipe_forgets_everything() {
        let root = temp_dir("wipe");
        let data = content(2048);
        let state = open(&root, 2048, BlockOptions::default()).await;
        let iv = state.lease_white(None, 2048).expect("lease");
        state.write(iv, data).expect("write");
        state.wait_for_outstanding_writes().await;
        assert!(state.is_complete());

        state.wipe().await.expect("wipe");
        assert_eq!(state.counts().verified, 0);
        assert_eq!(state.free().size(), 2048);
        let on_disk = tokio::fs::read(state.path()).await.expect("read");
        assert!(on_disk.iter().all(|b| *b == 0));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lease_write_release_never_overlaps() {
        let root = temp_dir("concurrent");
        let size = 200_000u64;
        let data = Arc::new(content(size as usize));
        let state = open(&root, size, BlockOptions::default()).await;

        let mut tasks = Vec::new();
        for t in 0..8u64 {
            let state = state.clone();
            let data = data.clone();
            tasks.push(tokio::spawn(async move {
                let mut n = 0u64;
                while let Ok(iv) = state.lease_white(None, 1000 + t * 337) {
                    assert!(state.sets().is_partitioned());
                    n += 1;
                    if n % 5 == 0 {
                        state.release(iv).expect("release");
                        tokio::task::yield_now().await;
                        continue;
                    }
                    let bytes = data[iv.low as usize..=iv.high as usize].to_vec();
                    state.write(iv, bytes).expect("write");
                    tokio::task::yield_now().await;
                }
            }));
        }
        for t in tasks {
            t.await.expect("join");
        }
        state.wait_for_outstanding_writes().await;
        assert!(state.sets().is_partitioned());
        assert!(state.sets().leased.is_empty());
        assert!(state.is_complete());
        let _ = std::fs::remove_dir_all(root);
    }
}
