use crate::download::block_state::BlockSnapshot;
use crate::download::errors::DownloadStoreError;
use crate::download::hash_tree::{ContentHash, ContentHasher};
use crate::download::interval::IntervalSet;
use crate::download::source::RemoteSource;
use crate::download::types::{DownloadId, DownloadState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, DownloadStoreError>;

pub const SESSION_RECORD_VERSION: u32 = 2;
const RECORD_SUFFIX: &str = ".swarm.met";
const PART_SUFFIX: &str = ".part";

/// Everything about one download that survives a restart. Leased and
/// pending bytes describe in-flight work and are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub version: u32,
    pub id: DownloadId,
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub content_hash: Option<ContentHash>,
    pub state: DownloadState,
    #[serde(default)]
    pub blocks: BlockSnapshot,
    #[serde(default)]
    pub sources: Vec<RemoteSource>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_unix_secs: u64,
    pub updated_unix_secs: u64,
}

/// First on-disk layout: one flat list of downloaded bytes, no hash tree,
/// no source pool.
#[derive(Debug, Clone, Deserialize)]
struct SessionRecordV1 {
    id: DownloadId,
    file_name: String,
    file_size: u64,
    #[serde(default)]
    content_hash: Option<ContentHash>,
    state: DownloadState,
    #[serde(default)]
    downloaded: IntervalSet,
    created_unix_secs: u64,
    updated_unix_secs: u64,
}

#[derive(Debug, Deserialize)]
struct VersionHeader {
    #[serde(default = "legacy_version")]
    version: u32,
}

fn legacy_version() -> u32 {
    1
}

/// Downloaded-but-unchecked bytes of a v1 record become `partial`; they are
/// verified again once a hash tree is known, or trusted if none ever is.
fn migrate_v1(old: SessionRecordV1) -> SessionRecord {
    SessionRecord {
        version: SESSION_RECORD_VERSION,
        id: old.id,
        file_name: old.file_name,
        file_size: old.file_size,
        content_hash: old.content_hash,
        state: old.state,
        blocks: BlockSnapshot {
            partial: old.downloaded,
            ..BlockSnapshot::default()
        },
        sources: Vec::new(),
        last_error: None,
        created_unix_secs: old.created_unix_secs,
        updated_unix_secs: old.updated_unix_secs,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedRecordSource {
    Primary,
    Backup,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredSession {
    pub record_path: PathBuf,
    pub part_path: PathBuf,
    pub record: SessionRecord,
    pub source: LoadedRecordSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownFileEntry {
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub content_hash: Option<ContentHash>,
    pub completed_unix_secs: u64,
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn record_path_for(download_dir: &Path, id: DownloadId) -> PathBuf {
    download_dir.join(format!("{id}{RECORD_SUFFIX}"))
}

pub fn part_path_for(download_dir: &Path, id: DownloadId) -> PathBuf {
    download_dir.join(format!("{id}{PART_SUFFIX}"))
}

pub async fn allocate_next_id(download_dir: &Path) -> Result<DownloadId> {
    let mut used = std::collections::BTreeSet::<u32>::new();
    let mut rd =
        tokio::fs::read_dir(download_dir)
            .await
            .map_err(|source| DownloadStoreError::ReadDir {
                path: download_dir.to_path_buf(),
                source,
            })?;
    while let Some(entry) = rd
        .next_entry()
        .await
        .map_err(|source| DownloadStoreError::ReadDir {
            path: download_dir.to_path_buf(),
            source,
        })?
    {
        if let Some(num) = parse_id(&entry.path()) {
            used.insert(num);
        }
    }
    let next = (1..=u32::MAX).find(|n| !used.contains(n));
    next.map(DownloadId).ok_or_else(|| DownloadStoreError::WriteFile {
        path: download_dir.to_path_buf(),
        source: std::io::Error::other("no free download id available"),
    })
}

pub async fn save_record(path: &Path, record: &SessionRecord) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(record)
        .map_err(|source| DownloadStoreError::Serialize { source })?;

    if path.exists() {
        let bak = backup_path(path);
        tokio::fs::copy(path, &bak)
            .await
            .map_err(|source| DownloadStoreError::Copy {
                from: path.to_path_buf(),
                to: bak,
                source,
            })?;
    }

    write_atomic(path, &bytes).await
}

pub async fn load_record_with_fallback(path: &Path) -> Result<(SessionRecord, LoadedRecordSource)> {
    match load_record(path).await {
        Ok(record) => Ok((record, LoadedRecordSource::Primary)),
        Err(primary_err) => {
            let bak = backup_path(path);
            if bak.exists() {
                match load_record(&bak).await {
                    Ok(record) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %primary_err,
                            "session record unreadable; using backup"
                        );
                        Ok((record, LoadedRecordSource::Backup))
                    }
                    Err(_) => Err(primary_err),
                }
            } else {
                Err(primary_err)
            }
        }
    }
}

pub async fn remove_record(path: &Path) -> Result<()> {
    for p in [path.to_path_buf(), backup_path(path)] {
        match tokio::fs::remove_file(&p).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(DownloadStoreError::WriteFile { path: p, source }),
        }
    }
    Ok(())
}

pub async fn scan_recoverable_sessions(download_dir: &Path) -> Result<Vec<RecoveredSession>> {
    let mut out = Vec::new();
    let mut rd =
        tokio::fs::read_dir(download_dir)
            .await
            .map_err(|source| DownloadStoreError::ReadDir {
                path: download_dir.to_path_buf(),
                source,
            })?;

    while let Some(entry) = rd
        .next_entry()
        .await
        .map_err(|source| DownloadStoreError::ReadDir {
            path: download_dir.to_path_buf(),
            source,
        })?
    {
        let path = entry.path();
        if !is_primary_record_file(&path) {
            continue;
        }

        match load_record_with_fallback(&path).await {
            Ok((record, source)) => {
                out.push(RecoveredSession {
                    part_path: part_path_for(download_dir, record.id),
                    record_path: path,
                    record,
                    source,
                });
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to recover session record");
            }
        }
    }
    out.sort_by_key(|r| r.record.id);
    Ok(out)
}

pub async fn load_known_entries(path: &Path) -> Result<Vec<KnownFileEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| DownloadStoreError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_slice(&bytes).map_err(|source| DownloadStoreError::ParseKnown {
        path: path.to_path_buf(),
        source,
    })
}

/// Records a finished file. Entries are unique by content hash and size
/// (by name and size when the hash is unknown); returns false for repeats.
pub async fn append_known_entry(path: &Path, entry: KnownFileEntry) -> Result<bool> {
    let mut entries = load_known_entries(path).await?;
    let same = |e: &KnownFileEntry| {
        e.file_size == entry.file_size
            && match (e.content_hash, entry.content_hash) {
                (Some(a), Some(b)) => a == b,
                (None, None) => e.file_name == entry.file_name,
                _ => false,
            }
    };
    if entries.iter().any(same) {
        return Ok(false);
    }
    entries.push(entry);
    let bytes = serde_json::to_vec_pretty(&entries)
        .map_err(|source| DownloadStoreError::Serialize { source })?;
    write_atomic(path, &bytes).await?;
    Ok(true)
}

/// SHA-256 over the whole file.
pub async fn hash_file(path: &Path) -> Result<ContentHash> {
    use tokio::io::AsyncReadExt;
    let mut file =
        tokio::fs::File::open(path)
            .await
            .map_err(|source| DownloadStoreError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|source| DownloadStoreError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// Moves a finished file into `complete_dir` under a name that does not
/// clobber an existing file. Falls back to copy + remove across devices.
pub async fn finalize_download(part: &Path, complete_dir: &Path, file_name: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(complete_dir)
        .await
        .map_err(|source| DownloadStoreError::EnsureDir {
            path: complete_dir.to_path_buf(),
            source,
        })?;
    let target = unique_target(complete_dir, &sanitize_file_name(file_name));
    if tokio::fs::rename(part, &target).await.is_ok() {
        return Ok(target);
    }
    tokio::fs::copy(part, &target)
        .await
        .map_err(|source| DownloadStoreError::Copy {
            from: part.to_path_buf(),
            to: target.clone(),
            source,
        })?;
    tokio::fs::remove_file(part)
        .await
        .map_err(|source| DownloadStoreError::WriteFile {
            path: part.to_path_buf(),
            source,
        })?;
    Ok(target)
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "download.bin".to_string(),
        other => other.to_string(),
    }
}

fn unique_target(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, Some(e)),
        _ => (name, None),
    };
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(first)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|source| DownloadStoreError::WriteFile {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| DownloadStoreError::Rename {
            from: tmp,
            to: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

fn is_primary_record_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(RECORD_SUFFIX)
}

fn parse_id(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_suffix(RECORD_SUFFIX)
        .or_else(|| name.strip_suffix(PART_SUFFIX))?;
    if !stem.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    stem.parse::<u32>().ok()
}

fn backup_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".bak");
    PathBuf::from(s)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".tmp");
    PathBuf::from(s)
}

async fn load_record(path: &Path) -> Result<SessionRecord> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| DownloadStoreError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    let parse_err = |source| DownloadStoreError::ParseMet {
        path: path.to_path_buf(),
        source,
    };
    let header: VersionHeader = serde_json::from_slice(&bytes).map_err(parse_err)?;
    match header.version {
        1 => {
            let old: SessionRecordV1 = serde_json::from_slice(&bytes).map_err(parse_err)?;
            tracing::info!(path = %path.display(), "migrating version 1 session record");
            Ok(migrate_v1(old))
        }
        SESSION_RECORD_VERSION => serde_json::from_slice(&bytes).map_err(parse_err),
        version => Err(DownloadStoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            version,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::interval::Interval;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("rust-swarm-store-{tag}-{nanos}"));
        p
    }

    fn sample_record(id: u32) -> SessionRecord {
        let mut verified = IntervalSet::new();
        verified.add(Interval::new(0, 4095));
        SessionRecord {
            version: SESSION_RECORD_VERSION,
            id: DownloadId(id),
            file_name: format!("file-{id}.bin"),
            file_size: 12345,
            content_hash: Some(ContentHash::digest(b"content")),
            state: DownloadState::Paused,
            blocks: BlockSnapshot {
                verified,
                ..BlockSnapshot::default()
            },
            sources: vec![RemoteSource::new("10.0.0.1", 6346, format!("file-{id}.bin"), 12345)],
            last_error: None,
            created_unix_secs: 1,
            updated_unix_secs: 2,
        }
    }

    #[tokio::test]
    async fn save_and_load_record_roundtrip() {
        let root = temp_dir("roundtrip");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let path = record_path_for(&root, DownloadId(1));

        let record = sample_record(1);
        save_record(&path, &record).await.expect("save");
        let (loaded, src) = load_record_with_fallback(&path).await.expect("load");
        assert_eq!(src, LoadedRecordSource::Primary);
        assert_eq!(loaded, record);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn load_falls_back_to_backup_when_primary_is_corrupt() {
        let root = temp_dir("fallback");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let path = record_path_for(&root, DownloadId(2));

        save_record(&path, &sample_record(2)).await.expect("save");
        // Second save copies the first into the backup.
        save_record(&path, &sample_record(2)).await.expect("save again");
        tokio::fs::write(&path, b"{not-json").await.expect("write corrupt");

        let (loaded, src) = load_record_with_fallback(&path).await.expect("load");
        assert_eq!(src, LoadedRecordSource::Backup);
        assert_eq!(loaded.id, DownloadId(2));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn version_one_records_are_migrated() {
        let root = temp_dir("migrate");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let path = record_path_for(&root, DownloadId(7));
        let v1 = serde_json::json!({
            "id": 7,
            "file_name": "old.bin",
            "file_size": 1000,
            "state": "paused",
            "downloaded": [{"low": 0, "high": 99}, {"low": 200, "high": 299}],
            "created_unix_secs": 5,
            "updated_unix_secs": 6
        });
        tokio::fs::write(&path, serde_json::to_vec(&v1).expect("json"))
            .await
            .expect("write");

        let (loaded, _) = load_record_with_fallback(&path).await.expect("load");
        assert_eq!(loaded.version, SESSION_RECORD_VERSION);
        assert_eq!(loaded.blocks.partial.size(), 200);
        assert!(loaded.blocks.verified.is_empty());
        assert!(loaded.sources.is_empty());

        tokio::fs::write(&path, br#"{"version": 9}"#).await.expect("write");
        assert!(matches!(
            load_record_with_fallback(&path).await,
            Err(DownloadStoreError::UnsupportedVersion { version: 9, .. })
        ));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn scan_recovers_primary_records_only() {
        let root = temp_dir("scan");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");

        save_record(&record_path_for(&root, DownloadId(2)), &sample_record(2))
            .await
            .expect("save 2");
        save_record(&record_path_for(&root, DownloadId(1)), &sample_record(1))
            .await
            .expect("save 1");
        save_record(&root.join("skip.swarm.met.bak"), &sample_record(3))
            .await
            .expect("save bak");

        let recovered = scan_recoverable_sessions(&root).await.expect("scan");
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].record.id, DownloadId(1));
        assert_eq!(
            recovered[1]
                .part_path
                .file_name()
                .and_then(|n| n.to_str())
                .expect("name"),
            "002.part"
        );

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn allocate_next_id_uses_lowest_free_slot() {
        let root = temp_dir("alloc");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        tokio::fs::write(root.join("001.swarm.met"), b"{}")
            .await
            .expect("write 1");
        tokio::fs::write(root.join("003.part"), b"").await.expect("write 3");

        assert_eq!(allocate_next_id(&root).await.expect("alloc"), DownloadId(2));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn known_entries_deduplicate_by_hash_and_size() {
        let root = temp_dir("known");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let path = root.join("known.json");
        let entry = KnownFileEntry {
            file_name: "a.bin".to_string(),
            file_size: 10,
            content_hash: Some(ContentHash::digest(b"a")),
            completed_unix_secs: 1,
        };

        assert!(append_known_entry(&path, entry.clone()).await.expect("append"));
        let mut renamed = entry.clone();
        renamed.file_name = "b.bin".to_string();
        assert!(!append_known_entry(&path, renamed).await.expect("append again"));

        let loaded = load_known_entries(&path).await.expect("load");
        assert_eq!(loaded, vec![entry]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn finalize_moves_without_clobbering() {
        let root = temp_dir("finalize");
        let done = root.join("incoming");
        tokio::fs::create_dir_all(&done).await.expect("mkdir");
        tokio::fs::write(done.join("a.bin"), b"old").await.expect("existing");
        let part = root.join("001.part");
        tokio::fs::write(&part, b"new").await.expect("part");

        let target = finalize_download(&part, &done, "a.bin").await.expect("finalize");
        assert_eq!(target, done.join("a (1).bin"));
        assert!(!part.exists());
        assert_eq!(hash_file(&target).await.expect("hash"), ContentHash::digest(b"new"));
        let _ = std::fs::remove_dir_all(root);
    }
}
