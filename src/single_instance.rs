use anyhow::Context as _;
use fs2::FileExt as _;
use std::{fs::OpenOptions, path::Path};

/// Advisory lock on the data directory. Two processes sharing one
/// directory would both write the same part files.
#[derive(Debug)]
pub struct SingleInstanceLock {
    _file: std::fs::File,
    path: std::path::PathBuf,
}

impl SingleInstanceLock {
    pub fn acquire(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        // The OS drops the lock when the process dies.
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file, path }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(anyhow::anyhow!(
                "another rust-swarm instance is using this data directory (lock held at {})",
                path.display()
            )),
            Err(e) => Err(anyhow::anyhow!(e))
                .with_context(|| format!("failed to lock {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_the_same_path_fails_until_released() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("rust-swarm-lock-{nanos}"));
        let path = dir.join("rust-swarm.lock");

        let first = SingleInstanceLock::acquire(&path).expect("first lock");
        assert_eq!(first.path(), path.as_path());
        assert!(SingleInstanceLock::acquire(&path).is_err());
        drop(first);
        assert!(SingleInstanceLock::acquire(&path).is_ok());
        let _ = std::fs::remove_dir_all(dir);
    }
}
