use crate::config::Config;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, ConfigIoError>;

#[derive(Debug)]
pub enum ConfigIoError {
    CreateDefault {
        path: PathBuf,
        source: Box<ConfigIoError>,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    SerializeToml {
        source: toml::ser::Error,
    },
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ConfigIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateDefault { path, .. } => {
                write!(f, "failed to create default config at {}", path.display())
            }
            Self::Read { path, .. } => write!(f, "failed reading config file {}", path.display()),
            Self::ParseToml { path, .. } => write!(f, "invalid TOML in {}", path.display()),
            Self::SerializeToml { .. } => write!(f, "failed serializing config to TOML"),
            Self::CreateDir { path, .. } => {
                write!(f, "failed creating directory {}", path.display())
            }
            Self::Write { path, .. } => write!(f, "failed writing config file {}", path.display()),
        }
    }
}

impl std::error::Error for ConfigIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDefault { source, .. } => Some(source.as_ref()),
            Self::Read { source, .. } => Some(source),
            Self::ParseToml { source, .. } => Some(source),
            Self::SerializeToml { source } => Some(source),
            Self::CreateDir { source, .. } => Some(source),
            Self::Write { source, .. } => Some(source),
        }
    }
}

/// Reads `path`, or writes the defaults there on first run.
pub async fn load_or_create_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let cfg = Config::default();
            save_config(path, &cfg)
                .await
                .map_err(|source| ConfigIoError::CreateDefault {
                    path: path.to_path_buf(),
                    source: Box::new(source),
                })?;
            tracing::info!(path = %path.display(), "wrote default config");
            return Ok(cfg);
        }
        Err(source) => {
            return Err(ConfigIoError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&content).map_err(|source| ConfigIoError::ParseToml {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes through a temp file so a crash never leaves half a config behind.
pub async fn save_config(path: impl AsRef<Path>, cfg: &Config) -> Result<()> {
    let path = path.as_ref();
    let toml_string =
        toml::to_string_pretty(cfg).map_err(|source| ConfigIoError::SerializeToml { source })?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ConfigIoError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, toml_string)
        .await
        .map_err(|source| ConfigIoError::Write {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| ConfigIoError::Write {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("rust-swarm-config-{tag}-{nanos}"))
    }

    #[tokio::test]
    async fn first_run_writes_defaults_then_reads_edits() {
        let dir = temp_dir("create");
        let path = dir.join("config.toml");
        let cfg = load_or_create_config(&path).await.expect("create");
        assert!(path.exists());
        assert_eq!(cfg.swarm.max_source_failures, 5);

        let edited = std::fs::read_to_string(&path)
            .expect("read")
            .replace("max_source_failures = 5", "max_source_failures = 9");
        std::fs::write(&path, edited).expect("write");
        let cfg = load_or_create_config(&path).await.expect("reload");
        assert_eq!(cfg.swarm.max_source_failures, 9);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn broken_toml_is_reported_with_its_path() {
        let dir = temp_dir("broken");
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("config.toml");
        std::fs::write(&path, "[swarm\n").expect("write");
        let err = load_or_create_config(&path).await.expect_err("must fail");
        assert!(matches!(err, ConfigIoError::ParseToml { .. }));
        assert!(err.to_string().contains("config.toml"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
