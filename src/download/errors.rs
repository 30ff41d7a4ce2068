use crate::download::interval::Interval;
use crate::download::types::{DownloadId, DownloadState};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
pub enum DownloadStoreError {
    EnsureDir {
        path: PathBuf,
        source: std::io::Error,
    },
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    ParseMet {
        path: PathBuf,
        source: serde_json::Error,
    },
    ParseKnown {
        path: PathBuf,
        source: serde_json::Error,
    },
    UnsupportedVersion {
        path: PathBuf,
        version: u32,
    },
}

impl std::fmt::Display for DownloadStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnsureDir { path, source } => {
                write!(
                    f,
                    "failed to ensure directory '{}': {source}",
                    path.display()
                )
            }
            Self::ReadDir { path, source } => {
                write!(f, "failed to read directory '{}': {source}", path.display())
            }
            Self::ReadFile { path, source } => {
                write!(f, "failed to read '{}': {source}", path.display())
            }
            Self::WriteFile { path, source } => {
                write!(f, "failed to write '{}': {source}", path.display())
            }
            Self::Copy { from, to, source } => write!(
                f,
                "failed to copy '{}' to '{}': {source}",
                from.display(),
                to.display()
            ),
            Self::Rename { from, to, source } => write!(
                f,
                "failed to rename '{}' to '{}': {source}",
                from.display(),
                to.display()
            ),
            Self::Serialize { source } => write!(f, "failed to serialize record: {source}"),
            Self::ParseMet { path, source } => {
                write!(f, "invalid session record '{}': {source}", path.display())
            }
            Self::ParseKnown { path, source } => {
                write!(f, "invalid known-files list '{}': {source}", path.display())
            }
            Self::UnsupportedVersion { path, version } => write!(
                f,
                "session record '{}' has unsupported version {version}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for DownloadStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::EnsureDir { source, .. }
            | Self::ReadDir { source, .. }
            | Self::ReadFile { source, .. }
            | Self::WriteFile { source, .. }
            | Self::Copy { source, .. }
            | Self::Rename { source, .. } => Some(source),
            Self::Serialize { source }
            | Self::ParseMet { source, .. }
            | Self::ParseKnown { source, .. } => Some(source),
            Self::UnsupportedVersion { .. } => None,
        }
    }
}

/// Failures of the shared byte-range bookkeeping.
#[derive(Debug, Clone)]
pub enum BlockStateError {
    /// A range was not in the set the operation requires. Two owners touched
    /// the same bytes; the session cannot continue.
    Violation {
        op: &'static str,
        interval: Interval,
        expected: &'static str,
    },
    /// `release` of bytes that are not leased. Rejected, state unchanged.
    NotLeased(Interval),
    /// Payload length differs from the interval it is written to.
    LengthMismatch { interval: Interval, actual: usize },
    /// Reading or writing the backing file failed.
    DiskFailed {
        op: &'static str,
        path: PathBuf,
        source: Arc<std::io::Error>,
    },
    /// A tree for a different file size was offered.
    TreeSizeMismatch { expected: u64, actual: u64 },
    /// The writer task is gone.
    Closed,
}

impl BlockStateError {
    pub fn disk(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DiskFailed {
            op,
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Whether the error ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NotLeased(_) | Self::TreeSizeMismatch { .. })
    }
}

impl std::fmt::Display for BlockStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Violation {
                op,
                interval,
                expected,
            } => write!(f, "{op}: range {interval} is not {expected}"),
            Self::NotLeased(interval) => write!(f, "release: range {interval} is not leased"),
            Self::LengthMismatch { interval, actual } => write!(
                f,
                "write: {actual} bytes for range {interval} of {} bytes",
                interval.len()
            ),
            Self::DiskFailed { op, path, source } => {
                write!(f, "disk {op} failed for '{}': {source}", path.display())
            }
            Self::TreeSizeMismatch { expected, actual } => write!(
                f,
                "hash tree covers {actual} bytes, file has {expected} bytes"
            ),
            Self::Closed => write!(f, "block writer closed"),
        }
    }
}

impl std::error::Error for BlockStateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DiskFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LeaseError {
    /// Nothing is free anywhere in the file.
    NoSuchElement,
    /// Free bytes exist, but none inside the ranges the source offers.
    NoSuchRange,
    Block(BlockStateError),
}

impl std::fmt::Display for LeaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchElement => write!(f, "no free ranges left"),
            Self::NoSuchRange => write!(f, "no free ranges inside the offered ranges"),
            Self::Block(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for LeaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Block(source) => Some(source),
            _ => None,
        }
    }
}

impl From<BlockStateError> for LeaseError {
    fn from(value: BlockStateError) -> Self {
        Self::Block(value)
    }
}

/// Rejected user control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    Terminal(DownloadState),
    InvalidTransition {
        op: &'static str,
        from: DownloadState,
    },
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminal(state) => write!(f, "download already finished ({state:?})"),
            Self::InvalidTransition { op, from } => {
                write!(f, "cannot {op} a download in state {from:?}")
            }
        }
    }
}

impl std::error::Error for ControlError {}

#[derive(Debug)]
pub enum DownloadError {
    Store(DownloadStoreError),
    Block(BlockStateError),
    Control(ControlError),
    UnknownDownload(DownloadId),
    ChannelClosed,
    ServiceJoin(tokio::task::JoinError),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(source) => write!(f, "{source}"),
            Self::Block(source) => write!(f, "{source}"),
            Self::Control(source) => write!(f, "{source}"),
            Self::UnknownDownload(id) => write!(f, "unknown download {id}"),
            Self::ChannelClosed => write!(f, "download service channel closed"),
            Self::ServiceJoin(source) => write!(f, "download service task join error: {source}"),
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(source) => Some(source),
            Self::Block(source) => Some(source),
            Self::Control(source) => Some(source),
            Self::ServiceJoin(source) => Some(source),
            Self::UnknownDownload(_) | Self::ChannelClosed => None,
        }
    }
}

impl From<DownloadStoreError> for DownloadError {
    fn from(value: DownloadStoreError) -> Self {
        Self::Store(value)
    }
}

impl From<BlockStateError> for DownloadError {
    fn from(value: BlockStateError) -> Self {
        Self::Block(value)
    }
}

impl From<ControlError> for DownloadError {
    fn from(value: ControlError) -> Self {
        Self::Control(value)
    }
}

impl From<tokio::task::JoinError> for DownloadError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::ServiceJoin(value)
    }
}
