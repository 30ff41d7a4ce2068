use crate::download::hash_tree::{HashTree, HashTreeError};
use crate::download::interval::{Interval, IntervalSet};
use crate::download::protocol::ProtocolError;
use std::time::Duration;

/// Result of one negotiation exchange. Exactly one per attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionOutcome {
    /// The source will send `granted` now.
    Connected { granted: Interval },
    /// Remotely queued; ask again after `poll`.
    Queued { position: u32, poll: Duration },
    /// The source lacks the requested bytes; its ranges were updated.
    PartialData,
    /// The source cannot serve this file right now.
    NoFile,
    /// Nothing left to request from this source.
    NoData,
    ThexResponse { tree: HashTree },
}

/// Why a negotiation step failed. Each kind drives a distinct retry policy.
#[derive(Debug)]
pub enum NegotiationError {
    CantConnect(std::io::Error),
    /// Push connection never arrived.
    PushTimeout,
    Busy { retry_after: Option<Duration> },
    QueueFull { position: u32 },
    NotFound,
    NotSharing,
    RangeNotAvailable { available: Option<IntervalSet> },
    ContentMismatch,
    Malformed(ProtocolError),
    BadGrant { requested: Interval, granted: Interval },
    /// A thief was granted less than the tail it asked for.
    BadStealer { requested: Interval, granted: Interval },
    BadTree(HashTreeError),
    UnknownCode(u16),
    Timeout(&'static str),
    Io { op: &'static str, source: std::io::Error },
    Closed,
}

impl NegotiationError {
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }
}

impl std::fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CantConnect(source) => write!(f, "connect failed: {source}"),
            Self::PushTimeout => write!(f, "push connection did not arrive"),
            Self::Busy { retry_after } => match retry_after {
                Some(d) => write!(f, "source busy, retry after {d:?}"),
                None => write!(f, "source busy"),
            },
            Self::QueueFull { position } => write!(f, "remote queue position {position} too far back"),
            Self::NotFound => write!(f, "file not found"),
            Self::NotSharing => write!(f, "source no longer shares the file"),
            Self::RangeNotAvailable { .. } => write!(f, "requested range not available"),
            Self::ContentMismatch => write!(f, "content hash mismatch"),
            Self::Malformed(source) => write!(f, "malformed response: {source}"),
            Self::BadGrant { requested, granted } => {
                write!(f, "granted {granted} does not overlap requested {requested}")
            }
            Self::BadStealer { requested, granted } => {
                write!(f, "steal of {requested} granted only {granted}")
            }
            Self::BadTree(source) => write!(f, "bad hash tree: {source}"),
            Self::UnknownCode(code) => write!(f, "unexpected status {code}"),
            Self::Timeout(what) => write!(f, "{what} timed out"),
            Self::Io { op, source } => write!(f, "{op} failed: {source}"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for NegotiationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CantConnect(source) | Self::Io { source, .. } => Some(source),
            Self::Malformed(source) => Some(source),
            Self::BadTree(source) => Some(source),
            _ => None,
        }
    }
}

impl From<ProtocolError> for NegotiationError {
    fn from(value: ProtocolError) -> Self {
        Self::Malformed(value)
    }
}

/// Why a body transfer ended early.
#[derive(Debug)]
pub enum StreamError {
    Io(std::io::Error),
    Timeout,
    /// The peer closed before sending every granted byte.
    Truncated { expected: u64, received: u64 },
    Block(crate::download::errors::BlockStateError),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(source) => write!(f, "read failed: {source}"),
            Self::Timeout => write!(f, "read timed out"),
            Self::Truncated { expected, received } => {
                write!(f, "peer closed after {received} of {expected} bytes")
            }
            Self::Block(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(source) => Some(source),
            Self::Block(source) => Some(source),
            _ => None,
        }
    }
}
