use crate::download::hash_tree::ContentHash;
use crate::download::interval::IntervalSet;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Identity of a candidate source. Two descriptors with the same key are the
/// same source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKey {
    ByHash {
        host: String,
        port: u16,
        hash: ContentHash,
    },
    ByName {
        host: String,
        port: u16,
        file_name: String,
        file_size: u64,
    },
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ByHash { host, port, .. } | Self::ByName { host, port, .. } => {
                write!(f, "{host}:{port}")
            }
        }
    }
}

/// Key a firewalled source's push connection is matched on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PushKey {
    pub file_name: String,
    pub file_index: u64,
    pub source_id: String,
}

/// Descriptor of one host offering the file. Identity fields never change
/// after discovery; only `stats` is updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSource {
    pub host: String,
    pub port: u16,
    pub file_name: String,
    pub file_size: u64,
    pub file_index: u64,
    #[serde(default)]
    pub content_hash: Option<ContentHash>,
    /// Hex client id used to match inbound push connections.
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub needs_push: bool,
    /// The host can take part in a firewall-to-firewall transfer.
    #[serde(default)]
    pub firewall_capable: bool,
    #[serde(default)]
    pub from_multicast: bool,
    /// Learned through alternate-location gossip.
    #[serde(default)]
    pub from_alt_location: bool,
    /// Advertised speed hint, KiB/s.
    #[serde(default)]
    pub speed_hint: u32,
    #[serde(default)]
    pub stats: SourceStats,
}

/// Counters updated as attempts succeed or fail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStats {
    #[serde(default)]
    pub total_failures: u32,
    #[serde(skip)]
    pub consecutive_failures: u32,
    #[serde(skip)]
    pub retry_after: Option<Instant>,
    #[serde(skip)]
    pub available_ranges: Option<IntervalSet>,
    #[serde(skip)]
    pub queue_position: Option<u32>,
    #[serde(skip)]
    pub last_attempt: Option<Instant>,
    #[serde(default)]
    pub successes: u32,
    #[serde(skip)]
    pub tree_advertised: bool,
}

impl RemoteSource {
    pub fn new(host: impl Into<String>, port: u16, file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            host: host.into(),
            port,
            file_name: file_name.into(),
            file_size,
            file_index: 0,
            content_hash: None,
            source_id: String::new(),
            needs_push: false,
            firewall_capable: false,
            from_multicast: false,
            from_alt_location: false,
            speed_hint: 0,
            stats: SourceStats::default(),
        }
    }

    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }

    pub fn key(&self) -> SourceKey {
        match self.content_hash {
            Some(hash) => SourceKey::ByHash {
                host: self.host.clone(),
                port: self.port,
                hash,
            },
            None => SourceKey::ByName {
                host: self.host.clone(),
                port: self.port,
                file_name: self.file_name.clone(),
                file_size: self.file_size,
            },
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn push_key(&self) -> PushKey {
        PushKey {
            file_name: self.file_name.clone(),
            file_index: self.file_index,
            source_id: self.source_id.to_ascii_lowercase(),
        }
    }

    /// Has only part of the file.
    pub fn is_partial(&self) -> bool {
        self.stats
            .available_ranges
            .as_ref()
            .is_some_and(|r| r.size() < self.file_size)
    }

    pub fn is_busy(&self, now: Instant) -> bool {
        self.stats.retry_after.is_some_and(|t| t > now)
    }

    pub fn record_success(&mut self) {
        self.stats.consecutive_failures = 0;
        self.stats.successes = self.stats.successes.saturating_add(1);
    }

    pub fn record_failure(&mut self) {
        self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
        self.stats.total_failures = self.stats.total_failures.saturating_add(1);
    }
}

impl PartialEq for RemoteSource {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RemoteSource {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_uses_hash_when_present() {
        let hash = ContentHash::digest(b"file");
        let a = RemoteSource::new("10.0.0.1", 6346, "a.bin", 10).with_hash(hash);
        let mut b = RemoteSource::new("10.0.0.1", 6346, "renamed.bin", 10).with_hash(hash);
        b.record_failure();
        assert_eq!(a, b);

        let c = RemoteSource::new("10.0.0.1", 6346, "a.bin", 10);
        let d = RemoteSource::new("10.0.0.1", 6346, "a.bin", 11);
        assert_ne!(c, d);
        assert_ne!(a, c);
        assert_ne!(a, RemoteSource::new("10.0.0.2", 6346, "a.bin", 10).with_hash(hash));
    }

    #[test]
    fn partial_and_busy_flags() {
        let mut s = RemoteSource::new("h", 1, "f", 100);
        assert!(!s.is_partial());
        s.stats.available_ranges = Some(IntervalSet::full(50));
        assert!(s.is_partial());
        let now = Instant::now();
        s.stats.retry_after = Some(now + std::time::Duration::from_secs(5));
        assert!(s.is_busy(now));
        s.record_failure();
        s.record_failure();
        assert_eq!(s.stats.consecutive_failures, 2);
        s.record_success();
        assert_eq!(s.stats.consecutive_failures, 0);
        assert_eq!(s.stats.total_failures, 2);
    }
}
