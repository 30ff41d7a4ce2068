use crate::download::hash_tree::ContentHash;
use crate::download::source::RemoteSource;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_MAX_ALTS: usize = 10;

/// Outbound feedback to the discovery and gossip layer.
pub trait MeshFeedback: Send + Sync {
    /// Called after every negotiation attempt.
    fn report_outcome(&self, source: &RemoteSource, succeeded: bool);

    /// A gossip-derived source failed; stop advertising it.
    fn retract(&self, source: &RemoteSource) {
        let _ = source;
    }

    /// The session ran out of sources and would like more.
    fn locate_more(&self, hash: Option<ContentHash>, file_name: &str) {
        let _ = (hash, file_name);
    }
}

/// Discards all feedback.
#[derive(Debug, Default)]
pub struct SilentMesh;

impl MeshFeedback for SilentMesh {
    fn report_outcome(&self, _source: &RemoteSource, _succeeded: bool) {}
}

#[derive(Debug, Default)]
struct AltState {
    good: VecDeque<String>,
    bad: VecDeque<String>,
}

/// Alternate locations for one file, as exchanged in `X-Alt` / `X-NAlt`.
/// Both lists are bounded; the oldest entry falls off first.
#[derive(Debug)]
pub struct AltLocations {
    max: usize,
    state: Mutex<AltState>,
}

impl Default for AltLocations {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ALTS)
    }
}

impl AltLocations {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            state: Mutex::new(AltState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AltState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push_bounded(list: &mut VecDeque<String>, addr: String, max: usize) {
        list.retain(|a| a != &addr);
        list.push_back(addr);
        while list.len() > max {
            list.pop_front();
        }
    }

    pub fn record_good(&self, addr: &str) {
        let mut st = self.lock();
        st.bad.retain(|a| a != addr);
        Self::push_bounded(&mut st.good, addr.to_string(), self.max);
    }

    pub fn record_bad(&self, addr: &str) {
        let mut st = self.lock();
        st.good.retain(|a| a != addr);
        Self::push_bounded(&mut st.bad, addr.to_string(), self.max);
    }

    /// Locations to advertise to `peer` (never the peer itself).
    pub fn to_send(&self, peer: &str) -> (Vec<String>, Vec<String>) {
        let st = self.lock();
        let pick = |list: &VecDeque<String>| {
            list.iter()
                .rev()
                .filter(|a| a.as_str() != peer)
                .take(self.max)
                .cloned()
                .collect::<Vec<_>>()
        };
        (pick(&st.good), pick(&st.bad))
    }

    pub fn is_bad(&self, addr: &str) -> bool {
        self.lock().bad.iter().any(|a| a == addr)
    }

    pub fn good_count(&self) -> usize {
        self.lock().good.len()
    }
}

/// Builds candidate sources from `host:port` strings heard in gossip.
/// Unparseable entries are skipped.
pub fn sources_from_alts(
    alts: &[String],
    file_name: &str,
    file_size: u64,
    hash: Option<ContentHash>,
) -> Vec<RemoteSource> {
    alts.iter()
        .filter_map(|alt| {
            let (host, port) = alt.trim().rsplit_once(':')?;
            let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
            if host.is_empty() {
                return None;
            }
            let mut source = RemoteSource::new(host, port, file_name, file_size);
            source.content_hash = hash;
            source.from_alt_location = true;
            Some(source)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alt_lists_are_bounded_and_exclusive() {
        let alts = AltLocations::new(3);
        for i in 0..5 {
            alts.record_good(&format!("10.0.0.{i}:6346"));
        }
        assert_eq!(alts.good_count(), 3);
        alts.record_bad("10.0.0.4:6346");
        let (good, bad) = alts.to_send("10.0.0.3:6346");
        assert_eq!(good, vec!["10.0.0.2:6346".to_string()]);
        assert_eq!(bad, vec!["10.0.0.4:6346".to_string()]);
        assert!(alts.is_bad("10.0.0.4:6346"));
        alts.record_good("10.0.0.4:6346");
        assert!(!alts.is_bad("10.0.0.4:6346"));
    }

    #[test]
    fn gossip_strings_become_marked_sources() {
        let hash = ContentHash::digest(b"x");
        let got = sources_from_alts(
            &[
                "10.1.1.1:6346".to_string(),
                "nonsense".to_string(),
                "10.1.1.2:0".to_string(),
            ],
            "f.bin",
            100,
            Some(hash),
        );
        assert_eq!(got.len(), 1);
        assert!(got[0].from_alt_location);
        assert_eq!(got[0].content_hash, Some(hash));
        assert_eq!(got[0].address(), "10.1.1.1:6346");
    }
}
