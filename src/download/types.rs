use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub u32);

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// Identifies one worker inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Connecting,
    Downloading,
    RemoteQueued,
    WaitingForConnections,
    Busy,
    IterativeLocating,
    WaitingForUser,
    GaveUp,
    Hashing,
    Saving,
    Complete,
    Aborted,
    Paused,
    DiskProblem,
    CorruptFile,
}

impl DownloadState {
    /// No further transitions except an explicit restart.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Aborted | Self::DiskProblem | Self::CorruptFile
        )
    }

    /// Parked states that `resume` re-enters `Connecting` from.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            Self::Paused | Self::GaveUp | Self::WaitingForUser | Self::CorruptFile
        )
    }

    /// States in which workers may be running.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::Downloading
                | Self::RemoteQueued
                | Self::WaitingForConnections
                | Self::Busy
                | Self::IterativeLocating
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSpeed {
    Modem,
    Broadband,
    T3,
}

impl ConnectionSpeed {
    /// Concurrent workers per session.
    pub fn swarm_capacity(self) -> usize {
        match self {
            Self::Modem => 2,
            Self::Broadband => 6,
            Self::T3 => 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_resumable_states_overlap_only_on_corrupt_file() {
        let all = [
            DownloadState::Connecting,
            DownloadState::Downloading,
            DownloadState::RemoteQueued,
            DownloadState::WaitingForConnections,
            DownloadState::Busy,
            DownloadState::IterativeLocating,
            DownloadState::WaitingForUser,
            DownloadState::GaveUp,
            DownloadState::Hashing,
            DownloadState::Saving,
            DownloadState::Complete,
            DownloadState::Aborted,
            DownloadState::Paused,
            DownloadState::DiskProblem,
            DownloadState::CorruptFile,
        ];
        let both: Vec<_> = all
            .iter()
            .filter(|s| s.is_terminal() && s.is_resumable())
            .collect();
        assert_eq!(both, vec![&DownloadState::CorruptFile]);
        assert!(all.iter().filter(|s| s.is_active()).all(|s| !s.is_terminal()));
    }

    #[test]
    fn swarm_capacity_by_speed_class() {
        assert_eq!(ConnectionSpeed::Modem.swarm_capacity(), 2);
        assert_eq!(ConnectionSpeed::Broadband.swarm_capacity(), 6);
        assert_eq!(ConnectionSpeed::T3.swarm_capacity(), 8);
    }
}
