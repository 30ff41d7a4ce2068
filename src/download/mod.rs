pub mod block_state;
pub mod errors;
pub mod hash_tree;
pub mod interval;
pub mod mesh;
pub mod negotiator;
pub mod outcome;
pub mod progress;
pub mod protocol;
pub mod push;
pub mod ranker;
pub mod rate_limit;
pub mod selection;
pub mod service;
pub mod session;
pub mod source;
pub mod store;
pub mod types;
pub(crate) mod verifier;
pub mod worker;

pub use block_state::{BlockCounts, BlockOptions, BlockSnapshot, BlockState};
pub use errors::{
    BlockStateError, ControlError, DownloadError, DownloadStoreError, LeaseError,
};
pub use hash_tree::{ContentHash, HashTree};
pub use interval::{Interval, IntervalSet};
pub use mesh::{AltLocations, MeshFeedback, SilentMesh};
pub use negotiator::ConnectionNegotiator;
pub use outcome::{ConnectionOutcome, NegotiationError, StreamError};
pub use push::{NoPushRoute, PushRegistry, PushSender};
pub use ranker::{AddOutcome, DefaultRanker, SourceRanker};
pub use rate_limit::{RateLimiter, RateLimiters};
pub use selection::SelectionPolicy;
pub use service::{
    DownloadCommand, DownloadServiceConfig, DownloadServiceHandle, DownloadServiceStatus,
    NewDownload, start_service,
};
pub use session::{
    AutoDecision, CompletionHandler, CorruptionDecision, DownloadSession, RetryPolicy,
    SessionConfig, SessionDeps, SessionEvent, SessionParams, SessionStatus,
};
pub use source::RemoteSource;
pub use store::{SESSION_RECORD_VERSION, SessionRecord};
pub use types::{ConnectionSpeed, DownloadId, DownloadState, WorkerId};
