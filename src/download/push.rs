use crate::download::outcome::NegotiationError;
use crate::download::source::{PushKey, RemoteSource};
use crate::net::BoxedStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

/// Side channel that asks a firewalled source to connect back to us.
pub trait PushSender: Send + Sync {
    /// Returns false when no push route to the source exists.
    fn send_push(&self, source: &RemoteSource) -> bool;
}

/// For setups without a push route; every push fails immediately.
#[derive(Debug, Default)]
pub struct NoPushRoute;

impl PushSender for NoPushRoute {
    fn send_push(&self, _source: &RemoteSource) -> bool {
        false
    }
}

/// Which timeout applies to a push wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushClass {
    /// Source came from a direct search result or reply.
    Standard,
    /// Source learned via alternate-location gossip; these often went stale.
    Gossip,
}

struct Waiter {
    token: u64,
    tx: oneshot::Sender<BoxedStream>,
}

#[derive(Default)]
struct Inner {
    waiting: Mutex<HashMap<PushKey, Waiter>>,
    next_token: AtomicU64,
}

impl Inner {
    fn waiting(&self) -> MutexGuard<'_, HashMap<PushKey, Waiter>> {
        match self.waiting.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Matches inbound push connections to the worker waiting for them.
/// Shared by every session of a process.
#[derive(Clone, Default)]
pub struct PushRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PushRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushRegistry")
            .field("waiting", &self.waiting_count())
            .finish()
    }
}

impl PushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts waiting for `key`. A newer registration for the same key
    /// replaces the older one, whose wait then fails.
    pub fn register(&self, key: PushKey) -> PushWait {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.waiting().insert(key.clone(), Waiter { token, tx });
        PushWait {
            registry: self.inner.clone(),
            key,
            token,
            rx: Some(rx),
        }
    }

    /// Hands `stream` to the worker waiting on this key. Returns false and
    /// drops the connection if nobody waits (late or duplicate push).
    pub fn accept_inbound(
        &self,
        file_name: &str,
        file_index: u64,
        source_id: &str,
        stream: BoxedStream,
    ) -> bool {
        let key = PushKey {
            file_name: file_name.to_string(),
            file_index,
            source_id: source_id.to_ascii_lowercase(),
        };
        let Some(waiter) = self.inner.waiting().remove(&key) else {
            tracing::debug!(
                file = %file_name,
                source_id = %crate::logging::redact_hex(source_id),
                "dropping unexpected push connection"
            );
            return false;
        };
        waiter.tx.send(stream).is_ok()
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.waiting().len()
    }
}

/// One outstanding push wait. Dropping it unregisters the key.
pub struct PushWait {
    registry: Arc<Inner>,
    key: PushKey,
    token: u64,
    rx: Option<oneshot::Receiver<BoxedStream>>,
}

impl PushWait {
    pub async fn wait(mut self, limit: Duration) -> Result<BoxedStream, NegotiationError> {
        let Some(rx) = self.rx.take() else {
            return Err(NegotiationError::PushTimeout);
        };
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(_)) | Err(_) => Err(NegotiationError::PushTimeout),
        }
    }
}

impl Drop for PushWait {
    fn drop(&mut self) {
        let mut waiting = self.registry.waiting();
        if waiting.get(&self.key).is_some_and(|w| w.token == self.token) {
            waiting.remove(&self.key);
        }
    }
}
