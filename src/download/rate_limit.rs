use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionClass {
    Direct,
    Relayed,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: Instant,
    used: u64,
}

/// Byte budget shared by every connection of one class. Waiters queue on a
/// FIFO lock, so one reader cannot starve the others; grants are capped at
/// one window's budget.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `0` means unlimited.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            bucket: Mutex::new(Bucket {
                window_start: Instant::now(),
                used: 0,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0
    }

    fn per_window(&self) -> u64 {
        (self.bytes_per_sec * WINDOW.as_millis() as u64 / 1000).max(1)
    }

    /// Waits for budget and returns how many of `want` bytes may be read now
    /// (at least one).
    pub async fn acquire(&self, want: usize) -> usize {
        if self.is_unlimited() || want == 0 {
            return want;
        }
        let per_window = self.per_window();
        let mut bucket = self.bucket.lock().await;
        loop {
            let now = Instant::now();
            if now.saturating_duration_since(bucket.window_start) >= WINDOW {
                bucket.window_start = now;
                bucket.used = 0;
            }
            if bucket.used < per_window {
                let grant = (per_window - bucket.used).min(want as u64);
                bucket.used += grant;
                return grant as usize;
            }
            tokio::time::sleep_until((bucket.window_start + WINDOW).into()).await;
        }
    }
}

/// One limiter per connection class.
#[derive(Debug, Clone)]
pub struct RateLimiters {
    pub direct: Arc<RateLimiter>,
    pub relayed: Arc<RateLimiter>,
}

impl RateLimiters {
    pub fn new(direct_bytes_per_sec: u64, relayed_bytes_per_sec: u64) -> Self {
        Self {
            direct: Arc::new(RateLimiter::new(direct_bytes_per_sec)),
            relayed: Arc::new(RateLimiter::new(relayed_bytes_per_sec)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    pub fn for_class(&self, class: ConnectionClass) -> Arc<RateLimiter> {
        match class {
            ConnectionClass::Direct => self.direct.clone(),
            ConnectionClass::Relayed => self.relayed.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_grants_everything() {
        let l = RateLimiter::unlimited();
        assert_eq!(l.acquire(1 << 20).await, 1 << 20);
    }

    #[tokio::test]
    async fn grants_are_capped_per_window() {
        let l = RateLimiter::new(10_000);
        assert_eq!(l.acquire(5000).await, 1000);
    }

    #[tokio::test]
    async fn limited_throughput_takes_time() {
        let l = Arc::new(RateLimiter::new(20_000));
        let started = Instant::now();
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let l = l.clone();
            tasks.push(tokio::spawn(async move {
                let mut got = 0usize;
                while got < 4000 {
                    got += l.acquire(4000 - got).await;
                }
                got
            }));
        }
        for t in tasks {
            assert_eq!(t.await.expect("join"), 4000);
        }
        // 8000 bytes at 2000 per window needs at least three window rollovers.
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
