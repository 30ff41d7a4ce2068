use crate::download::interval::Interval;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const BANDWIDTH_WINDOW: Duration = Duration::from_secs(10);
const MIN_SAMPLE_SPAN: Duration = Duration::from_millis(200);

/// Sliding-window byte rate.
#[derive(Debug, Clone, Default)]
pub struct BandwidthTracker {
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl BandwidthTracker {
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.total = self.total.saturating_add(bytes);
        while let Some((t, _)) = self.samples.front() {
            if now.saturating_duration_since(*t) <= BANDWIDTH_WINDOW {
                break;
            }
            self.samples.pop_front();
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes per second, or `None` until enough has been measured.
    pub fn rate(&self, now: Instant) -> Option<f64> {
        let (first, _) = self.samples.front()?;
        let span = now.saturating_duration_since(*first);
        if span < MIN_SAMPLE_SPAN {
            return None;
        }
        let bytes: u64 = self
            .samples
            .iter()
            .filter(|(t, _)| now.saturating_duration_since(*t) <= BANDWIDTH_WINDOW)
            .map(|(_, b)| *b)
            .sum();
        Some(bytes as f64 / span.min(BANDWIDTH_WINDOW).as_secs_f64())
    }
}

/// The bytes a worker still owns of its current transfer, `[pos, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    pos: u64,
    end: u64,
}

#[derive(Debug, Default)]
struct ProgressState {
    window: Option<Window>,
    closed: bool,
    bandwidth: BandwidthTracker,
}

/// Shared between a worker's stream loop and would-be thieves. All window
/// moves happen under one lock so a handoff point never overlaps bytes the
/// owner already accepted.
#[derive(Debug, Default)]
pub struct TransferProgress {
    state: Mutex<ProgressState>,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Starts tracking `interval` as owned.
    pub fn begin(&self, interval: Interval) {
        let mut st = self.lock();
        st.window = Some(Window {
            pos: interval.low,
            end: interval.high_exclusive(),
        });
    }

    /// Unwritten bytes still owned.
    pub fn remaining(&self) -> Option<Interval> {
        let st = self.lock();
        let w = st.window?;
        Interval::from_exclusive(w.pos, w.end)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Shrinks the window to end before `offset` and returns the tail handed
    /// off. The cut never goes below bytes already accepted. `None` if the
    /// owner is gone or has nothing left past `offset`.
    pub fn stop_at(&self, offset: u64) -> Option<Interval> {
        let mut st = self.lock();
        if st.closed {
            return None;
        }
        let w = st.window.as_mut()?;
        let handoff = offset.max(w.pos);
        if handoff >= w.end {
            return None;
        }
        let tail = Interval::from_exclusive(handoff, w.end);
        w.end = handoff;
        tail
    }

    /// Narrows the window to `granted` and returns the owned parts that fell
    /// outside it, for release.
    pub fn restrict(&self, granted: Interval) -> Vec<Interval> {
        let mut st = self.lock();
        let Some(w) = st.window.as_mut() else {
            return Vec::new();
        };
        let new_pos = w.pos.max(granted.low).min(w.end);
        let new_end = w.end.min(granted.high_exclusive()).max(new_pos);
        let mut cut = Vec::new();
        cut.extend(Interval::from_exclusive(w.pos, new_pos));
        cut.extend(Interval::from_exclusive(new_end, w.end));
        w.pos = new_pos;
        w.end = new_end;
        cut
    }

    /// Skips bytes before `offset`.
    pub fn start_at(&self, offset: u64) {
        let mut st = self.lock();
        if let Some(w) = st.window.as_mut() {
            w.pos = w.pos.max(offset).min(w.end);
        }
    }

    /// Claims the part of `[offset, offset + len)` still owned and advances
    /// past it. Bytes before the window are skipped; bytes at or past the
    /// end are refused.
    pub fn accept(&self, offset: u64, len: u64) -> Option<Interval> {
        let mut st = self.lock();
        if st.closed {
            return None;
        }
        let w = st.window.as_mut()?;
        if offset > w.pos {
            return None;
        }
        let high_excl = offset.saturating_add(len).min(w.end);
        if high_excl <= w.pos {
            return None;
        }
        let claimed = Interval::from_exclusive(w.pos, high_excl)?;
        w.pos = high_excl;
        Some(claimed)
    }

    /// True once every owned byte was accepted.
    pub fn is_exhausted(&self) -> bool {
        let st = self.lock();
        st.window.is_none_or(|w| w.pos >= w.end)
    }

    /// Ends the current transfer; returns the unwritten tail to release.
    pub fn finish_window(&self) -> Option<Interval> {
        let mut st = self.lock();
        let w = st.window.take()?;
        Interval::from_exclusive(w.pos, w.end)
    }

    /// Marks the worker gone; later `stop_at` calls fail. Returns the
    /// unwritten tail.
    pub fn close(&self) -> Option<Interval> {
        let mut st = self.lock();
        st.closed = true;
        let w = st.window.take()?;
        Interval::from_exclusive(w.pos, w.end)
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.lock().bandwidth.record(Instant::now(), bytes);
    }

    pub fn bandwidth(&self) -> Option<f64> {
        self.lock().bandwidth.rate(Instant::now())
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().bandwidth.total()
    }
}
