use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy)]
struct ThrottleState {
    last: Instant,
    suppressed: u64,
}

/// Shortens a hash or client id for log lines: `0123abcd..89abcdef`.
pub fn redact_hex(value: &str) -> String {
    const KEEP: usize = 8;
    if value.len() <= KEEP * 2 || !value.is_ascii() {
        return value.to_string();
    }
    format!("{}..{}", &value[..KEEP], &value[value.len() - KEEP..])
}

/// `1536` -> `1.5 KiB`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// True when a warning for `key` may be logged now. A source that spams
/// broken replies would otherwise flood the log.
pub fn warn_throttled(key: &'static str, interval: Duration) -> bool {
    let Some(suppressed) = warn_throttled_with_count(key, interval) else {
        return false;
    };
    if suppressed > 0 {
        tracing::warn!(key, suppressed, "throttled warnings were suppressed");
    }
    true
}

/// Like `warn_throttled`, but hands back how many warnings were swallowed
/// since the last one that got through.
pub fn warn_throttled_with_count(key: &'static str, interval: Duration) -> Option<u64> {
    static LAST_WARN: OnceLock<Mutex<HashMap<&'static str, ThrottleState>>> = OnceLock::new();
    let map = LAST_WARN.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = match map.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let now = Instant::now();
    let Some(state) = guard.get_mut(key) else {
        guard.insert(
            key,
            ThrottleState {
                last: now,
                suppressed: 0,
            },
        );
        return Some(0);
    };
    if now.saturating_duration_since(state.last) < interval {
        state.suppressed = state.suppressed.saturating_add(1);
        return None;
    }
    let suppressed = state.suppressed;
    state.last = now;
    state.suppressed = 0;
    Some(suppressed)
}
