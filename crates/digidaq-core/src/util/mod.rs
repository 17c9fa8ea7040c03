//! Utility helpers shared by the engines and binaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Locks a mutex, recovering the guard if a worker panicked while holding it.
///
/// Shared buffers in this crate are only appended to or swapped, so the inner
/// value is always usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sleeps for `total`, waking every `step` to check whether `running` was cleared.
///
/// Returns early as soon as the flag is false.
pub fn sleep_while_running(running: &AtomicBool, total: Duration, step: Duration) {
    let step = step.max(Duration::from_millis(1));
    let mut remaining = total;
    while remaining > Duration::ZERO && running.load(Ordering::Acquire) {
        let sleep_time = remaining.min(step);
        std::thread::sleep(sleep_time);
        remaining = remaining.saturating_sub(sleep_time);
    }
}

/// Parses a human-readable size string (e.g., "1G", "500M", "1024K") into bytes.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, multiplier) = if let Some(num) = s.strip_suffix('G') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('M') {
        (num, 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('K') {
        (num, 1024)
    } else {
        (s, 1)
    };

    num_str
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid size '{}': {}", s, e))?
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' overflows u64", s))
}
