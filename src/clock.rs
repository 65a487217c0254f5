//! Coarse monotonic time.
//!
//! All daemon housekeeping (keep-alive idleness, request wall time, worker
//! lifetimes) runs on one-second granularity, so timestamps are plain second
//! counters measured from process start. Cheap to store, cheap to compare.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds elapsed since the first call in this process.
pub(crate) fn coarse_now() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let a = coarse_now();
        let b = coarse_now();
        assert!(b >= a);
    }
}
