//! Monotonic clock used by [`crate::timer`] for scheduling deadlines.
//!
//! `CLOCK_MONOTONIC` via `clock_gettime`, the same call the timer wheel in
//! the system this crate's core is ported from uses directly, instead of
//! `std::time::Instant` -- this keeps the clock source explicit and
//! millisecond-resolution to match that implementation's timer precision.
use std::time::Duration;

/// Milliseconds since an arbitrary, monotonically increasing epoch.
/// Never goes backwards within a process; not comparable across
/// processes or after a reboot.
pub fn monotonic_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
    ts.tv_sec as u64 * 1000 + (ts.tv_nsec as u64) / 1_000_000
}

pub fn monotonic() -> Duration {
    Duration::from_millis(monotonic_ms())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ms_never_decreases() {
        let a = monotonic_ms();
        std::thread::sleep(Duration::from_millis(5));
        let b = monotonic_ms();
        assert!(b >= a);
    }
}
