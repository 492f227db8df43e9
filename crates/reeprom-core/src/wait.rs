//! Timeout-bounded polling
//!
//! The ACK-poll after a write and any other "wait until the device is
//! ready" loop share one primitive: poll a condition at a fixed interval
//! until it holds or a deadline passes. Every blocking wait in the engine
//! goes through here, so no operation can block indefinitely.

use std::time::{Duration, Instant};

use crate::error::Result;

/// Poll `ready` every `interval` until it returns `Ok(true)` or `timeout`
/// elapses.
///
/// The condition is checked once immediately, so a zero timeout still gets
/// exactly one probe. Returns `Ok(true)` if the condition held within the
/// deadline, `Ok(false)` if the deadline passed, or the condition's error.
pub fn poll_until<F>(interval: Duration, timeout: Duration, mut ready: F) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if ready()? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        // Never sleep past the deadline.
        std::thread::sleep(interval.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_success_needs_no_wait() {
        let start = Instant::now();
        let ok = poll_until(Duration::from_millis(50), Duration::from_secs(5), || {
            Ok(true)
        })
        .unwrap();
        assert!(ok);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn deadline_reported_as_not_ready() {
        let ok = poll_until(Duration::from_millis(1), Duration::from_millis(5), || {
            Ok(false)
        })
        .unwrap();
        assert!(!ok);
    }

    #[test]
    fn zero_timeout_still_probes_once() {
        let mut calls = 0;
        let ok = poll_until(Duration::from_millis(1), Duration::ZERO, || {
            calls += 1;
            Ok(true)
        })
        .unwrap();
        assert!(ok);
        assert_eq!(calls, 1);
    }

    #[test]
    fn becomes_ready_before_deadline() {
        let mut calls = 0;
        let ok = poll_until(Duration::from_millis(1), Duration::from_secs(5), || {
            calls += 1;
            Ok(calls >= 3)
        })
        .unwrap();
        assert!(ok);
        assert_eq!(calls, 3);
    }

    #[test]
    fn condition_errors_propagate() {
        let err = poll_until(Duration::from_millis(1), Duration::from_secs(1), || {
            Err(crate::Error::BusTimeout)
        })
        .unwrap_err();
        assert_eq!(err, crate::Error::BusTimeout);
    }
}
