use std::time::{Duration, Instant};

use crate::error::{IpcError, Operation, Result};

/// Wall-clock bound for one whole operation (not per chunk).
///
/// `None` means wait indefinitely.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    timeout: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Deadline {
    pub(crate) fn after(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            expires_at: timeout.map(|t| Instant::now() + t),
        }
    }

    #[cfg(test)]
    pub(crate) fn forever() -> Self {
        Self::after(None)
    }

    /// Time left before expiry, or a `Timeout` error for `op` once it has passed.
    ///
    /// Returns `Ok(None)` for an unbounded deadline. A bounded deadline never
    /// yields `Some(Duration::ZERO)`; zero left is reported as expired.
    pub(crate) fn remaining(&self, op: Operation) -> Result<Option<Duration>> {
        let Some(expires_at) = self.expires_at else {
            return Ok(None);
        };
        let left = expires_at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(self.expired(op));
        }
        Ok(Some(left))
    }

    pub(crate) fn expired(&self, op: Operation) -> IpcError {
        IpcError::Timeout {
            op,
            timeout: self.timeout.unwrap_or_default(),
        }
    }

    /// Remaining time in whole milliseconds for Win32 waits; `None` is infinite.
    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn remaining_millis(&self, op: Operation) -> Result<Option<u32>> {
        Ok(self.remaining(op)?.map(|left| {
            // Round up so a sub-millisecond remainder still waits.
            let millis = left.as_nanos().div_ceil(1_000_000);
            u32::try_from(millis).unwrap_or(u32::MAX - 1).max(1)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_deadline_never_expires() {
        let deadline = Deadline::forever();
        assert_eq!(deadline.remaining(Operation::Read).unwrap(), None);
        assert_eq!(deadline.remaining_millis(Operation::Read).unwrap(), None);
    }

    #[test]
    fn zero_timeout_is_expired_immediately() {
        let deadline = Deadline::after(Some(Duration::ZERO));
        let err = deadline.remaining(Operation::Accept).unwrap_err();
        assert!(matches!(
            err,
            IpcError::Timeout {
                op: Operation::Accept,
                ..
            }
        ));
    }

    #[test]
    fn bounded_deadline_reports_time_left() {
        let deadline = Deadline::after(Some(Duration::from_secs(30)));
        let left = deadline
            .remaining(Operation::Write)
            .unwrap()
            .expect("bounded deadline should report remaining time");
        assert!(left <= Duration::from_secs(30));
        assert!(left > Duration::from_secs(29));

        let millis = deadline.remaining_millis(Operation::Write).unwrap().unwrap();
        assert!(millis > 29_000 && millis <= 30_000);
    }

    #[test]
    fn expired_error_carries_configured_timeout() {
        let deadline = Deadline::after(Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(20));
        match deadline.remaining(Operation::Read) {
            Err(IpcError::Timeout { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_millis(5));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
