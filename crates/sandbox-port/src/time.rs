//! Cooperative yield, sleep and deadlines.

use std::time::{Duration, Instant};

/// Give up the rest of the time slice.
pub fn yield_now() {
    #[cfg(unix)]
    {
        // sched_yield only fails on platforms that do not implement it.
        if nix::sched::sched_yield().is_err() {
            std::thread::yield_now();
        }
    }
    #[cfg(not(unix))]
    std::thread::yield_now();
}

/// Sleep the calling thread for `duration`.
pub fn sleep(duration: Duration) {
    std::thread::sleep(duration);
}

/// A point in time after which a wait gives up. `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn never() -> Self {
        Self(None)
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// `None` means no timeout.
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        timeout.map_or_else(Self::never, Self::after)
    }

    pub fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before expiry; `None` for an unbounded deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Poll `check` every `interval` until it yields a value or `deadline` passes.
pub fn poll_until<T>(
    deadline: Deadline,
    interval: Duration,
    mut check: impl FnMut() -> Option<T>,
) -> Option<T> {
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if deadline.expired() {
            return None;
        }
        let nap = deadline
            .remaining()
            .map_or(interval, |left| left.min(interval));
        sleep(nap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_does_not_expire() {
        let d = Deadline::never();
        assert!(!d.expired());
        assert_eq!(d.remaining(), None);
    }

    #[test]
    fn zero_timeout_expires_immediately() {
        let d = Deadline::after(Duration::ZERO);
        assert!(d.expired());
        assert_eq!(d.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn poll_until_returns_first_value() {
        let mut calls = 0;
        let got = poll_until(Deadline::never(), Duration::from_millis(1), || {
            calls += 1;
            (calls == 3).then_some(calls)
        });
        assert_eq!(got, Some(3));
    }

    #[test]
    fn poll_until_gives_up_at_deadline() {
        let got: Option<()> = poll_until(
            Deadline::after(Duration::from_millis(20)),
            Duration::from_millis(5),
            || None,
        );
        assert!(got.is_none());
    }

    #[test]
    fn yield_does_not_block() {
        yield_now();
    }
}
