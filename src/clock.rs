//! Time keeping for the driver's polling loops.

/// Things that impl this can tell you how many milliseconds have passed since
/// some fixed point in the past (usually boot).
///
/// The value must never go backwards. Any `Fn() -> u64` closure is a
/// `Clock`, so a `millis` function from your HAL can be passed straight in.
pub trait Clock {
    /// Returns the current time, in milliseconds
    fn now_ms(&self) -> u64;
}

impl<F> Clock for F
where
    F: Fn() -> u64,
{
    fn now_ms(&self) -> u64 {
        self()
    }
}

/// The point at which a wait gives up.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Deadline {
    start_ms: u64,
    timeout_ms: u16,
}

impl Deadline {
    /// Start counting now.
    pub(crate) fn start<C>(clock: &C, timeout_ms: u16) -> Deadline
    where
        C: Clock,
    {
        Deadline {
            start_ms: clock.now_ms(),
            timeout_ms,
        }
    }

    /// Has at least `timeout_ms` passed since [`Deadline::start`]?
    pub(crate) fn is_expired<C>(&self, clock: &C) -> bool
    where
        C: Clock,
    {
        clock.now_ms().wrapping_sub(self.start_ms) >= u64::from(self.timeout_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn closure_is_a_clock() {
        let now = Cell::new(42u64);
        let clock = || now.get();
        assert_eq!(clock.now_ms(), 42);
        now.set(43);
        assert_eq!(clock.now_ms(), 43);
    }

    #[test]
    fn deadline_expires_at_timeout() {
        let now = Cell::new(1_000u64);
        let clock = || now.get();
        let deadline = Deadline::start(&clock, 10);
        assert!(!deadline.is_expired(&clock));
        now.set(1_009);
        assert!(!deadline.is_expired(&clock));
        now.set(1_010);
        assert!(deadline.is_expired(&clock));
    }

    #[test]
    fn zero_timeout_is_expired_immediately() {
        let clock = || 7u64;
        let deadline = Deadline::start(&clock, 0);
        assert!(deadline.is_expired(&clock));
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
