//! Monotonic tick source.
//!
//! The original design reads a cycle counter and a ticks-per-second
//! constant; a hosted process has [`std::time::Instant`] for the same
//! purpose. The trait exists so the queue-full-drain and timeout paths in
//! `queue.rs` can be driven by a fake clock in tests without sleeping.

use std::time::{Duration, Instant};

/// A source of monotonic time, abstracted so timeout logic is testable.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// The real wall clock, backed by `Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Returns whether `deadline` (an absolute instant) has passed according to
/// `clock`.
pub fn deadline_elapsed(clock: &dyn Clock, deadline: Instant) -> bool {
    clock.now() >= deadline
}

/// Computes the deadline for `timeout` from now, per spec.md S4.3's "record
/// an end-timestamp `now + timeout * one-second-in-ticks`" — generalized
/// from the original's whole-second `UNVME_TIMEOUT` to a full-precision
/// [`Duration`] so a remaining-budget timeout passed in from a caller-level
/// deadline (see `scheduler::wait`) doesn't get truncated to zero on its
/// last, sub-second call.
pub fn deadline_from_timeout(clock: &dyn Clock, timeout: Duration) -> Instant {
    clock.now() + timeout
}
