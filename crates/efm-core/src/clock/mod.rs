//! Logical tick source.
//!
//! All scheduling decisions in the runtime are made against a monotone
//! logical clock. The clock only moves forward; a regression is impossible
//! by construction because advancement uses `fetch_max` on an atomic
//! counter.
//!
//! Tests substitute a fresh [`TickSource`] instance; there is no process
//! global.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A point in logical time.
///
/// Ticks are opaque monotone counters. The daemon's sweeper task advances
/// the shared [`TickSource`] once per scheduling round; every subsystem
/// reads the same source.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Tick(u64);

impl Tick {
    /// The zero tick (process start).
    pub const ZERO: Self = Self(0);

    /// Creates a tick from a raw counter value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw counter value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the tick advanced by `n`, saturating at the maximum.
    #[must_use]
    pub const fn plus(self, n: u64) -> Self {
        Self(self.0.saturating_add(n))
    }

    /// Returns the number of ticks elapsed since `earlier`, or 0 if
    /// `earlier` is in the future.
    #[must_use]
    pub const fn since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl From<u64> for Tick {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// The monotone logical clock shared by all runtime actors.
///
/// Cloning is cheap; clones observe the same counter.
#[derive(Debug, Clone, Default)]
pub struct TickSource {
    counter: Arc<AtomicU64>,
}

impl TickSource {
    /// Creates a new tick source starting at tick 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tick source starting at an arbitrary tick.
    ///
    /// Used when replaying a registry checkpoint.
    #[must_use]
    pub fn starting_at(tick: Tick) -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(tick.value())),
        }
    }

    /// Returns the current tick.
    #[must_use]
    pub fn now(&self) -> Tick {
        Tick(self.counter.load(Ordering::Acquire))
    }

    /// Advances the clock by one tick and returns the new value.
    pub fn advance(&self) -> Tick {
        Tick(self.counter.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Advances the clock by `n` ticks and returns the new value.
    pub fn advance_by(&self, n: u64) -> Tick {
        Tick(self.counter.fetch_add(n, Ordering::AcqRel) + n)
    }

    /// Moves the clock forward to at least `target`.
    ///
    /// A target behind the current tick is a no-op; the clock never
    /// regresses (`fetch_max` guards against concurrent movers).
    pub fn advance_to(&self, target: Tick) -> Tick {
        let prev = self.counter.fetch_max(target.value(), Ordering::AcqRel);
        Tick(prev.max(target.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_ordered() {
        assert!(Tick::new(1) < Tick::new(2));
        assert_eq!(Tick::new(5).since(Tick::new(2)), 3);
        assert_eq!(Tick::new(2).since(Tick::new(5)), 0);
    }

    #[test]
    fn advance_is_monotone() {
        let clock = TickSource::new();
        assert_eq!(clock.now(), Tick::ZERO);

        let t1 = clock.advance();
        let t2 = clock.advance_by(10);
        assert_eq!(t1, Tick::new(1));
        assert_eq!(t2, Tick::new(11));
        assert_eq!(clock.now(), Tick::new(11));
    }

    #[test]
    fn advance_to_never_regresses() {
        let clock = TickSource::starting_at(Tick::new(100));
        clock.advance_to(Tick::new(50));
        assert_eq!(clock.now(), Tick::new(100));

        clock.advance_to(Tick::new(150));
        assert_eq!(clock.now(), Tick::new(150));
    }

    #[test]
    fn clones_share_the_counter() {
        let clock = TickSource::new();
        let other = clock.clone();
        clock.advance_by(7);
        assert_eq!(other.now(), Tick::new(7));
    }
}
