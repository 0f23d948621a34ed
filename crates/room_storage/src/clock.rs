//! Lamport logical clock for ordering storage operations.
//!
//! Every replica of a storage document carries one clock. Local mutations
//! tick it; remote operations merge it forward so that subsequent local
//! writes are stamped strictly above anything the replica has observed.

use serde::{Deserialize, Serialize};

/// A Lamport logical clock.
///
/// The clock value monotonically increases. It is updated on both local
/// events (`tick`) and receipt of remote operations (`observe`).
///
/// # Properties
///
/// - If event A happened before event B on causally connected replicas,
///   then `clock(A) < clock(B)`.
/// - Concurrent events may carry any relative ordering, including ties;
///   register conflict resolution handles ties deterministically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LamportClock {
    counter: u64,
}

impl LamportClock {
    /// Creates a new clock with initial value 0.
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Creates a clock with a specific initial value.
    pub fn with_value(value: u64) -> Self {
        Self { counter: value }
    }

    /// Returns the current clock value without incrementing.
    pub fn value(&self) -> u64 {
        self.counter
    }

    /// Increments the clock and returns the new value.
    ///
    /// Called for every local mutation; the returned value stamps the
    /// emitted operation.
    pub fn tick(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Merges a remote timestamp and ticks past it.
    ///
    /// The clock becomes `max(current, remote) + 1`, so the next local
    /// write is stamped strictly above every operation observed so far.
    pub fn observe(&mut self, remote: u64) {
        self.counter = self.counter.max(remote) + 1;
    }

    /// Raises the clock to at least the given value without ticking.
    ///
    /// Used when adopting a snapshot: the snapshot's clock is a floor,
    /// not an event.
    pub fn sync(&mut self, remote: u64) {
        self.counter = self.counter.max(remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clock_starts_at_zero() {
        let clock = LamportClock::new();
        assert_eq!(clock.value(), 0);
    }

    #[test]
    fn test_tick_increments() {
        let mut clock = LamportClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.value(), 2);
    }

    #[test]
    fn test_observe_merges_then_ticks() {
        let mut clock = LamportClock::new();
        clock.tick(); // 1
        clock.tick(); // 2

        // Smaller remote: max(2, 1) + 1 = 3
        clock.observe(1);
        assert_eq!(clock.value(), 3);

        // Larger remote: max(3, 10) + 1 = 11
        clock.observe(10);
        assert_eq!(clock.value(), 11);

        // Equal remote: max(11, 11) + 1 = 12
        clock.observe(11);
        assert_eq!(clock.value(), 12);
    }

    #[test]
    fn test_sync_is_a_floor() {
        let mut clock = LamportClock::new();
        clock.tick(); // 1

        clock.sync(10);
        assert_eq!(clock.value(), 10);

        // Sync with a smaller value leaves the clock alone.
        clock.sync(5);
        assert_eq!(clock.value(), 10);
    }

    #[test]
    fn test_local_write_after_observe_is_strictly_newer() {
        let mut clock = LamportClock::new();
        clock.observe(41);
        assert!(clock.tick() > 42);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let clock = LamportClock::with_value(7);
        let json = serde_json::to_string(&clock).unwrap();
        let restored: LamportClock = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.value(), 7);
    }
}
