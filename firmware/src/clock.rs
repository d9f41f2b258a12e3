//! Wall clock and advertisement timestamps.
//!
//! The board has no RTC. The uplink host reports the current epoch time and
//! the clock keeps the offset from the monotonic uptime.

use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

pub struct WallClock {
    /// Epoch seconds at boot.
    offset: AtomicU64,
    synced: AtomicBool,
    sequence: AtomicU32,
}

impl WallClock {
    pub const fn new() -> Self {
        Self {
            offset: AtomicU64::new(0),
            synced: AtomicBool::new(false),
            sequence: AtomicU32::new(0),
        }
    }

    /// Anchors the clock. Returns `true` on the first sync since boot.
    pub fn set(&self, epoch_secs: u64, uptime_secs: u64) -> bool {
        self.offset
            .store(epoch_secs.saturating_sub(uptime_secs), Ordering::Relaxed);
        !self.synced.swap(true, Ordering::AcqRel)
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Current epoch seconds, once synced.
    pub fn now(&self, uptime_secs: u64) -> Option<u64> {
        self.is_synced()
            .then(|| self.offset.load(Ordering::Relaxed).saturating_add(uptime_secs))
    }

    /// Timestamp for the next received advertisement: epoch seconds when
    /// relaying with timestamps, otherwise the next sequence number.
    pub fn stamp(&self, use_timestamps: bool, uptime_secs: u64) -> u64 {
        if use_timestamps {
            self.now(uptime_secs).unwrap_or(0)
        } else {
            u64::from(self.sequence.load(Ordering::Relaxed).wrapping_add(1))
        }
    }

    /// Consumes the sequence number after an advertisement was stored with it.
    pub fn advance_sequence(&self) {
        self.sequence.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsynced_clock_has_no_time() {
        let clock = WallClock::new();
        assert_eq!(clock.now(42), None);
        assert_eq!(clock.stamp(true, 42), 0);
    }

    #[test]
    fn offset_tracks_uptime_after_sync() {
        let clock = WallClock::new();
        assert!(clock.set(1_700_000_100, 100));
        assert_eq!(clock.now(160), Some(1_700_000_160));
        assert!(!clock.set(1_700_000_200, 199));
        assert_eq!(clock.now(200), Some(1_700_000_201));
    }

    #[test]
    fn sequence_stamps_advance_once_per_stored_advertisement() {
        let clock = WallClock::new();
        assert_eq!(clock.stamp(false, 0), 1);
        assert_eq!(clock.stamp(false, 0), 1);
        clock.advance_sequence();
        assert_eq!(clock.stamp(false, 0), 2);
        clock.set(1_000, 0);
        assert_eq!(clock.stamp(true, 5), 1_005);
        assert_eq!(clock.stamp(false, 5), 2);
    }
}
