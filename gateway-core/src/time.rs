//! Monotonic time base shared by timers, the executor and the coprocessor link.

use core::{ops::Add, time::Duration};

/// Milliseconds since boot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Instant(u64);

impl Instant {
    /// Boot instant.
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000))
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1_000
    }

    /// Returns the time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Steps back by `duration`, returning `None` before boot.
    #[must_use]
    pub fn checked_sub(self, duration: Duration) -> Option<Self> {
        self.0.checked_sub(duration_millis(duration)).map(Self)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(duration_millis(rhs)))
    }
}

/// Converts a duration to whole milliseconds, saturating at `u64::MAX`.
#[must_use]
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition_saturates() {
        let late = Instant::from_millis(u64::MAX - 5);
        assert_eq!(late + Duration::from_millis(10), Instant::from_millis(u64::MAX));
    }

    #[test]
    fn checked_sub_stops_at_boot() {
        let now = Instant::from_secs(30);
        assert_eq!(
            now.checked_sub(Duration::from_secs(10)),
            Some(Instant::from_secs(20))
        );
        assert_eq!(now.checked_sub(Duration::from_secs(31)), None);
    }

    #[test]
    fn duration_since_is_saturating() {
        let earlier = Instant::from_millis(100);
        let later = Instant::from_millis(350);
        assert_eq!(later.saturating_duration_since(earlier), Duration::from_millis(250));
        assert_eq!(earlier.saturating_duration_since(later), Duration::ZERO);
    }
}
