//! Gateway counters shared between the orchestrator, the receive path and the
//! diagnostics surfaces.
//!
//! Every counter is a lone atomic so producers on other execution contexts can
//! bump them without taking a lock. Readers get a consistent-enough
//! [`MetricsSnapshot`]; counters are never reset except `adv_received`, which
//! the watchdog feed drains once per period.

use core::fmt;

use portable_atomic::{AtomicU32, Ordering};

/// Individual counters tracked by [`Metrics`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Counter {
    /// Coprocessor reboots outside the post-reset window.
    CoprocessorSelfReboots,
    /// Hardware resets issued to the coprocessor.
    CoprocessorExtHwResets,
    /// ACK timeouts.
    LostAcks,
    NetworkDisconnects,
    /// Request buffer allocation failures.
    LowMemoryEvents,
    /// Advertisements accepted from the coprocessor since the last drain.
    AdvReceived,
}

impl Counter {
    pub const ALL: [Counter; 6] = [
        Counter::CoprocessorSelfReboots,
        Counter::CoprocessorExtHwResets,
        Counter::LostAcks,
        Counter::NetworkDisconnects,
        Counter::LowMemoryEvents,
        Counter::AdvReceived,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Counter::CoprocessorSelfReboots => "coproc-self-reboots",
            Counter::CoprocessorExtHwResets => "coproc-ext-hw-resets",
            Counter::LostAcks => "coproc-lost-acks",
            Counter::NetworkDisconnects => "network-disconnects",
            Counter::LowMemoryEvents => "low-memory-events",
            Counter::AdvReceived => "adv-received",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Atomic counter block.
#[derive(Debug, Default)]
pub struct Metrics {
    self_reboots: AtomicU32,
    ext_hw_resets: AtomicU32,
    lost_acks: AtomicU32,
    network_disconnects: AtomicU32,
    low_memory_events: AtomicU32,
    adv_received: AtomicU32,
}

impl Metrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            self_reboots: AtomicU32::new(0),
            ext_hw_resets: AtomicU32::new(0),
            lost_acks: AtomicU32::new(0),
            network_disconnects: AtomicU32::new(0),
            low_memory_events: AtomicU32::new(0),
            adv_received: AtomicU32::new(0),
        }
    }

    const fn cell(&self, counter: Counter) -> &AtomicU32 {
        match counter {
            Counter::CoprocessorSelfReboots => &self.self_reboots,
            Counter::CoprocessorExtHwResets => &self.ext_hw_resets,
            Counter::LostAcks => &self.lost_acks,
            Counter::NetworkDisconnects => &self.network_disconnects,
            Counter::LowMemoryEvents => &self.low_memory_events,
            Counter::AdvReceived => &self.adv_received,
        }
    }

    /// Adds one, wrapping on overflow. Returns the new value.
    pub fn increment(&self, counter: Counter) -> u32 {
        self.cell(counter)
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    #[must_use]
    pub fn get(&self, counter: Counter) -> u32 {
        self.cell(counter).load(Ordering::Relaxed)
    }

    /// Reads and zeroes `counter`.
    pub fn take(&self, counter: Counter) -> u32 {
        self.cell(counter).swap(0, Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            coprocessor_self_reboots: self.get(Counter::CoprocessorSelfReboots),
            coprocessor_ext_hw_resets: self.get(Counter::CoprocessorExtHwResets),
            lost_acks: self.get(Counter::LostAcks),
            network_disconnects: self.get(Counter::NetworkDisconnects),
            low_memory_events: self.get(Counter::LowMemoryEvents),
            adv_received: self.get(Counter::AdvReceived),
        }
    }
}

/// Plain copy of [`Metrics`] at one point in time.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MetricsSnapshot {
    pub coprocessor_self_reboots: u32,
    pub coprocessor_ext_hw_resets: u32,
    pub lost_acks: u32,
    pub network_disconnects: u32,
    pub low_memory_events: u32,
    pub adv_received: u32,
}

impl MetricsSnapshot {
    #[must_use]
    pub const fn get(&self, counter: Counter) -> u32 {
        match counter {
            Counter::CoprocessorSelfReboots => self.coprocessor_self_reboots,
            Counter::CoprocessorExtHwResets => self.coprocessor_ext_hw_resets,
            Counter::LostAcks => self.lost_acks,
            Counter::NetworkDisconnects => self.network_disconnects,
            Counter::LowMemoryEvents => self.low_memory_events,
            Counter::AdvReceived => self.adv_received,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let metrics = Metrics::new();
        assert_eq!(metrics.increment(Counter::LostAcks), 1);
        assert_eq!(metrics.increment(Counter::LostAcks), 2);
        metrics.increment(Counter::NetworkDisconnects);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.lost_acks, 2);
        assert_eq!(snapshot.network_disconnects, 1);
        assert_eq!(snapshot.coprocessor_self_reboots, 0);
        for counter in Counter::ALL {
            assert_eq!(snapshot.get(counter), metrics.get(counter));
        }
    }

    #[test]
    fn take_resets_only_the_named_counter() {
        let metrics = Metrics::new();
        metrics.increment(Counter::AdvReceived);
        metrics.increment(Counter::AdvReceived);
        metrics.increment(Counter::LowMemoryEvents);

        assert_eq!(metrics.take(Counter::AdvReceived), 2);
        assert_eq!(metrics.get(Counter::AdvReceived), 0);
        assert_eq!(metrics.get(Counter::LowMemoryEvents), 1);
    }
}
