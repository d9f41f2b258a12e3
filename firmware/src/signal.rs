//! Signal bus with an async wake-up for the orchestrator task.
//!
//! Producers on any task post into the lock-free [`SignalBus`] word and then
//! raise an Embassy [`Signal`] so the single consumer stops sleeping. Several
//! posts between two wake-ups collapse into one wake; the bus word keeps every
//! distinct signal.

use embassy_sync::signal::Signal as WakeSignal;
use gateway_core::signals::{Signal, SignalBus, SignalSink};

use crate::shared::GatewayMutex;

pub struct AsyncSignalBus {
    bus: SignalBus,
    wake: WakeSignal<GatewayMutex, ()>,
}

impl AsyncSignalBus {
    pub const fn new() -> Self {
        Self {
            bus: SignalBus::new(),
            wake: WakeSignal::new(),
        }
    }

    /// The underlying bus, handed to the orchestrator as its signal source.
    pub const fn bus(&self) -> &SignalBus {
        &self.bus
    }

    /// Resolves once a signal is pending.
    pub async fn wait(&self) {
        while !self.bus.is_pending() {
            self.wake.wait().await;
        }
    }

    /// Wakes the consumer without posting, e.g. after the orchestrator posted
    /// to the bus directly.
    pub fn notify(&self) {
        self.wake.signal(());
    }
}

impl SignalSink for AsyncSignalBus {
    fn post(&self, signal: Signal) {
        self.bus.post(signal);
        self.wake.signal(());
    }
}
