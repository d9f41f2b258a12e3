//! Coalescing signal bus.
//!
//! Every [`Signal`] owns one bit of a 32-bit word. Producers OR bits in from
//! any context; the single consumer removes them lowest bit first. A signal
//! posted twice before it is consumed is delivered once.

use core::fmt;

use portable_atomic::{AtomicU32, Ordering};

/// Named events consumed by the orchestrator.
///
/// Discriminants are stable: timers and event sources refer to signals by number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Signal {
    Stop = 0,
    NetworkDisconnected = 1,
    NetworkConnected = 2,
    TimeSynchronized = 3,
    Retransmit = 4,
    Retransmit2 = 5,
    RetransmitMqtt = 6,
    SendStatistics = 7,
    DoAsyncComm = 8,
    RelayingModeChanged = 9,
    NetworkWatchdog = 10,
    TaskWatchdogFeed = 11,
    ConfigReady = 12,
    ConfigChanged = 13,
    BleScanChanged = 14,
    CfgModeActivated = 15,
    CfgModeDeactivated = 16,
    GreenLedTurnOn = 17,
    GreenLedTurnOff = 18,
    GreenLedUpdate = 19,
    RecvAdvTimeout = 20,
    CoprocessorRebooted = 21,
    CoprocessorConfigured = 22,
    CoprocessorCfgUpdate = 23,
    CoprocessorHwResetOff = 24,
    CoprocessorCfgReqTimeout = 25,
    CoprocessorAckTimeout = 26,
    CoprocessorAckLedCtrl = 27,
    CoprocessorAckCfg = 28,
}

impl Signal {
    pub const FIRST: Signal = Signal::Stop;
    pub const LAST: Signal = Signal::CoprocessorAckCfg;

    /// Number of defined signals.
    pub const COUNT: usize = Signal::LAST as usize + 1;

    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Looks up a signal by its stable number.
    #[must_use]
    pub const fn from_number(number: u8) -> Option<Self> {
        Some(match number {
            0 => Signal::Stop,
            1 => Signal::NetworkDisconnected,
            2 => Signal::NetworkConnected,
            3 => Signal::TimeSynchronized,
            4 => Signal::Retransmit,
            5 => Signal::Retransmit2,
            6 => Signal::RetransmitMqtt,
            7 => Signal::SendStatistics,
            8 => Signal::DoAsyncComm,
            9 => Signal::RelayingModeChanged,
            10 => Signal::NetworkWatchdog,
            11 => Signal::TaskWatchdogFeed,
            12 => Signal::ConfigReady,
            13 => Signal::ConfigChanged,
            14 => Signal::BleScanChanged,
            15 => Signal::CfgModeActivated,
            16 => Signal::CfgModeDeactivated,
            17 => Signal::GreenLedTurnOn,
            18 => Signal::GreenLedTurnOff,
            19 => Signal::GreenLedUpdate,
            20 => Signal::RecvAdvTimeout,
            21 => Signal::CoprocessorRebooted,
            22 => Signal::CoprocessorConfigured,
            23 => Signal::CoprocessorCfgUpdate,
            24 => Signal::CoprocessorHwResetOff,
            25 => Signal::CoprocessorCfgReqTimeout,
            26 => Signal::CoprocessorAckTimeout,
            27 => Signal::CoprocessorAckLedCtrl,
            28 => Signal::CoprocessorAckCfg,
            _ => return None,
        })
    }

    /// Short kebab-case name used by the console.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Signal::Stop => "stop",
            Signal::NetworkDisconnected => "network-disconnected",
            Signal::NetworkConnected => "network-connected",
            Signal::TimeSynchronized => "time-synchronized",
            Signal::Retransmit => "retransmit",
            Signal::Retransmit2 => "retransmit2",
            Signal::RetransmitMqtt => "retransmit-mqtt",
            Signal::SendStatistics => "send-statistics",
            Signal::DoAsyncComm => "do-async-comm",
            Signal::RelayingModeChanged => "relaying-mode-changed",
            Signal::NetworkWatchdog => "network-watchdog",
            Signal::TaskWatchdogFeed => "task-watchdog-feed",
            Signal::ConfigReady => "cfg-ready",
            Signal::ConfigChanged => "cfg-changed",
            Signal::BleScanChanged => "ble-scan-changed",
            Signal::CfgModeActivated => "cfg-mode-activated",
            Signal::CfgModeDeactivated => "cfg-mode-deactivated",
            Signal::GreenLedTurnOn => "green-led-on",
            Signal::GreenLedTurnOff => "green-led-off",
            Signal::GreenLedUpdate => "green-led-update",
            Signal::RecvAdvTimeout => "recv-adv-timeout",
            Signal::CoprocessorRebooted => "coproc-rebooted",
            Signal::CoprocessorConfigured => "coproc-configured",
            Signal::CoprocessorCfgUpdate => "coproc-cfg-update",
            Signal::CoprocessorHwResetOff => "coproc-hw-reset-off",
            Signal::CoprocessorCfgReqTimeout => "coproc-cfg-req-timeout",
            Signal::CoprocessorAckTimeout => "coproc-ack-timeout",
            Signal::CoprocessorAckLedCtrl => "coproc-ack-led-ctrl",
            Signal::CoprocessorAckCfg => "coproc-ack-cfg",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Plain (non-atomic) set of signals.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SignalSet(u32);

impl SignalSet {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn with(self, signal: Signal) -> Self {
        Self(self.0 | signal.bit())
    }

    #[must_use]
    pub const fn contains(self, signal: Signal) -> bool {
        self.0 & signal.bit() != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lowest-numbered signal in the set.
    #[must_use]
    pub const fn first(self) -> Option<Signal> {
        if self.0 == 0 {
            return None;
        }
        // trailing_zeros < 32 here, so the cast cannot truncate.
        Signal::from_number(self.0.trailing_zeros() as u8)
    }
}

impl Iterator for SignalSet {
    type Item = Signal;

    fn next(&mut self) -> Option<Signal> {
        let signal = self.first()?;
        self.0 &= !signal.bit();
        Some(signal)
    }
}

/// Lock-free signal word shared between producers and the single consumer.
#[derive(Debug, Default)]
pub struct SignalBus {
    pending: AtomicU32,
}

impl SignalBus {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
        }
    }

    /// Marks `signal` pending. Returns `true` if it was not pending already.
    pub fn post(&self, signal: Signal) -> bool {
        self.pending.fetch_or(signal.bit(), Ordering::AcqRel) & signal.bit() == 0
    }

    /// Removes and returns the lowest pending signal.
    pub fn take_next(&self) -> Option<Signal> {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            let signal = SignalSet(current).first()?;
            match self.pending.compare_exchange_weak(
                current,
                current & !signal.bit(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(signal),
                Err(actual) => current = actual,
            }
        }
    }

    /// Removes every pending signal at once.
    pub fn take_all(&self) -> SignalSet {
        SignalSet(self.pending.swap(0, Ordering::AcqRel))
    }

    #[must_use]
    pub fn snapshot(&self) -> SignalSet {
        SignalSet(self.pending.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }
}

/// Anything that can raise a signal.
///
/// The firmware wraps the bus with an async wake-up; tests and the emulator
/// post straight into a [`SignalBus`].
pub trait SignalSink {
    fn post(&self, signal: Signal);
}

impl SignalSink for SignalBus {
    fn post(&self, signal: Signal) {
        let _ = SignalBus::post(self, signal);
    }
}
