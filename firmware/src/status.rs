#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Shared status storage for the firmware target.
//!
//! The orchestrator task publishes a [`StatusSnapshot`] after every loop
//! iteration and reports indicator events through atomics, so the console and
//! the LED task never touch orchestrator state directly.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use gateway_core::comm::Sink;
use gateway_core::orchestrator::Indicators;
use gateway_core::status::StatusSnapshot;
use portable_atomic::{AtomicBool, AtomicU8, Ordering};

use crate::shared::GatewayMutex;

/// Latest orchestrator snapshot, `None` until the first publish.
pub struct StatusBoard {
    latest: Mutex<GatewayMutex, Cell<Option<StatusSnapshot>>>,
}

impl StatusBoard {
    pub const fn new() -> Self {
        Self {
            latest: Mutex::new(Cell::new(None)),
        }
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        self.latest.lock(|latest| latest.set(Some(snapshot)));
    }

    pub fn latest(&self) -> Option<StatusSnapshot> {
        self.latest.lock(Cell::get)
    }
}

/// What an indicator LED shows.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LedPattern {
    Off,
    On,
    Blink,
}

const NO_RESULT: u8 = 0;
const LAST_OK: u8 = 1;
const LAST_FAILED: u8 = 2;

/// Indicator flags written by the orchestrator and the receive task.
pub struct IndicatorState {
    /// Outcome of the most recent finished transfer on any sink.
    transfer: AtomicU8,
    /// Bit per [`Sink::index`] whose last transfer failed.
    failed_sinks: AtomicU8,
    coprocessor_configured: AtomicBool,
    receive_idle: AtomicBool,
}

impl IndicatorState {
    pub const fn new() -> Self {
        Self {
            transfer: AtomicU8::new(NO_RESULT),
            failed_sinks: AtomicU8::new(0),
            coprocessor_configured: AtomicBool::new(false),
            receive_idle: AtomicBool::new(false),
        }
    }

    pub fn record_transfer(&self, sink: Sink, ok: bool) {
        let bit = 1 << sink.index();
        if ok {
            self.failed_sinks.fetch_and(!bit, Ordering::Relaxed);
            self.transfer.store(LAST_OK, Ordering::Relaxed);
        } else {
            self.failed_sinks.fetch_or(bit, Ordering::Relaxed);
            self.transfer.store(LAST_FAILED, Ordering::Relaxed);
        }
    }

    pub fn record_configured(&self) {
        self.coprocessor_configured.store(true, Ordering::Relaxed);
    }

    /// The coprocessor rebooted or is being reset.
    pub fn record_unconfigured(&self) {
        self.coprocessor_configured.store(false, Ordering::Relaxed);
    }

    pub fn record_receive_idle(&self) {
        self.receive_idle.store(true, Ordering::Relaxed);
    }

    pub fn record_advertisement(&self) {
        self.receive_idle.store(false, Ordering::Relaxed);
    }

    pub fn sink_failed(&self, sink: Sink) -> bool {
        self.failed_sinks.load(Ordering::Relaxed) & (1 << sink.index()) != 0
    }

    /// Uplink LED: steady after a delivered transfer, blinking after a failure.
    pub fn uplink_led(&self) -> LedPattern {
        match self.transfer.load(Ordering::Relaxed) {
            LAST_OK if self.failed_sinks.load(Ordering::Relaxed) == 0 => LedPattern::On,
            NO_RESULT => LedPattern::Off,
            _ => LedPattern::Blink,
        }
    }

    /// Radio LED: dark until the coprocessor is configured, blinking while no
    /// advertisements arrive.
    pub fn radio_led(&self) -> LedPattern {
        if !self.coprocessor_configured.load(Ordering::Relaxed) {
            LedPattern::Off
        } else if self.receive_idle.load(Ordering::Relaxed) {
            LedPattern::Blink
        } else {
            LedPattern::On
        }
    }
}

/// [`Indicators`] handed to the orchestrator.
#[derive(Clone, Copy)]
pub struct StatusIndicators<'a> {
    state: &'a IndicatorState,
}

impl<'a> StatusIndicators<'a> {
    pub const fn new(state: &'a IndicatorState) -> Self {
        Self { state }
    }
}

impl Indicators for StatusIndicators<'_> {
    fn transfer_result(&mut self, sink: Sink, ok: bool) {
        self.state.record_transfer(sink, ok);
    }

    fn coprocessor_configured(&mut self) {
        self.state.record_configured();
    }

    fn no_advertisements(&mut self) {
        self.state.record_receive_idle();
    }
}

#[cfg(test)]
mod tests {
    use gateway_core::coprocessor::LinkPhase;
    use gateway_core::orchestrator::OrchestratorState;
    use gateway_core::telemetry::MetricsSnapshot;

    use super::*;

    #[test]
    fn board_is_empty_until_published() {
        let board = StatusBoard::new();
        assert_eq!(board.latest(), None);

        let snapshot = StatusSnapshot {
            state: OrchestratorState::default(),
            sinks: Default::default(),
            in_progress: Some(Sink::Primary),
            link: LinkPhase::Unconfigured,
            store_len: 3,
            store_capacity: 100,
            metrics: MetricsSnapshot::default(),
            uptime: core::time::Duration::from_secs(5),
            since_last_success: core::time::Duration::ZERO,
            nonce: 7,
        };
        board.publish(snapshot);
        assert_eq!(board.latest(), Some(snapshot));
    }

    #[test]
    fn uplink_led_blinks_until_every_failed_sink_recovers() {
        let state = IndicatorState::new();
        let mut indicators = StatusIndicators::new(&state);
        assert_eq!(state.uplink_led(), LedPattern::Off);

        indicators.transfer_result(Sink::Primary, true);
        assert_eq!(state.uplink_led(), LedPattern::On);

        indicators.transfer_result(Sink::Custom, false);
        assert_eq!(state.uplink_led(), LedPattern::Blink);
        assert!(state.sink_failed(Sink::Custom));

        indicators.transfer_result(Sink::Primary, true);
        assert_eq!(state.uplink_led(), LedPattern::Blink);

        indicators.transfer_result(Sink::Custom, true);
        assert_eq!(state.uplink_led(), LedPattern::On);
    }

    #[test]
    fn radio_led_follows_configuration_and_receive_activity() {
        let state = IndicatorState::new();
        let mut indicators = StatusIndicators::new(&state);
        assert_eq!(state.radio_led(), LedPattern::Off);

        indicators.coprocessor_configured();
        assert_eq!(state.radio_led(), LedPattern::On);

        indicators.no_advertisements();
        assert_eq!(state.radio_led(), LedPattern::Blink);

        state.record_advertisement();
        assert_eq!(state.radio_led(), LedPattern::On);

        state.record_unconfigured();
        assert_eq!(state.radio_led(), LedPattern::Off);
    }
}
