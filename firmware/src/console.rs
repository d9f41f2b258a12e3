//! Diagnostics console served on the first USB CDC interface.
//!
//! Bytes from the host are assembled into lines and executed by the
//! `gateway-core` console against the state shared with the orchestrator.

use core::fmt::Write as _;

use gateway_core::adv_table::{AdvRecord, AdvStore, HistoryFilter};
use gateway_core::config::GatewayConfig;
use gateway_core::console::{Console, ConsoleBackend, Line, MAX_LINE_LEN};
use gateway_core::coprocessor::LinkPhase;
use gateway_core::orchestrator::OrchestratorState;
use gateway_core::signals::{Signal, SignalSink};
use gateway_core::status::{SinkStatus, StatusSnapshot};
use gateway_core::telemetry::{Metrics, MetricsSnapshot};

use crate::clock::WallClock;
use crate::line::{LineBuffer, LineError};
use crate::shared::{SharedSettings, SharedStore};
use crate::signal::AsyncSignalBus;
use crate::status::StatusBoard;

/// [`ConsoleBackend`] reading the firmware's shared state.
pub struct FirmwareBackend<'a, U> {
    board: &'a StatusBoard,
    store: &'a SharedStore,
    settings: &'a SharedSettings,
    metrics: &'a Metrics,
    signals: &'a AsyncSignalBus,
    clock: &'a WallClock,
    uptime_secs: U,
}

impl<'a, U> FirmwareBackend<'a, U>
where
    U: Fn() -> u64,
{
    pub fn with_clock(
        board: &'a StatusBoard,
        store: &'a SharedStore,
        settings: &'a SharedSettings,
        metrics: &'a Metrics,
        signals: &'a AsyncSignalBus,
        clock: &'a WallClock,
        uptime_secs: U,
    ) -> Self {
        Self {
            board,
            store,
            settings,
            metrics,
            signals,
            clock,
            uptime_secs,
        }
    }

    /// Snapshot served before the orchestrator published its first one.
    fn boot_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: OrchestratorState::default(),
            sinks: [SinkStatus::Idle; 4],
            in_progress: None,
            link: LinkPhase::Resetting,
            store_len: self.store.len(),
            store_capacity: gateway_core::adv_table::DEFAULT_CAPACITY,
            metrics: self.metrics.snapshot(),
            uptime: core::time::Duration::from_secs((self.uptime_secs)()),
            since_last_success: core::time::Duration::ZERO,
            nonce: 0,
        }
    }
}

impl<U> ConsoleBackend for FirmwareBackend<'_, U>
where
    U: Fn() -> u64,
{
    fn status(&self) -> StatusSnapshot {
        self.board
            .latest()
            .unwrap_or_else(|| self.boot_snapshot())
    }

    fn history(&self, filter: HistoryFilter, visit: &mut dyn FnMut(&AdvRecord)) {
        let now = if self.settings.use_timestamps() {
            self.clock.now((self.uptime_secs)()).unwrap_or(0)
        } else {
            0
        };
        self.store.visit_history(now, filter, visit);
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn set_relaying(&mut self, enabled: bool) {
        self.settings.set_relaying(enabled);
    }

    fn post(&self, signal: Signal) {
        self.signals.post(signal);
    }
}

/// One console connection: line assembly plus command execution.
pub struct ConsoleSession<B> {
    line: LineBuffer<MAX_LINE_LEN>,
    console: Console<B>,
}

impl<B: ConsoleBackend> ConsoleSession<B> {
    pub const fn new(backend: B) -> Self {
        Self {
            line: LineBuffer::new(),
            console: Console::new(backend),
        }
    }

    /// Host opened or closed the port.
    pub fn reset(&mut self) {
        self.line.reset();
    }

    /// Feeds one byte; every output line of a completed command goes to `emit`.
    pub fn ingest(&mut self, byte: u8, emit: &mut dyn FnMut(&str)) {
        let result = match self.line.ingest(byte) {
            None => return,
            Some(Err(LineError::Overflow)) => {
                emit("error: line too long");
                return;
            }
            Some(Err(LineError::InvalidUtf8)) => {
                emit("error: line is not valid UTF-8");
                return;
            }
            Some(Ok(line)) => self.console.execute(line, emit),
        };
        if let Err(err) = result {
            let mut message = Line::new();
            if write!(message, "error: {err}").is_err() {
                emit("error: command rejected");
            } else {
                emit(&message);
            }
        }
    }
}
