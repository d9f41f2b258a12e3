//! Point-in-time gateway status for diagnostics surfaces.

use core::fmt;
use core::time::Duration;

use crate::comm::{NetError, Sink, StartError};
use crate::coprocessor::LinkPhase;
use crate::orchestrator::OrchestratorState;
use crate::telemetry::MetricsSnapshot;

/// Last known outcome of one sink.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SinkStatus {
    /// No transfer has finished since boot.
    #[default]
    Idle,
    Delivered,
    Failed(NetError),
    /// The transfer could not be started at all.
    NotStarted(StartError),
}

impl SinkStatus {
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, SinkStatus::Failed(_) | SinkStatus::NotStarted(_))
    }
}

impl fmt::Display for SinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkStatus::Idle => f.write_str("idle"),
            SinkStatus::Delivered => f.write_str("ok"),
            SinkStatus::Failed(err) => write!(f, "failed ({err})"),
            SinkStatus::NotStarted(err) => write!(f, "not started ({err})"),
        }
    }
}

/// Everything the console's `status` command reports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatusSnapshot {
    pub state: OrchestratorState,
    pub sinks: [SinkStatus; 4],
    pub in_progress: Option<Sink>,
    pub link: LinkPhase,
    pub store_len: usize,
    pub store_capacity: usize,
    pub metrics: MetricsSnapshot,
    pub uptime: Duration,
    /// Time since the last successful transfer.
    pub since_last_success: Duration,
    pub nonce: u32,
}

impl StatusSnapshot {
    #[must_use]
    pub const fn sink(&self, sink: Sink) -> SinkStatus {
        self.sinks[sink.index()]
    }
}
