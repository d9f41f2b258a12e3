//! Network sinks and the single-flight transfer executor.
//!
//! The HTTP and message-bus clients are external. This module only depends on
//! their non-blocking contracts: a transfer is started once and then polled
//! until it reports a terminal outcome.

pub mod executor;
pub mod gate;
pub mod payload;

use core::fmt;
use core::time::Duration;

use crate::adv_table::QueueId;
use crate::timers::TimerId;

pub use self::executor::{AsyncComm, BusStep, CommPoll, StartError};
pub use self::gate::SingleFlightGate;
pub use self::payload::{
    AdvHeader, BodyWriter, EncodeError, HmacKey, LineEncoder, PayloadEncoder, Signature,
    StatisticsReport,
};

/// Destination of one transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sink {
    /// Primary cloud endpoint.
    Primary,
    /// User-configured HTTP endpoint.
    Custom,
    Statistics,
    MessageBus,
}

impl Sink {
    /// Service order when several sinks need data at once.
    pub const PRIORITY: [Sink; 4] = [Sink::Primary, Sink::Custom, Sink::Statistics, Sink::MessageBus];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Sink::Primary => 0,
            Sink::Custom => 1,
            Sink::Statistics => 2,
            Sink::MessageBus => 3,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Sink::Primary => "primary",
            Sink::Custom => "custom",
            Sink::Statistics => "stats",
            Sink::MessageBus => "bus",
        }
    }

    /// Retransmission queue drained for this sink. Statistics read the whole store instead.
    #[must_use]
    pub const fn queue(self) -> Option<QueueId> {
        match self {
            Sink::Primary => Some(QueueId::Sink1),
            Sink::Custom => Some(QueueId::Sink2),
            Sink::Statistics => None,
            Sink::MessageBus => Some(QueueId::Bus),
        }
    }

    /// Timer that schedules this sink.
    #[must_use]
    pub const fn timer(self) -> TimerId {
        match self {
            Sink::Primary => TimerId::Retransmit,
            Sink::Custom => TimerId::Retransmit2,
            Sink::Statistics => TimerId::SendStatistics,
            Sink::MessageBus => TimerId::RetransmitMqtt,
        }
    }

    /// HTTP targets carry their own signing key.
    #[must_use]
    pub const fn is_http(self) -> bool {
        !matches!(self, Sink::MessageBus)
    }
}

impl fmt::Display for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transfer failure classes surfaced by the network clients.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetError {
    Dns,
    Connect,
    /// The server rejected our credentials or signature.
    Auth,
    Timeout,
    /// The server answered with a non-success status.
    Status(u16),
    Generic,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Dns => f.write_str("dns lookup failed"),
            NetError::Connect => f.write_str("connect failed"),
            NetError::Auth => f.write_str("authorization rejected"),
            NetError::Timeout => f.write_str("timed out"),
            NetError::Status(code) => write!(f, "http status {code}"),
            NetError::Generic => f.write_str("transfer failed"),
        }
    }
}

/// Terminal success reported by the HTTP client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Server-requested retransmission period.
    pub rate_override: Option<Duration>,
    /// Replacement signing key for the target that was just used.
    pub rotated_key: Option<HmacKey>,
}

impl HttpResponse {
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            status: 200,
            rate_override: None,
            rotated_key: None,
        }
    }
}

/// Progress of the in-flight HTTP request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HttpPoll {
    Pending,
    Done(Result<HttpResponse, NetError>),
}

/// Non-blocking HTTP client contract.
pub trait HttpClient {
    /// Request body buffer, or `None` when memory is short.
    fn body_buffer(&mut self) -> Option<&mut [u8]>;

    /// Starts sending the first `body_len` bytes of the body buffer to `sink`.
    fn start(
        &mut self,
        sink: Sink,
        body_len: usize,
        signature: Option<&str>,
    ) -> Result<(), NetError>;

    fn poll(&mut self) -> HttpPoll;

    /// Abandons the in-flight request, if any.
    fn abort(&mut self);
}

/// Message-bus client contract.
pub trait MessageBusClient {
    fn is_connected(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), NetError>;
}
