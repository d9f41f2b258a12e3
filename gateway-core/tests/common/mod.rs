#![allow(dead_code)]

use core::cell::RefCell;
use std::collections::VecDeque;

use gateway_core::adv_table::AdvTable;
use gateway_core::comm::{
    HttpClient, HttpPoll, LineEncoder, MessageBusClient, NetError, SingleFlightGate, Sink,
};
use gateway_core::config::{GatewayConfig, GatewaySettings, ScanFilterCache};
use gateway_core::coprocessor::protocol::{Request, decode_request, encode_frame, opcode};
use gateway_core::coprocessor::{
    CoprocessorLink, CoprocessorTransport, ReceivePath, RxContext, RxEvent, TransportError,
};
use gateway_core::orchestrator::{
    Indicators, Orchestrator, Parts, Platform, RestartReason, Shared, SystemControl,
};
use gateway_core::signals::SignalBus;
use gateway_core::telemetry::Metrics;
use gateway_core::time::Instant;

pub const CAPACITY: usize = 16;
pub const WALL_CLOCK: u64 = 1_700_000_000;

pub type Store = RefCell<AdvTable<CAPACITY>>;

const BODY_CAPACITY: usize = LineEncoder::max_body_len(CAPACITY);

pub struct ScriptedHttp {
    buffer: [u8; BODY_CAPACITY],
    pub out_of_memory: bool,
    pub replies: VecDeque<HttpPoll>,
    pub started: Vec<(Sink, String)>,
    pub aborted: usize,
}

impl Default for ScriptedHttp {
    fn default() -> Self {
        Self {
            buffer: [0; BODY_CAPACITY],
            out_of_memory: false,
            replies: VecDeque::new(),
            started: Vec::new(),
            aborted: 0,
        }
    }
}

impl HttpClient for ScriptedHttp {
    fn body_buffer(&mut self) -> Option<&mut [u8]> {
        (!self.out_of_memory).then_some(&mut self.buffer[..])
    }

    fn start(&mut self, sink: Sink, body_len: usize, _: Option<&str>) -> Result<(), NetError> {
        let body = String::from_utf8_lossy(&self.buffer[..body_len]).into_owned();
        self.started.push((sink, body));
        Ok(())
    }

    fn poll(&mut self) -> HttpPoll {
        self.replies.pop_front().unwrap_or(HttpPoll::Pending)
    }

    fn abort(&mut self) {
        self.aborted += 1;
    }
}

#[derive(Default)]
pub struct RecordingBus {
    pub connected: bool,
    pub published: Vec<(String, Vec<u8>, bool)>,
}

impl MessageBusClient for RecordingBus {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), NetError> {
        self.published
            .push((topic.to_owned(), payload.to_vec(), retained));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    pub requests: Vec<Request>,
    pub resets: Vec<bool>,
}

impl RecordingTransport {
    pub fn set_all_count(&self) -> usize {
        self.requests
            .iter()
            .filter(|request| matches!(request, Request::SetAll(_)))
            .count()
    }
}

impl CoprocessorTransport for RecordingTransport {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let request = decode_request(frame).map_err(|_| TransportError::Io)?;
        self.requests.push(request);
        Ok(())
    }

    fn set_reset(&mut self, asserted: bool) {
        self.resets.push(asserted);
    }
}

#[derive(Default)]
pub struct RecordingIndicators {
    pub results: Vec<(Sink, bool)>,
    pub configured: usize,
    pub idle_windows: usize,
}

impl Indicators for RecordingIndicators {
    fn transfer_result(&mut self, sink: Sink, ok: bool) {
        self.results.push((sink, ok));
    }

    fn coprocessor_configured(&mut self) {
        self.configured += 1;
    }

    fn no_advertisements(&mut self) {
        self.idle_windows += 1;
    }
}

#[derive(Default)]
pub struct RecordingSystem {
    pub restarts: Vec<RestartReason>,
    pub feeds: usize,
}

impl SystemControl for RecordingSystem {
    fn restart(&mut self, reason: RestartReason) {
        self.restarts.push(reason);
    }

    fn feed_watchdog(&mut self) {
        self.feeds += 1;
    }

    fn mark_image_valid(&mut self) {}

    fn wall_clock(&self) -> Option<u64> {
        Some(WALL_CLOCK)
    }
}

pub struct HostPlatform;

impl Platform for HostPlatform {
    type Http = ScriptedHttp;
    type Bus = RecordingBus;
    type Encoder = LineEncoder;
    type Transport = RecordingTransport;
    type Indicators = RecordingIndicators;
    type System = RecordingSystem;
}

pub type HostOrchestrator<'a, C> = Orchestrator<'a, HostPlatform, C, Store, CAPACITY>;

/// Everything the orchestrator shares with the receive path.
pub struct Gateway<C = GatewaySettings> {
    pub config: C,
    pub store: Store,
    pub signals: SignalBus,
    pub metrics: Metrics,
    pub link: CoprocessorLink,
    pub gate: SingleFlightGate,
    pub scan_filter: ScanFilterCache,
}

impl<C: GatewayConfig> Gateway<C> {
    pub fn new(config: C) -> Self {
        Self {
            config,
            store: RefCell::new(AdvTable::new()),
            signals: SignalBus::new(),
            metrics: Metrics::new(),
            link: CoprocessorLink::new(),
            gate: SingleFlightGate::new(),
            scan_filter: ScanFilterCache::new(),
        }
    }

    pub fn orchestrator(&self, now: Instant) -> HostOrchestrator<'_, C> {
        let shared = Shared {
            config: &self.config,
            store: &self.store,
            signals: &self.signals,
            metrics: &self.metrics,
            link: &self.link,
            gate: &self.gate,
            scan_filter: &self.scan_filter,
        };
        let parts = Parts {
            http: ScriptedHttp::default(),
            bus: RecordingBus::default(),
            encoder: LineEncoder,
            transport: RecordingTransport::default(),
            indicators: RecordingIndicators::default(),
            system: RecordingSystem::default(),
        };
        Orchestrator::new(shared, parts, 0, now)
    }

    /// Pushes raw coprocessor bytes through the receive path.
    pub fn receive(&self, rx: &mut ReceivePath<CAPACITY>, bytes: &[u8]) -> Vec<RxEvent> {
        let ctx = RxContext {
            store: &self.store,
            link: &self.link,
            signals: &self.signals,
            metrics: &self.metrics,
            scan_filter: &self.scan_filter,
        };
        let mut events = Vec::new();
        rx.extend(bytes, WALL_CLOCK, &ctx, |event| events.push(event));
        events
    }
}

pub fn adv_report(last: u8) -> Vec<u8> {
    encode_frame(opcode::ADV_REPORT, &[0xC0, 0, 0, 0, 0, last, 0xC4, 0x99, 0x04, last]).to_vec()
}

pub fn ack(command: u8) -> Vec<u8> {
    encode_frame(opcode::ACK, &[command, 0]).to_vec()
}

pub fn rebooted() -> Vec<u8> {
    encode_frame(opcode::REBOOTED, &[]).to_vec()
}

/// Dispatches until the bus stays empty.
pub fn settle<C: GatewayConfig>(orch: &mut HostOrchestrator<'_, C>, now: Instant) {
    while orch.run_once(now) > 0 {}
}
