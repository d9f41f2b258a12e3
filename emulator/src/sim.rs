//! Simulated collaborators for the host emulator.
//!
//! Every collaborator records what the orchestrator asked of it so the
//! session can narrate it, and replies according to knobs the `sim`
//! commands turn.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

use gateway_core::adv_table::{AdvTable, MacAddress};
use gateway_core::comm::{
    HttpClient, HttpPoll, HttpResponse, LineEncoder, MessageBusClient, NetError, SingleFlightGate,
    Sink,
};
use gateway_core::config::{
    FilterConfig, GatewayConfig, GatewaySettings, ScanConfig, ScanFilterCache, TopicPrefix,
};
use gateway_core::coprocessor::protocol::{Request, decode_request, encode_frame, opcode};
use gateway_core::coprocessor::{CoprocessorLink, CoprocessorTransport, TransportError};
use gateway_core::orchestrator::{Indicators, Platform, RestartReason, SystemControl};
use gateway_core::signals::SignalBus;
use gateway_core::telemetry::Metrics;

pub const STORE_CAPACITY: usize = gateway_core::adv_table::DEFAULT_CAPACITY;

const BODY_CAPACITY: usize = LineEncoder::max_body_len(STORE_CAPACITY);

/// Gateway settings the `sim cfg` commands edit in place.
#[derive(Default)]
pub struct SimSettings(RefCell<GatewaySettings>);

impl SimSettings {
    pub fn update<R>(&self, f: impl FnOnce(&mut GatewaySettings) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

impl GatewayConfig for SimSettings {
    fn use_timestamps(&self) -> bool {
        self.0.borrow().use_timestamps()
    }

    fn scan(&self) -> ScanConfig {
        self.0.borrow().scan()
    }

    fn filter(&self) -> FilterConfig {
        self.0.borrow().filter()
    }

    fn scan_filter_allow_listed(&self) -> bool {
        self.0.borrow().scan_filter_allow_listed()
    }

    fn visit_scan_filter(&self, visit: &mut dyn FnMut(&[MacAddress])) {
        self.0.borrow().visit_scan_filter(visit);
    }

    fn relaying_enabled(&self) -> bool {
        self.0.borrow().relaying_enabled()
    }

    fn primary_enabled(&self) -> bool {
        self.0.borrow().primary_enabled()
    }

    fn custom_enabled(&self) -> bool {
        self.0.borrow().custom_enabled()
    }

    fn custom_period(&self) -> Duration {
        self.0.borrow().custom_period()
    }

    fn statistics_enabled(&self) -> bool {
        self.0.borrow().statistics_enabled()
    }

    fn bus_enabled(&self) -> bool {
        self.0.borrow().bus_enabled()
    }

    fn bus_interval(&self) -> Duration {
        self.0.borrow().bus_interval()
    }

    fn bus_topic_prefix(&self) -> TopicPrefix {
        self.0.borrow().bus_topic_prefix()
    }

    fn network_watchdog_timeout(&self) -> Duration {
        self.0.borrow().network_watchdog_timeout()
    }
}

pub type SimStore = RefCell<AdvTable<STORE_CAPACITY>>;

/// State the orchestrator shares with the receive path and the console.
pub struct GatewayState {
    pub settings: SimSettings,
    pub store: SimStore,
    pub signals: SignalBus,
    pub metrics: Metrics,
    pub link: CoprocessorLink,
    pub gate: SingleFlightGate,
    pub scan_filter: ScanFilterCache,
}

impl GatewayState {
    pub fn new() -> Self {
        Self {
            settings: SimSettings::default(),
            store: RefCell::new(AdvTable::new()),
            signals: SignalBus::new(),
            metrics: Metrics::new(),
            link: CoprocessorLink::new(),
            gate: SingleFlightGate::new(),
            scan_filter: ScanFilterCache::new(),
        }
    }
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new()
    }
}

/// How the simulated server answers requests.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReplyMode {
    /// Every request completes at once with this reply.
    Auto(Result<HttpResponse, NetError>),
    /// Requests stay in flight until `sim http ok|err`.
    Manual,
}

/// A request handed to the simulated HTTP client.
#[derive(Clone, Debug)]
pub struct SentRequest {
    pub sink: Sink,
    pub body: String,
    pub signature: Option<String>,
}

pub struct SimHttp {
    body: Box<[u8; BODY_CAPACITY]>,
    pub mode: ReplyMode,
    /// Simulates request-buffer exhaustion.
    pub out_of_memory: bool,
    in_flight: bool,
    reply: Option<Result<HttpResponse, NetError>>,
    pub sent: Vec<SentRequest>,
    pub aborted: usize,
}

impl SimHttp {
    pub fn new() -> Self {
        Self {
            body: Box::new([0; BODY_CAPACITY]),
            mode: ReplyMode::Auto(Ok(HttpResponse::ok())),
            out_of_memory: false,
            in_flight: false,
            reply: None,
            sent: Vec::new(),
            aborted: 0,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// A reply waits to be collected by the next `poll`.
    pub fn reply_ready(&self) -> bool {
        self.reply.is_some()
    }

    /// Completes the in-flight request. Returns `false` when nothing is in flight.
    pub fn complete(&mut self, reply: Result<HttpResponse, NetError>) -> bool {
        if !self.in_flight {
            return false;
        }
        self.in_flight = false;
        self.reply = Some(reply);
        true
    }
}

impl Default for SimHttp {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for SimHttp {
    fn body_buffer(&mut self) -> Option<&mut [u8]> {
        (!self.out_of_memory).then_some(&mut self.body[..])
    }

    fn start(&mut self, sink: Sink, body_len: usize, signature: Option<&str>) -> Result<(), NetError> {
        let body = self.body.get(..body_len).ok_or(NetError::Generic)?;
        self.sent.push(SentRequest {
            sink,
            body: String::from_utf8_lossy(body).into_owned(),
            signature: signature.map(str::to_owned),
        });
        self.in_flight = true;
        self.reply = None;
        if let ReplyMode::Auto(reply) = &self.mode {
            self.complete(reply.clone());
        }
        Ok(())
    }

    fn poll(&mut self) -> HttpPoll {
        match self.reply.take() {
            Some(reply) => HttpPoll::Done(reply),
            None => HttpPoll::Pending,
        }
    }

    fn abort(&mut self) {
        if self.in_flight {
            self.aborted += 1;
        }
        self.in_flight = false;
        self.reply = None;
    }
}

#[derive(Debug, Default)]
pub struct SimBus {
    pub connected: bool,
    pub published: Vec<(String, Vec<u8>, bool)>,
}

impl MessageBusClient for SimBus {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), NetError> {
        if !self.connected {
            return Err(NetError::Connect);
        }
        self.published
            .push((topic.to_owned(), payload.to_vec(), retained));
        Ok(())
    }
}

/// Coprocessor model: acknowledges commands and announces itself after reset.
#[derive(Debug)]
pub struct SimCoprocessor {
    pub auto_ack: bool,
    pub requests: Vec<Request>,
    pub resets: usize,
    in_reset: bool,
    /// Bytes waiting to be fed to the receive path.
    inbound: VecDeque<u8>,
}

impl SimCoprocessor {
    pub fn new() -> Self {
        Self {
            auto_ack: true,
            requests: Vec::new(),
            resets: 0,
            in_reset: false,
            inbound: VecDeque::new(),
        }
    }

    pub fn queue_frame(&mut self, frame: &[u8]) {
        self.inbound.extend(frame);
    }

    pub fn take_inbound(&mut self) -> Vec<u8> {
        self.inbound.drain(..).collect()
    }

    pub fn has_inbound(&self) -> bool {
        !self.inbound.is_empty()
    }
}

impl Default for SimCoprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl CoprocessorTransport for SimCoprocessor {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.in_reset {
            return Err(TransportError::Busy);
        }
        let request = decode_request(frame).map_err(|_| TransportError::Io)?;
        if self.auto_ack {
            let command = match request {
                Request::SetAll(_) => opcode::SET_ALL,
                Request::LedCtrl { .. } => opcode::LED_CTRL,
            };
            self.queue_frame(&encode_frame(opcode::ACK, &[command, 0]));
        }
        self.requests.push(request);
        Ok(())
    }

    fn set_reset(&mut self, asserted: bool) {
        if asserted {
            self.resets += 1;
            self.inbound.clear();
        } else if self.in_reset {
            self.queue_frame(&encode_frame(opcode::REBOOTED, &[]));
        }
        self.in_reset = asserted;
    }
}

#[derive(Debug, Default)]
pub struct SimIndicators {
    pub results: Vec<(Sink, bool)>,
    pub configured: usize,
    pub idle_windows: usize,
}

impl Indicators for SimIndicators {
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

/// Records restarts instead of performing them.
#[derive(Debug, Default)]
pub struct SimSystem {
    pub restarts: Vec<RestartReason>,
    pub image_valid: bool,
    pub wall_clock: Option<u64>,
}

impl SystemControl for SimSystem {
    fn restart(&mut self, reason: RestartReason) {
        self.restarts.push(reason);
    }

    /// The host has no hardware watchdog.
    fn feed_watchdog(&mut self) {}

    fn mark_image_valid(&mut self) {
        self.image_valid = true;
    }

    fn wall_clock(&self) -> Option<u64> {
        self.wall_clock
    }
}

pub struct SimPlatform;

impl Platform for SimPlatform {
    type Http = SimHttp;
    type Bus = SimBus;
    type Encoder = LineEncoder;
    type Transport = SimCoprocessor;
    type Indicators = SimIndicators;
    type System = SimSystem;
}
