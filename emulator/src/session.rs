use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant as HostInstant};

use gateway_core::adv_table::{AdvRecord, HistoryFilter, MacAddress};
use gateway_core::comm::{HmacKey, HttpResponse, LineEncoder, NetError};
use gateway_core::config::GatewayConfig;
use gateway_core::console::{Console, ConsoleBackend};
use gateway_core::coprocessor::protocol::{Request, encode_frame, opcode};
use gateway_core::coprocessor::{ReceivePath, RxContext, RxEvent};
use gateway_core::orchestrator::{Orchestrator, Parts, Shared};
use gateway_core::signals::Signal;
use gateway_core::status::StatusSnapshot;
use gateway_core::telemetry::MetricsSnapshot;
use gateway_core::time::Instant;

use crate::sim::{
    GatewayState, ReplyMode, STORE_CAPACITY, SimBus, SimCoprocessor, SimHttp, SimIndicators,
    SimPlatform, SimStore, SimSettings, SimSystem,
};

type SimOrchestrator<'a> = Orchestrator<'a, SimPlatform, SimSettings, SimStore, STORE_CAPACITY>;

/// Upper bound on dispatch rounds per settle, in case a handler keeps re-posting.
const MAX_SETTLE_ROUNDS: usize = 256;

/// Upper bound on timer expiries processed by one `sim advance`.
const MAX_ADVANCE_STEPS: usize = 100_000;

pub const SIM_HELP: &[&str] = &[
    "sim net up|down                 - report network connectivity",
    "sim time <epoch>                - synchronize the wall clock",
    "sim bus up|down                 - connect or drop the message bus",
    "sim adv <mac> <rssi> <hex>      - inject an advertisement from the coprocessor",
    "sim coproc reboot|ack on|off    - coprocessor reboot notice or ACK behaviour",
    "sim http auto [<status>]|manual - choose how the server answers",
    "sim http ok <status> [rate=<s>] [key=<hex>] | err <kind> [<code>]",
    "sim http oom on|off             - simulate request-buffer exhaustion",
    "sim cfg <key> <value>           - edit settings (relay, timestamps, primary, custom,",
    "                                  stats, bus, custom-period, bus-interval, prefix,",
    "                                  watchdog, filter allow|deny|clear|add <mac>)",
    "sim cfg-mode on|off             - enter or leave configuration mode",
    "sim signal <name>               - post any orchestrator signal",
    "sim advance <n>[ms|s|m]         - let virtual time pass",
    "sim sent                        - list requests and publishes so far",
];

/// How a response line should be presented.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tone {
    Console,
    Event,
    Error,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    pub tone: Tone,
    pub text: String,
}

impl Reply {
    fn console(text: impl Into<String>) -> Self {
        Self {
            tone: Tone::Console,
            text: text.into(),
        }
    }

    fn event(text: impl Into<String>) -> Self {
        Self {
            tone: Tone::Event,
            text: text.into(),
        }
    }

    fn error(text: impl Into<String>) -> Self {
        Self {
            tone: Tone::Error,
            text: text.into(),
        }
    }
}

/// Console backend over the emulator's shared state.
struct SessionBackend<'s> {
    gateway: &'s GatewayState,
    snapshot: StatusSnapshot,
    history_now: u64,
}

impl ConsoleBackend for SessionBackend<'_> {
    fn status(&self) -> StatusSnapshot {
        self.snapshot
    }

    fn history(&self, filter: HistoryFilter, visit: &mut dyn FnMut(&AdvRecord)) {
        for record in &self.gateway.store.borrow().read_history(self.history_now, filter) {
            visit(record);
        }
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.gateway.metrics.snapshot()
    }

    fn set_relaying(&mut self, enabled: bool) {
        self.gateway
            .settings
            .update(|settings| settings.relaying_enabled = enabled);
    }

    fn post(&self, signal: Signal) {
        self.gateway.signals.post(signal);
    }
}

/// Counts of collaborator activity already narrated.
#[derive(Default)]
struct Narrated {
    sent: usize,
    aborted: usize,
    published: usize,
    requests: usize,
    resets: usize,
    restarts: usize,
    results: usize,
    configured: usize,
    idle_windows: usize,
    image_valid: bool,
    stopped: bool,
}

/// One emulated gateway: the real orchestrator on a virtual clock.
pub struct Session<'a> {
    gateway: &'a GatewayState,
    orchestrator: SimOrchestrator<'a>,
    rx: ReceivePath<STORE_CAPACITY>,
    now: Instant,
    /// Epoch seconds at virtual time zero, once synchronized.
    epoch_at_boot: Option<u64>,
    sequence: u64,
    reply_announced: bool,
    narrated: Narrated,
    transcript: Option<TranscriptLogger>,
    started_at: HostInstant,
}

impl<'a> Session<'a> {
    pub fn new(gateway: &'a GatewayState, transcript: Option<TranscriptLogger>) -> Self {
        let shared = Shared {
            config: &gateway.settings,
            store: &gateway.store,
            signals: &gateway.signals,
            metrics: &gateway.metrics,
            link: &gateway.link,
            gate: &gateway.gate,
            scan_filter: &gateway.scan_filter,
        };
        let parts = Parts::<SimPlatform> {
            http: SimHttp::new(),
            bus: SimBus::default(),
            encoder: LineEncoder,
            transport: SimCoprocessor::new(),
            indicators: SimIndicators::default(),
            system: SimSystem::default(),
        };
        let now = Instant::from_millis(0);
        let mut session = Self {
            gateway,
            orchestrator: Orchestrator::new(shared, parts, 1, now),
            rx: ReceivePath::new(),
            now,
            epoch_at_boot: None,
            sequence: 0,
            reply_announced: false,
            narrated: Narrated::default(),
            transcript,
            started_at: HostInstant::now(),
        };
        session.orchestrator.start(now);
        gateway.signals.post(Signal::ConfigReady);
        session.settle();
        session.narrated = session.current_counts();
        session
    }

    #[cfg(test)]
    fn orchestrator(&self) -> &SimOrchestrator<'a> {
        &self.orchestrator
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<Reply>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let elapsed = self.started_at.elapsed();
        if let Some(transcript) = &mut self.transcript {
            transcript.append_line(elapsed, TranscriptRole::Host, trimmed)?;
        }

        let mut replies = match trimmed.strip_prefix("sim") {
            Some("" | " help") => SIM_HELP.iter().copied().map(Reply::console).collect(),
            Some(rest) if rest.starts_with(' ') => self
                .handle_sim(rest.trim())
                .unwrap_or_else(|err| vec![Reply::error(format!("error: {err}"))]),
            _ => self.handle_console(trimmed),
        };

        self.settle();
        replies.extend(self.narrate());

        if let Some(transcript) = &mut self.transcript {
            for reply in &replies {
                transcript.append_line(elapsed, TranscriptRole::Emulator, &reply.text)?;
            }
        }
        Ok(replies)
    }

    fn handle_console(&mut self, line: &str) -> Vec<Reply> {
        let backend = SessionBackend {
            gateway: self.gateway,
            snapshot: self.orchestrator.status(self.now),
            history_now: self.history_now(),
        };
        let mut console = Console::new(backend);
        let mut replies = Vec::new();
        if let Err(err) = console.execute(line, &mut |text| replies.push(Reply::console(text))) {
            replies.push(Reply::error(format!("error: {err}")));
        }
        replies
    }

    fn handle_sim(&mut self, command: &str) -> Result<Vec<Reply>, String> {
        let mut words = command.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        match (verb, args.as_slice()) {
            ("net", [state]) => {
                let signal = if parse_switch(state)? {
                    Signal::NetworkConnected
                } else {
                    Signal::NetworkDisconnected
                };
                self.gateway.signals.post(signal);
                Ok(vec![Reply::event(format!("network {state}"))])
            }
            ("time", [epoch]) => {
                let epoch: u64 = epoch
                    .parse()
                    .map_err(|_| format!("invalid epoch `{epoch}`"))?;
                self.epoch_at_boot = Some(epoch.saturating_sub(self.now.as_secs()));
                self.gateway.signals.post(Signal::TimeSynchronized);
                Ok(vec![Reply::event(format!("wall clock set to {epoch}"))])
            }
            ("bus", [state]) => {
                let connected = parse_switch(state)?;
                self.orchestrator.parts_mut().bus.connected = connected;
                if !connected {
                    self.gateway.signals.post(Signal::DoAsyncComm);
                }
                Ok(vec![Reply::event(format!("message bus {state}"))])
            }
            ("adv", [mac, rssi, hex]) => self.inject_advertisement(mac, rssi, hex),
            ("coproc", ["reboot"]) => {
                self.orchestrator
                    .parts_mut()
                    .transport
                    .queue_frame(&encode_frame(opcode::REBOOTED, &[]));
                Ok(vec![Reply::event("coprocessor rebooted")])
            }
            ("coproc", ["ack", state]) => {
                self.orchestrator.parts_mut().transport.auto_ack = parse_switch(state)?;
                Ok(vec![Reply::event(format!("coprocessor acks {state}"))])
            }
            ("http", rest) => self.handle_http(rest),
            ("cfg", [key, value @ ..]) => self.handle_cfg(key, value),
            ("cfg-mode", [state]) => {
                let signal = if parse_switch(state)? {
                    Signal::CfgModeActivated
                } else {
                    Signal::CfgModeDeactivated
                };
                self.gateway.signals.post(signal);
                Ok(vec![Reply::event(format!("configuration mode {state}"))])
            }
            ("signal", [name]) => {
                let signal = signal_by_name(name).ok_or_else(|| format!("unknown signal `{name}`"))?;
                self.gateway.signals.post(signal);
                Ok(vec![Reply::event(format!("posted {signal}"))])
            }
            ("advance", [amount]) => {
                let duration = parse_duration(amount)?;
                self.advance(duration);
                Ok(vec![Reply::event(format!(
                    "uptime {}",
                    format_duration_short(Duration::from_millis(self.now.as_millis()))
                ))])
            }
            ("sent", []) => Ok(self.sent_summary()),
            _ => Err(format!("unrecognized sim command `{command}`; try `sim help`")),
        }
    }

    fn handle_http(&mut self, args: &[&str]) -> Result<Vec<Reply>, String> {
        let http = &mut self.orchestrator.parts_mut().http;
        match args {
            ["auto"] => {
                http.mode = ReplyMode::Auto(Ok(HttpResponse::ok()));
                Ok(vec![Reply::event("server answers 200 immediately")])
            }
            ["auto", status] => {
                let status = parse_status(status)?;
                http.mode = ReplyMode::Auto(status_reply(status));
                Ok(vec![Reply::event(format!("server answers {status} immediately"))])
            }
            ["manual"] => {
                http.mode = ReplyMode::Manual;
                Ok(vec![Reply::event("server replies on `sim http ok|err`")])
            }
            ["oom", state] => {
                http.out_of_memory = parse_switch(state)?;
                Ok(vec![Reply::event(format!("request buffer exhaustion {state}"))])
            }
            ["ok", status, options @ ..] => {
                let mut response = HttpResponse {
                    status: parse_status(status)?,
                    rate_override: None,
                    rotated_key: None,
                };
                for option in options {
                    if let Some(rate) = option.strip_prefix("rate=") {
                        let secs = rate.parse().map_err(|_| format!("invalid rate `{rate}`"))?;
                        response.rate_override = Some(Duration::from_secs(secs));
                    } else if let Some(key) = option.strip_prefix("key=") {
                        response.rotated_key = Some(parse_key(key)?);
                    } else {
                        return Err(format!("unknown reply option `{option}`"));
                    }
                }
                complete_request(http, Ok(response))
            }
            ["err", kind, code @ ..] => {
                let error = parse_net_error(kind, code)?;
                complete_request(http, Err(error))
            }
            _ => Err("usage: sim http auto|manual|oom|ok|err ...".to_owned()),
        }
    }

    fn handle_cfg(&mut self, key: &str, value: &[&str]) -> Result<Vec<Reply>, String> {
        let settings = &self.gateway.settings;
        let mut signal = Signal::ConfigChanged;
        match (key, value) {
            ("relay", [state]) => {
                let enabled = parse_switch(state)?;
                settings.update(|s| s.relaying_enabled = enabled);
                signal = Signal::RelayingModeChanged;
            }
            ("timestamps", [state]) => {
                let enabled = parse_switch(state)?;
                settings.update(|s| s.use_timestamps = enabled);
            }
            ("primary", [state]) => {
                let enabled = parse_switch(state)?;
                settings.update(|s| s.primary_enabled = enabled);
            }
            ("custom", [state]) => {
                let enabled = parse_switch(state)?;
                settings.update(|s| s.custom_enabled = enabled);
            }
            ("stats", [state]) => {
                let enabled = parse_switch(state)?;
                settings.update(|s| s.statistics_enabled = enabled);
            }
            ("bus", [state]) => {
                let enabled = parse_switch(state)?;
                settings.update(|s| s.bus_enabled = enabled);
            }
            ("custom-period", [amount]) => {
                let period = parse_duration(amount)?;
                settings.update(|s| s.custom_period = period);
            }
            ("bus-interval", [amount]) => {
                let interval = parse_duration(amount)?;
                settings.update(|s| s.bus_interval = interval);
            }
            ("watchdog", [amount]) => {
                let timeout = parse_duration(amount)?;
                settings.update(|s| s.network_watchdog_timeout = timeout);
            }
            ("prefix", [prefix]) => settings.update(|s| s.set_topic_prefix(prefix)),
            ("filter", ["allow"]) => settings.update(|s| s.scan_filter_allow_listed = true),
            ("filter", ["deny"]) => settings.update(|s| s.scan_filter_allow_listed = false),
            ("filter", ["clear"]) => settings.update(|s| s.scan_filter.clear()),
            ("filter", ["add", mac]) => {
                let mac: MacAddress = mac.parse().map_err(|err| format!("{err}"))?;
                settings
                    .update(|s| s.scan_filter.push(mac))
                    .map_err(|_| "scan filter is full".to_owned())?;
            }
            _ => return Err(format!("unrecognized setting `{key}`; try `sim help`")),
        }
        self.gateway.signals.post(signal);
        Ok(vec![Reply::event(format!("{key} updated"))])
    }

    fn inject_advertisement(&mut self, mac: &str, rssi: &str, hex: &str) -> Result<Vec<Reply>, String> {
        let mac: MacAddress = mac.parse().map_err(|err| format!("{err}"))?;
        let rssi: i8 = rssi.parse().map_err(|_| format!("invalid rssi `{rssi}`"))?;
        let payload = parse_hex(hex)?;

        let mut params = Vec::with_capacity(7 + payload.len());
        params.extend_from_slice(mac.as_bytes());
        params.extend_from_slice(&rssi.to_le_bytes());
        params.extend_from_slice(&payload);
        let frame = encode_frame(opcode::ADV_REPORT, &params);

        let events = self.receive(&frame);
        Ok(events
            .into_iter()
            .map(|event| match event {
                RxEvent::Stored(mac, outcome) => Reply::event(format!("stored {mac} ({outcome:?})")),
                RxEvent::Filtered(mac) => Reply::event(format!("filtered {mac}")),
                other => Reply::error(format!("advertisement rejected: {other:?}")),
            })
            .collect())
    }

    /// Feeds coprocessor bytes through the receive path.
    fn receive(&mut self, bytes: &[u8]) -> Vec<RxEvent> {
        let gateway = self.gateway;
        let ctx = RxContext {
            store: &gateway.store,
            link: &gateway.link,
            signals: &gateway.signals,
            metrics: &gateway.metrics,
            scan_filter: &gateway.scan_filter,
        };
        let mut events = Vec::new();
        for &byte in bytes {
            let stamp = if gateway.settings.use_timestamps() {
                self.wall_clock().unwrap_or(0)
            } else {
                self.sequence + 1
            };
            if let Some(event) = self.rx.push(byte, stamp, &ctx) {
                if matches!(event, RxEvent::Stored(..)) {
                    self.sequence += 1;
                }
                events.push(event);
            }
        }
        events
    }

    fn wall_clock(&self) -> Option<u64> {
        self.epoch_at_boot
            .map(|epoch| epoch.saturating_add(self.now.as_secs()))
    }

    fn history_now(&self) -> u64 {
        if self.gateway.settings.use_timestamps() {
            self.wall_clock().unwrap_or(0)
        } else {
            0
        }
    }

    /// Runs the orchestrator until nothing is pending at the current instant.
    pub fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            if self.orchestrator.is_stopped() {
                return;
            }
            let wall_clock = self.wall_clock();
            self.orchestrator.parts_mut().system.wall_clock = wall_clock;

            let inbound = self.orchestrator.parts_mut().transport.take_inbound();
            if !inbound.is_empty() {
                self.receive(&inbound);
            }

            let reply_ready = self.orchestrator.parts().http.reply_ready();
            if reply_ready && !self.reply_announced {
                self.gateway.signals.post(Signal::DoAsyncComm);
            }
            self.reply_announced = reply_ready;

            let handled = self.orchestrator.run_once(self.now);
            if handled == 0 && !self.orchestrator.parts().transport.has_inbound() {
                return;
            }
        }
    }

    /// Moves virtual time forward, stopping at every timer deadline on the way.
    pub fn advance(&mut self, duration: Duration) {
        let target = Instant::from_millis(
            self.now
                .as_millis()
                .saturating_add(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)),
        );
        for _ in 0..MAX_ADVANCE_STEPS {
            match self.orchestrator.next_deadline() {
                Some(deadline) if deadline <= target && !self.orchestrator.is_stopped() => {
                    if deadline > self.now {
                        self.now = deadline;
                    }
                    self.settle();
                }
                _ => break,
            }
        }
        self.now = target;
        self.settle();
    }

    fn current_counts(&self) -> Narrated {
        let parts = self.orchestrator.parts();
        Narrated {
            sent: parts.http.sent.len(),
            aborted: parts.http.aborted,
            published: parts.bus.published.len(),
            requests: parts.transport.requests.len(),
            resets: parts.transport.resets,
            restarts: parts.system.restarts.len(),
            results: parts.indicators.results.len(),
            configured: parts.indicators.configured,
            idle_windows: parts.indicators.idle_windows,
            image_valid: parts.system.image_valid,
            stopped: self.orchestrator.is_stopped(),
        }
    }

    /// Describes collaborator activity since the previous call.
    fn narrate(&mut self) -> Vec<Reply> {
        let parts = self.orchestrator.parts();
        let seen = &self.narrated;
        let mut replies = Vec::new();

        for request in &parts.transport.requests[seen.requests..] {
            replies.push(Reply::event(match request {
                Request::SetAll(params) => format!(
                    "coproc <- SET_ALL company=0x{:04X} filtering={}",
                    params.company_id, params.use_filtering
                ),
                Request::LedCtrl { interval_ms } => format!("coproc <- LED_CTRL {interval_ms}ms"),
            }));
        }
        for _ in seen.resets..parts.transport.resets {
            replies.push(Reply::event("coproc hardware reset"));
        }
        for request in &parts.http.sent[seen.sent..] {
            let lines = request.body.lines().count();
            replies.push(Reply::event(format!(
                "http -> {} {} bytes, {} line(s), signature {}",
                request.sink,
                request.body.len(),
                lines,
                request.signature.as_deref().unwrap_or("none"),
            )));
        }
        if parts.http.aborted > seen.aborted {
            replies.push(Reply::event("http request aborted"));
        }
        for (topic, payload, retained) in &parts.bus.published[seen.published..] {
            replies.push(Reply::event(format!(
                "bus -> {topic} ({} bytes{})",
                payload.len(),
                if *retained { ", retained" } else { "" }
            )));
        }
        for (sink, ok) in &parts.indicators.results[seen.results..] {
            replies.push(Reply::event(format!(
                "{sink} transfer {}",
                if *ok { "delivered" } else { "failed" }
            )));
        }
        if parts.indicators.configured > seen.configured {
            replies.push(Reply::event("coprocessor configured"));
        }
        if parts.system.image_valid && !seen.image_valid {
            replies.push(Reply::event("running image marked valid"));
        }
        if parts.indicators.idle_windows > seen.idle_windows {
            replies.push(Reply::event("no advertisements received in the last window"));
        }
        for reason in &parts.system.restarts[seen.restarts..] {
            replies.push(Reply::error(format!("restart requested: {reason}")));
        }
        if self.orchestrator.is_stopped() && !seen.stopped {
            replies.push(Reply::error("orchestrator stopped"));
        }

        self.narrated = self.current_counts();
        replies
    }

    fn sent_summary(&self) -> Vec<Reply> {
        let parts = self.orchestrator.parts();
        let mut replies = Vec::new();
        for request in &parts.http.sent {
            replies.push(Reply::console(format!("{}:", request.sink)));
            for line in request.body.lines() {
                replies.push(Reply::console(format!("  {line}")));
            }
        }
        for (topic, payload, _) in &parts.bus.published {
            replies.push(Reply::console(format!(
                "{topic}: {}",
                String::from_utf8_lossy(payload)
            )));
        }
        if parts.http.in_flight() {
            replies.push(Reply::console("one request in flight"));
        }
        replies.push(Reply::console(format!(
            "{} request(s), {} publish(es)",
            parts.http.sent.len(),
            parts.bus.published.len()
        )));
        replies
    }
}

fn complete_request(http: &mut SimHttp, reply: Result<HttpResponse, NetError>) -> Result<Vec<Reply>, String> {
    if http.complete(reply) {
        Ok(vec![Reply::event("reply delivered")])
    } else {
        Err("no request in flight".to_owned())
    }
}

fn status_reply(status: u16) -> Result<HttpResponse, NetError> {
    if (200..300).contains(&status) {
        Ok(HttpResponse {
            status,
            rate_override: None,
            rotated_key: None,
        })
    } else {
        Err(NetError::Status(status))
    }
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value {
        "on" | "up" => Ok(true),
        "off" | "down" => Ok(false),
        other => Err(format!("expected on|off, got `{other}`")),
    }
}

fn parse_status(value: &str) -> Result<u16, String> {
    value
        .parse()
        .map_err(|_| format!("invalid status `{value}`"))
}

fn parse_net_error(kind: &str, code: &[&str]) -> Result<NetError, String> {
    Ok(match (kind, code) {
        ("dns", []) => NetError::Dns,
        ("connect", []) => NetError::Connect,
        ("auth", []) => NetError::Auth,
        ("timeout", []) => NetError::Timeout,
        ("generic", []) => NetError::Generic,
        ("status", [code]) => NetError::Status(parse_status(code)?),
        _ => return Err(format!("unknown error kind `{kind}`")),
    })
}

fn parse_hex(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err(format!("odd-length hex `{hex}`"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|at| {
            hex.get(at..at + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex `{hex}`"))
        })
        .collect()
}

fn parse_key(hex: &str) -> Result<HmacKey, String> {
    let bytes = parse_hex(hex)?;
    HmacKey::from_slice(&bytes).map_err(|_| "key too long".to_owned())
}

/// Accepts `90`, `90s`, `500ms` or `2m`.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let invalid = || format!("invalid duration `{value}`");
    if let Some(ms) = value.strip_suffix("ms") {
        ms.parse().map(Duration::from_millis).map_err(|_| invalid())
    } else if let Some(minutes) = value.strip_suffix('m') {
        minutes
            .parse::<u64>()
            .map(|minutes| Duration::from_secs(minutes * 60))
            .map_err(|_| invalid())
    } else {
        value
            .strip_suffix('s')
            .unwrap_or(value)
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| invalid())
    }
}

fn signal_by_name(name: &str) -> Option<Signal> {
    (0..=Signal::LAST.number())
        .filter_map(Signal::from_number)
        .find(|signal| signal.name().eq_ignore_ascii_case(name))
}

fn format_duration_short(duration: Duration) -> String {
    if duration.as_secs() == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{:.3}s", duration.as_secs_f64())
    }
}

/// Scripted sessions recorded by `capture-transcripts`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TranscriptProfile {
    Relay,
    Coprocessor,
    Bus,
}

impl TranscriptProfile {
    pub fn log_path(self) -> &'static str {
        match self {
            TranscriptProfile::Relay => "transcripts/emulator-relay.log",
            TranscriptProfile::Coprocessor => "transcripts/emulator-coprocessor.log",
            TranscriptProfile::Bus => "transcripts/emulator-bus.log",
        }
    }

    pub fn header(self) -> &'static str {
        match self {
            TranscriptProfile::Relay => "Gateway Emulator relay transcript",
            TranscriptProfile::Coprocessor => "Gateway Emulator coprocessor supervision transcript",
            TranscriptProfile::Bus => "Gateway Emulator message bus transcript",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, String> {
        if tag.eq_ignore_ascii_case("relay") {
            Ok(Self::Relay)
        } else if tag.eq_ignore_ascii_case("coprocessor") || tag.eq_ignore_ascii_case("coproc") {
            Ok(Self::Coprocessor)
        } else if tag.eq_ignore_ascii_case("bus") {
            Ok(Self::Bus)
        } else {
            Err(format!("Unknown transcript profile `{tag}`"))
        }
    }
}

pub struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    pub fn create(path: &Path, header: &str) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };

        writeln!(logger.writer, "# {header}")?;
        writeln!(logger.writer, "# Timestamps are milliseconds since session start")?;
        writeln!(logger.writer)?;
        logger.writer.flush()?;
        Ok(logger)
    }

    pub fn for_profile(profile: TranscriptProfile) -> io::Result<Self> {
        Self::create(Path::new(profile.log_path()), profile.header())
    }

    fn append_line(&mut self, elapsed: Duration, role: TranscriptRole, line: &str) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}

#[cfg(test)]
mod tests {
    use gateway_core::coprocessor::LinkPhase;

    use super::*;

    fn texts(replies: &[Reply]) -> Vec<&str> {
        replies.iter().map(|reply| reply.text.as_str()).collect()
    }

    fn run(session: &mut Session<'_>, line: &str) -> Vec<Reply> {
        session.handle_command(line).expect("no transcript io")
    }

    #[test]
    fn boot_configures_the_coprocessor() {
        let gateway = GatewayState::new();
        let mut session = Session::new(&gateway, None);
        session.advance(Duration::from_secs(5));

        assert_eq!(
            session.orchestrator().link().phase(&gateway.link),
            LinkPhase::Configured
        );
        assert!(
            session
                .orchestrator()
                .parts()
                .transport
                .requests
                .iter()
                .any(|request| matches!(request, Request::SetAll(_)))
        );
    }

    #[test]
    fn advertisement_is_relayed_once_network_and_time_are_up() {
        let gateway = GatewayState::new();
        let mut session = Session::new(&gateway, None);
        session.advance(Duration::from_secs(5));

        run(&mut session, "sim net up");
        run(&mut session, "sim time 1700000000");
        let stored = run(&mut session, "sim adv C0:00:00:00:00:01 -60 99040501");
        assert!(stored[0].text.starts_with("stored C0:00:00:00:00:01"));

        let replies = run(&mut session, "sim advance 15s");
        assert!(
            texts(&replies)
                .iter()
                .any(|text| text.starts_with("http -> primary"))
        );
        let sent = &session.orchestrator().parts().http.sent;
        assert!(sent.iter().any(|request| request.body.contains("C0:00:00:00:00:01")));
    }

    #[test]
    fn manual_reply_completes_transfer() {
        let gateway = GatewayState::new();
        let mut session = Session::new(&gateway, None);
        run(&mut session, "sim http manual");
        run(&mut session, "sim net up");
        run(&mut session, "sim time 1700000000");
        run(&mut session, "sim adv C0:00:00:00:00:02 -55 0102");
        run(&mut session, "sim advance 15s");
        assert!(session.orchestrator().parts().http.in_flight());

        let replies = run(&mut session, "sim http ok 200");
        assert_eq!(replies[0].text, "reply delivered");
        assert!(!session.orchestrator().parts().http.in_flight());
        assert_eq!(
            run(&mut session, "sim http ok 200")[0],
            Reply::error("error: no request in flight")
        );
    }

    #[test]
    fn console_commands_reach_the_core_console() {
        let gateway = GatewayState::new();
        let mut session = Session::new(&gateway, None);

        let replies = run(&mut session, "relay off");
        assert_eq!(texts(&replies), ["relaying off"]);
        assert!(!gateway.settings.relaying_enabled());

        let replies = run(&mut session, "bogus");
        assert_eq!(replies[0].tone, Tone::Error);
    }

    #[test]
    fn silent_coprocessor_is_hardware_reset() {
        let gateway = GatewayState::new();
        let mut session = Session::new(&gateway, None);
        session.advance(Duration::from_secs(5));
        run(&mut session, "sim coproc ack off");

        let resets_before = session.orchestrator().parts().transport.resets;
        run(&mut session, "coproc reconfigure");
        session.advance(Duration::from_secs(120));
        assert!(session.orchestrator().parts().transport.resets > resets_before);
    }

    #[test]
    fn sim_arguments_are_validated() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
        assert!(parse_duration("soon").is_err());
        assert_eq!(parse_hex("0a0B"), Ok(vec![0x0a, 0x0b]));
        assert!(parse_hex("abc").is_err());
        assert_eq!(signal_by_name("cfg-ready"), Some(Signal::ConfigReady));
        assert_eq!(parse_net_error("status", &["503"]), Ok(NetError::Status(503)));
    }
}
