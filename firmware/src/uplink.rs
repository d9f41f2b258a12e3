//! Network uplink over the second USB CDC interface.
//!
//! The board has no network interface of its own. A companion process on the
//! USB host performs the HTTP requests and message-bus publishes and reports
//! connectivity and wall-clock time back. The exchange is line oriented:
//!
//! ```text
//! device -> host   HTTP <sink> <len> <signature|->\n<len body bytes>
//!                  ABORT\n
//!                  PUB <retained 0|1> <len> <topic>\n<len payload bytes>
//! host -> device   NET up|down
//!                  TIME <epoch seconds>
//!                  BUS up|down
//!                  HTTP ok <status> [rate=<seconds>] [key=<hex>]
//!                  HTTP err dns|connect|auth|timeout|generic|status <code>
//! ```

use core::cell::RefCell;
use core::fmt::{self, Write as _};
use core::time::Duration;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::pipe::Pipe;
use gateway_core::adv_table::DEFAULT_CAPACITY;
use gateway_core::comm::{
    HmacKey, HttpClient, HttpPoll, HttpResponse, LineEncoder, MessageBusClient, NetError, Sink,
};
use gateway_core::signals::{Signal, SignalSink};
use heapless::String;
use portable_atomic::{AtomicBool, Ordering};
use winnow::ascii::{Uint, dec_uint, hex_digit1};
use winnow::combinator::{alt, eof, opt, preceded, terminated};
use winnow::prelude::*;

use crate::clock::WallClock;
use crate::log::{info, warn};
use crate::shared::GatewayMutex;

/// Largest request body the uplink accepts: a full store in the firmware's encoding.
pub const BODY_CAPACITY: usize = LineEncoder::max_body_len(DEFAULT_CAPACITY);

/// Outbound pipe size: one full body plus its header line.
pub const OUTBOUND_CAPACITY: usize = BODY_CAPACITY + 128;

/// Longest line accepted from the host.
pub const MAX_HOST_LINE: usize = 192;

type Header = String<128>;
type HttpReply = Result<HttpResponse, NetError>;

/// A parsed line from the uplink host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostLine<'a> {
    Network(bool),
    Time(u64),
    Bus(bool),
    HttpOk {
        status: u16,
        rate_secs: Option<u64>,
        key_hex: Option<&'a str>,
    },
    HttpErr(NetError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum UplinkError {
    Syntax,
    /// The rotated key has odd length or exceeds the key capacity.
    BadKey,
    /// An HTTP reply arrived with no request in flight.
    UnexpectedReply,
}

impl fmt::Display for UplinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UplinkError::Syntax => f.write_str("unrecognized host line"),
            UplinkError::BadKey => f.write_str("malformed key"),
            UplinkError::UnexpectedReply => f.write_str("reply without request"),
        }
    }
}

fn number<T: Uint>(input: &mut &str) -> ModalResult<T> {
    dec_uint(input)
}

fn up_down(input: &mut &str) -> ModalResult<bool> {
    alt(("up".value(true), "down".value(false))).parse_next(input)
}

fn net_error(input: &mut &str) -> ModalResult<NetError> {
    alt((
        "dns".value(NetError::Dns),
        "connect".value(NetError::Connect),
        "auth".value(NetError::Auth),
        "timeout".value(NetError::Timeout),
        "generic".value(NetError::Generic),
        preceded("status ", number::<u16>).map(NetError::Status),
    ))
    .parse_next(input)
}

fn http_ok<'a>(input: &mut &'a str) -> ModalResult<HostLine<'a>> {
    let status = number::<u16>.parse_next(input)?;
    let rate_secs = opt(preceded(" rate=", number::<u64>)).parse_next(input)?;
    let key_hex = opt(preceded(" key=", hex_digit1)).parse_next(input)?;
    Ok(HostLine::HttpOk {
        status,
        rate_secs,
        key_hex,
    })
}

fn host_line<'a>(input: &mut &'a str) -> ModalResult<HostLine<'a>> {
    alt((
        preceded("NET ", up_down).map(HostLine::Network),
        preceded("TIME ", number::<u64>).map(HostLine::Time),
        preceded("BUS ", up_down).map(HostLine::Bus),
        preceded("HTTP ok ", http_ok),
        preceded("HTTP err ", net_error).map(HostLine::HttpErr),
    ))
    .parse_next(input)
}

/// Parses one host line without its terminator.
pub fn parse_host_line(line: &str) -> Result<HostLine<'_>, UplinkError> {
    let mut input = line.trim_end();
    terminated(host_line, eof)
        .parse_next(&mut input)
        .map_err(|_| UplinkError::Syntax)
}

fn decode_key(hex: &str) -> Result<HmacKey, UplinkError> {
    if hex.len() % 2 != 0 {
        return Err(UplinkError::BadKey);
    }
    let mut key = HmacKey::new();
    for pair in hex.as_bytes().chunks(2) {
        let digits = core::str::from_utf8(pair).map_err(|_| UplinkError::BadKey)?;
        let byte = u8::from_str_radix(digits, 16).map_err(|_| UplinkError::BadKey)?;
        key.push(byte).map_err(|_| UplinkError::BadKey)?;
    }
    Ok(key)
}

/// State shared between the orchestrator's clients and the USB uplink task.
pub struct Uplink {
    outbound: Pipe<GatewayMutex, OUTBOUND_CAPACITY>,
    reply: Mutex<GatewayMutex, RefCell<Option<HttpReply>>>,
    awaiting_reply: AtomicBool,
    bus_connected: AtomicBool,
}

impl Uplink {
    pub const fn new() -> Self {
        Self {
            outbound: Pipe::new(),
            reply: Mutex::new(RefCell::new(None)),
            awaiting_reply: AtomicBool::new(false),
            bus_connected: AtomicBool::new(false),
        }
    }

    /// Bytes bound for the host, read by the USB task.
    pub async fn read_outbound(&self, buf: &mut [u8]) -> usize {
        self.outbound.read(buf).await
    }

    /// Drops everything queued for the host, e.g. after it disconnected.
    pub fn discard_outbound(&self) {
        self.outbound.clear();
    }

    /// Queues a header line and its body, or nothing if both do not fit.
    fn send(&self, header: &str, body: &[u8]) -> Result<(), NetError> {
        if self.outbound.free_capacity() < header.len() + body.len() {
            warn!("uplink: outbound pipe full, {} bytes refused", body.len());
            return Err(NetError::Connect);
        }
        for part in [header.as_bytes(), body] {
            let mut rest = part;
            while !rest.is_empty() {
                let written = self.outbound.try_write(rest).map_err(|_| NetError::Connect)?;
                rest = &rest[written..];
            }
        }
        Ok(())
    }

    fn take_reply(&self) -> Option<HttpReply> {
        self.reply.lock(|reply| reply.borrow_mut().take())
    }

    fn store_reply(&self, reply: HttpReply) -> Result<(), UplinkError> {
        if !self.awaiting_reply.swap(false, Ordering::AcqRel) {
            return Err(UplinkError::UnexpectedReply);
        }
        self.reply.lock(|slot| *slot.borrow_mut() = Some(reply));
        Ok(())
    }

    pub fn bus_connected(&self) -> bool {
        self.bus_connected.load(Ordering::Acquire)
    }

    /// The host closed the port: connectivity is gone and an in-flight
    /// request fails.
    pub fn detach_host<G: SignalSink + ?Sized>(&self, signals: &G) {
        self.discard_outbound();
        self.bus_connected.store(false, Ordering::Release);
        if self.awaiting_reply.swap(false, Ordering::AcqRel) {
            self.reply
                .lock(|slot| *slot.borrow_mut() = Some(Err(NetError::Connect)));
        }
        signals.post(Signal::NetworkDisconnected);
        signals.post(Signal::DoAsyncComm);
    }

    /// Applies one line from the host, raising the matching signal.
    pub fn handle_line<'l, G>(
        &self,
        line: &'l str,
        signals: &G,
        clock: &WallClock,
        uptime_secs: u64,
    ) -> Result<HostLine<'l>, UplinkError>
    where
        G: SignalSink + ?Sized,
    {
        let parsed = parse_host_line(line)?;
        match parsed {
            HostLine::Network(true) => signals.post(Signal::NetworkConnected),
            HostLine::Network(false) => signals.post(Signal::NetworkDisconnected),
            HostLine::Time(epoch) => {
                if clock.set(epoch, uptime_secs) {
                    info!("uplink: wall clock synced to {}", epoch);
                }
                signals.post(Signal::TimeSynchronized);
            }
            HostLine::Bus(connected) => {
                self.bus_connected.store(connected, Ordering::Release);
                if !connected {
                    signals.post(Signal::DoAsyncComm);
                }
            }
            HostLine::HttpOk {
                status,
                rate_secs,
                key_hex,
            } => {
                let rotated_key = key_hex.map(decode_key).transpose()?;
                self.store_reply(Ok(HttpResponse {
                    status,
                    rate_override: rate_secs.map(Duration::from_secs),
                    rotated_key,
                }))?;
                signals.post(Signal::DoAsyncComm);
            }
            HostLine::HttpErr(err) => {
                self.store_reply(Err(err))?;
                signals.post(Signal::DoAsyncComm);
            }
        }
        Ok(parsed)
    }
}

/// [`HttpClient`] that forwards requests to the uplink host.
pub struct UplinkHttp<'a> {
    uplink: &'a Uplink,
    body: [u8; BODY_CAPACITY],
}

impl<'a> UplinkHttp<'a> {
    pub const fn new(uplink: &'a Uplink) -> Self {
        Self {
            uplink,
            body: [0; BODY_CAPACITY],
        }
    }
}

impl HttpClient for UplinkHttp<'_> {
    fn body_buffer(&mut self) -> Option<&mut [u8]> {
        Some(&mut self.body)
    }

    fn start(&mut self, sink: Sink, body_len: usize, signature: Option<&str>) -> Result<(), NetError> {
        let body = self.body.get(..body_len).ok_or(NetError::Generic)?;
        let mut header = Header::new();
        writeln!(header, "HTTP {} {} {}", sink, body_len, signature.unwrap_or("-"))
            .map_err(|_| NetError::Generic)?;

        let _ = self.uplink.take_reply();
        self.uplink.send(&header, body)?;
        self.uplink.awaiting_reply.store(true, Ordering::Release);
        Ok(())
    }

    fn poll(&mut self) -> HttpPoll {
        match self.uplink.take_reply() {
            Some(reply) => HttpPoll::Done(reply),
            None => HttpPoll::Pending,
        }
    }

    fn abort(&mut self) {
        if self.uplink.awaiting_reply.swap(false, Ordering::AcqRel) {
            let _ = self.uplink.send("ABORT\n", &[]);
        }
        let _ = self.uplink.take_reply();
    }
}

/// [`MessageBusClient`] that forwards publishes to the uplink host.
#[derive(Clone, Copy)]
pub struct UplinkBus<'a> {
    uplink: &'a Uplink,
}

impl<'a> UplinkBus<'a> {
    pub const fn new(uplink: &'a Uplink) -> Self {
        Self { uplink }
    }
}

impl MessageBusClient for UplinkBus<'_> {
    fn is_connected(&self) -> bool {
        self.uplink.bus_connected()
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), NetError> {
        if !self.is_connected() {
            return Err(NetError::Connect);
        }
        let mut header = Header::new();
        writeln!(header, "PUB {} {} {}", u8::from(retained), payload.len(), topic)
            .map_err(|_| NetError::Generic)?;
        self.uplink.send(&header, payload)
    }
}
