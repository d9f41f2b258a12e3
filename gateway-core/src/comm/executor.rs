//! Single-flight transfer executor.
//!
//! At most one transfer is building or in flight at any time. Every start
//! path takes the [`SingleFlightGate`] first and every exit path, including
//! allocation and encoding failures, gives it back.

use core::fmt::{self, Write as _};
use core::time::Duration;

use heapless::String;

use crate::adv_table::{AdvBatch, AdvStore, DEFAULT_CAPACITY, QueueId};
use crate::config::MAX_TOPIC_PREFIX_LEN;
use crate::log::{debug, warn};
use crate::telemetry::MetricsSnapshot;

use super::gate::SingleFlightGate;
use super::payload::{AdvHeader, BodyWriter, EncodeError, HmacKey, PayloadEncoder, StatisticsReport};
use super::{HttpClient, HttpPoll, HttpResponse, MessageBusClient, NetError, Sink};

/// Longest message-bus topic: prefix plus a formatted MAC address.
pub const MAX_TOPIC_LEN: usize = MAX_TOPIC_PREFIX_LEN + 17;

/// Largest single message-bus payload.
pub const BUS_PAYLOAD_LEN: usize = 160;

/// Topic suffix of the retained gateway status message.
pub const STATUS_TOPIC: &str = "gw_status";

const HTTP_TARGETS: usize = 3;

/// Why a transfer could not be started.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StartError {
    /// Another transfer holds the gate.
    Busy,
    /// No request buffer could be obtained.
    NoMemory,
    Encode(EncodeError),
    Net(NetError),
    BusDisconnected,
    /// The sink does not upload advertisement batches.
    InvalidSink(Sink),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::Busy => f.write_str("another transfer is in progress"),
            StartError::NoMemory => f.write_str("no request buffer available"),
            StartError::Encode(err) => write!(f, "encode failed: {err}"),
            StartError::Net(err) => write!(f, "start failed: {err}"),
            StartError::BusDisconnected => f.write_str("message bus not connected"),
            StartError::InvalidSink(sink) => write!(f, "{sink} does not take advertisements"),
        }
    }
}

/// Result of [`AsyncComm::poll`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommPoll {
    /// Nothing is in progress.
    Idle,
    /// An HTTP request is still running, or a message-bus batch is being published.
    Pending(Sink),
    /// The HTTP request for `sink` ended; the gate has been released.
    Finished {
        sink: Sink,
        result: Result<HttpResponse, NetError>,
    },
}

/// Result of one [`AsyncComm::step_bus`] call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusStep {
    /// Records remain; call again on the next wake-up.
    Continue,
    /// The batch is done and the gate released.
    Finished,
    /// Publishing failed; the rest of the batch was dropped and the gate released.
    Failed(NetError),
}

/// Transfer state owned by the orchestrator.
pub struct AsyncComm<'g, const N: usize = DEFAULT_CAPACITY> {
    gate: &'g SingleFlightGate,
    active: Option<Sink>,
    nonce: u32,
    keys: [HmacKey; HTTP_TARGETS],
    bus_batch: AdvBatch<N>,
    bus_cursor: usize,
    bus_announced: bool,
}

impl<'g, const N: usize> AsyncComm<'g, N> {
    #[must_use]
    pub const fn new(gate: &'g SingleFlightGate, nonce_seed: u32) -> Self {
        Self {
            gate,
            active: None,
            nonce: nonce_seed,
            keys: [HmacKey::new(), HmacKey::new(), HmacKey::new()],
            bus_batch: AdvBatch::new(),
            bus_cursor: 0,
            bus_announced: false,
        }
    }

    /// Sink whose transfer currently holds the gate.
    #[must_use]
    pub const fn in_progress(&self) -> Option<Sink> {
        self.active
    }

    #[must_use]
    pub const fn nonce(&self) -> u32 {
        self.nonce
    }

    /// Whether the retained "online" status has been published since the bus connected.
    #[must_use]
    pub const fn bus_announced(&self) -> bool {
        self.bus_announced
    }

    /// Replaces the signing key of an HTTP target. Keys that do not fit are refused.
    pub fn set_key(&mut self, sink: Sink, key: &[u8]) -> bool {
        if !sink.is_http() {
            return false;
        }
        let slot = &mut self.keys[sink.index()];
        slot.clear();
        if slot.extend_from_slice(key).is_err() {
            slot.clear();
            return false;
        }
        true
    }

    #[must_use]
    pub fn key(&self, sink: Sink) -> &[u8] {
        if sink.is_http() {
            &self.keys[sink.index()]
        } else {
            &[]
        }
    }

    /// Drains the sink's queue and starts uploading it.
    ///
    /// `timestamp` is stamped into the request header. The nonce advances
    /// once the transfer has actually started.
    pub fn start_advertisements<S, H, E>(
        &mut self,
        sink: Sink,
        timestamp: u64,
        use_timestamps: bool,
        store: &S,
        http: &mut H,
        encoder: &mut E,
    ) -> Result<(), StartError>
    where
        S: AdvStore<N> + ?Sized,
        H: HttpClient + ?Sized,
        E: PayloadEncoder + ?Sized,
    {
        let queue = match sink {
            Sink::Primary => QueueId::Sink1,
            Sink::Custom => QueueId::Sink2,
            Sink::Statistics | Sink::MessageBus => return Err(StartError::InvalidSink(sink)),
        };
        let header = AdvHeader {
            nonce: self.nonce,
            timestamp,
            use_timestamps,
        };
        self.start_http(sink, http, |out| {
            let records = store.drain(queue);
            debug!("comm: {} record(s) for {}", records.len(), sink);
            encoder.encode_advertisements(&header, &records, out)
        })?;
        self.nonce = self.nonce.wrapping_add(1);
        Ok(())
    }

    /// Snapshots the store for the statistics endpoint and starts the upload.
    pub fn start_statistics<S, H, E>(
        &mut self,
        uptime: Duration,
        metrics: MetricsSnapshot,
        store: &S,
        http: &mut H,
        encoder: &mut E,
    ) -> Result<(), StartError>
    where
        S: AdvStore<N> + ?Sized,
        H: HttpClient + ?Sized,
        E: PayloadEncoder + ?Sized,
    {
        let report = StatisticsReport {
            nonce: self.nonce,
            uptime,
            metrics,
        };
        self.start_http(Sink::Statistics, http, |out| {
            let records = store.read_statistics();
            encoder.encode_statistics(&report, &records, out)
        })
    }

    fn start_http<H>(
        &mut self,
        sink: Sink,
        http: &mut H,
        build: impl FnOnce(&mut BodyWriter<'_>) -> Result<(), EncodeError>,
    ) -> Result<(), StartError>
    where
        H: HttpClient + ?Sized,
    {
        if !self.gate.try_lock() {
            return Err(StartError::Busy);
        }

        let Some(buf) = http.body_buffer() else {
            self.gate.unlock();
            return Err(StartError::NoMemory);
        };
        let mut out = BodyWriter::new(buf, &self.keys[sink.index()]);
        if let Err(err) = build(&mut out) {
            self.gate.unlock();
            return Err(StartError::Encode(err));
        }
        let (len, signature) = out.finish();

        if let Err(err) = http.start(sink, len, signature.as_deref()) {
            self.gate.unlock();
            return Err(StartError::Net(err));
        }
        self.active = Some(sink);
        Ok(())
    }

    /// Takes the message-bus queue as one batch and holds the gate until it is published.
    pub fn start_bus<S, B>(&mut self, store: &S, bus: &B) -> Result<(), StartError>
    where
        S: AdvStore<N> + ?Sized,
        B: MessageBusClient + ?Sized,
    {
        if !bus.is_connected() {
            self.bus_announced = false;
            return Err(StartError::BusDisconnected);
        }
        if !self.gate.try_lock() {
            return Err(StartError::Busy);
        }
        self.bus_batch = store.drain(QueueId::Bus);
        self.bus_cursor = 0;
        self.active = Some(Sink::MessageBus);
        Ok(())
    }

    /// Advances the in-flight HTTP request.
    ///
    /// A rotated key in a successful response replaces the key of the target
    /// that was just used.
    pub fn poll<H>(&mut self, http: &mut H) -> CommPoll
    where
        H: HttpClient + ?Sized,
    {
        let Some(sink) = self.active else {
            return CommPoll::Idle;
        };
        if !sink.is_http() {
            return CommPoll::Pending(sink);
        }

        match http.poll() {
            HttpPoll::Pending => CommPoll::Pending(sink),
            HttpPoll::Done(result) => {
                self.release();
                if let Ok(HttpResponse {
                    rotated_key: Some(key),
                    ..
                }) = &result
                {
                    if !self.set_key(sink, key) {
                        warn!("comm: rotated key for {} rejected", sink);
                    }
                }
                CommPoll::Finished { sink, result }
            }
        }
    }

    /// Publishes the next record of the message-bus batch.
    pub fn step_bus<B, E>(&mut self, bus: &mut B, encoder: &mut E, prefix: &str) -> BusStep
    where
        B: MessageBusClient + ?Sized,
        E: PayloadEncoder + ?Sized,
    {
        if self.active != Some(Sink::MessageBus) {
            return BusStep::Finished;
        }

        if !self.bus_announced {
            if let Err(err) = publish_status(bus, prefix, "online") {
                return self.fail_bus(err);
            }
            self.bus_announced = true;
        }

        let Some(record) = self.bus_batch.get(self.bus_cursor).copied() else {
            self.finish_bus();
            return BusStep::Finished;
        };
        self.bus_cursor += 1;

        let mut payload = [0u8; BUS_PAYLOAD_LEN];
        let mut out = BodyWriter::new(&mut payload, &[]);
        match encoder.encode_bus_record(&record, &mut out) {
            Ok(()) => {
                let (len, _) = out.finish();
                let result = topic(prefix, record.mac)
                    .ok_or(NetError::Generic)
                    .and_then(|topic| bus.publish(&topic, &payload[..len], false));
                if let Err(err) = result {
                    return self.fail_bus(err);
                }
            }
            Err(err) => warn!("comm: skipping {}: {}", record.mac, err),
        }

        if self.bus_cursor >= self.bus_batch.len() {
            self.finish_bus();
            BusStep::Finished
        } else {
            BusStep::Continue
        }
    }

    /// Publishes the retained "offline" status if "online" was announced.
    pub fn announce_offline<B>(&mut self, bus: &mut B, prefix: &str)
    where
        B: MessageBusClient + ?Sized,
    {
        if !self.bus_announced {
            return;
        }
        self.bus_announced = false;
        if bus.is_connected() {
            if let Err(err) = publish_status(bus, prefix, "offline") {
                warn!("comm: offline status not published: {}", err);
            }
        }
    }

    /// Abandons whatever transfer holds the gate.
    pub fn abort<H>(&mut self, http: &mut H)
    where
        H: HttpClient + ?Sized,
    {
        match self.active {
            Some(Sink::MessageBus) => self.finish_bus(),
            Some(sink) => {
                debug!("comm: aborting {}", sink);
                http.abort();
                self.release();
            }
            None => {}
        }
    }

    fn fail_bus(&mut self, err: NetError) -> BusStep {
        warn!("comm: publish failed: {}", err);
        self.finish_bus();
        BusStep::Failed(err)
    }

    fn finish_bus(&mut self) {
        self.bus_batch.clear();
        self.bus_cursor = 0;
        self.release();
    }

    fn release(&mut self) {
        self.active = None;
        self.gate.unlock();
    }
}

fn topic(prefix: &str, suffix: impl fmt::Display) -> Option<String<MAX_TOPIC_LEN>> {
    let mut topic = String::new();
    write!(topic, "{prefix}{suffix}").ok()?;
    Some(topic)
}

fn publish_status<B>(bus: &mut B, prefix: &str, status: &str) -> Result<(), NetError>
where
    B: MessageBusClient + ?Sized,
{
    let topic = topic(prefix, STATUS_TOPIC).ok_or(NetError::Generic)?;
    bus.publish(&topic, status.as_bytes(), true)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::cell::RefCell;
    use std::collections::VecDeque;
    use std::string::{String as StdString, ToString};
    use std::vec::Vec as StdVec;

    use super::*;
    use crate::adv_table::{AdvRecord, AdvTable, MAX_PAYLOAD_LEN, MacAddress};
    use crate::comm::LineEncoder;

    type Store = RefCell<AdvTable<8>>;

    #[derive(Debug)]
    struct Started {
        sink: Sink,
        body: StdString,
        signature: Option<StdString>,
    }

    struct ScriptedHttp {
        buffer: StdVec<u8>,
        out_of_memory: bool,
        start_error: Option<NetError>,
        polls: VecDeque<HttpPoll>,
        started: StdVec<Started>,
        aborted: usize,
    }

    impl ScriptedHttp {
        fn new() -> Self {
            Self::with_buffer(512)
        }

        fn with_buffer(len: usize) -> Self {
            Self {
                buffer: std::vec![0; len],
                out_of_memory: false,
                start_error: None,
                polls: VecDeque::new(),
                started: StdVec::new(),
                aborted: 0,
            }
        }
    }

    impl HttpClient for ScriptedHttp {
        fn body_buffer(&mut self) -> Option<&mut [u8]> {
            (!self.out_of_memory).then_some(&mut self.buffer[..])
        }

        fn start(
            &mut self,
            sink: Sink,
            body_len: usize,
            signature: Option<&str>,
        ) -> Result<(), NetError> {
            if let Some(err) = self.start_error {
                return Err(err);
            }
            let body = core::str::from_utf8(&self.buffer[..body_len]).expect("utf8 body");
            self.started.push(Started {
                sink,
                body: body.to_string(),
                signature: signature.map(ToString::to_string),
            });
            Ok(())
        }

        fn poll(&mut self) -> HttpPoll {
            self.polls.pop_front().unwrap_or(HttpPoll::Pending)
        }

        fn abort(&mut self) {
            self.aborted += 1;
        }
    }

    #[derive(Default)]
    struct RecordingBus {
        connected: bool,
        fail_after: Option<usize>,
        published: StdVec<(StdString, StdString, bool)>,
    }

    impl MessageBusClient for RecordingBus {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), NetError> {
            if self.fail_after == Some(self.published.len()) {
                return Err(NetError::Timeout);
            }
            let payload = core::str::from_utf8(payload).expect("utf8 payload");
            self.published
                .push((topic.to_string(), payload.to_string(), retained));
            Ok(())
        }
    }

    fn store_with(count: u8) -> Store {
        let store = RefCell::new(AdvTable::<8>::new());
        for last in 0..count {
            let mac = MacAddress::new([0xAA, 0, 0, 0, 0, last]);
            let record = AdvRecord::new(mac, 100 + u64::from(last), -50, &[last]).expect("valid");
            store.put(record);
        }
        store
    }

    fn start_primary(
        comm: &mut AsyncComm<'_, 8>,
        store: &Store,
        http: &mut ScriptedHttp,
    ) -> Result<(), StartError> {
        comm.start_advertisements(Sink::Primary, 1_000, true, store, http, &mut LineEncoder)
    }

    #[test]
    fn second_start_is_refused_while_gate_is_held() {
        let gate = SingleFlightGate::new();
        let mut comm = AsyncComm::<8>::new(&gate, 0);
        let store = store_with(2);
        let mut http = ScriptedHttp::new();

        start_primary(&mut comm, &store, &mut http).expect("first start");
        assert!(gate.is_locked());

        let stats = comm.start_statistics(
            Duration::from_secs(5),
            MetricsSnapshot::default(),
            &store,
            &mut http,
            &mut LineEncoder,
        );
        assert_eq!(stats, Err(StartError::Busy));
        let custom =
            comm.start_advertisements(Sink::Custom, 1_000, true, &store, &mut http, &mut LineEncoder);
        assert_eq!(custom, Err(StartError::Busy));
        assert_eq!(http.started.len(), 1);
        // The refused custom start must not have drained its queue.
        assert_eq!(store.borrow().queued(QueueId::Sink2), 2);

        assert_eq!(comm.poll(&mut http), CommPoll::Pending(Sink::Primary));
        http.polls.push_back(HttpPoll::Done(Ok(HttpResponse::ok())));
        assert_eq!(
            comm.poll(&mut http),
            CommPoll::Finished {
                sink: Sink::Primary,
                result: Ok(HttpResponse::ok())
            }
        );
        assert!(!gate.is_locked());

        comm.start_statistics(
            Duration::from_secs(5),
            MetricsSnapshot::default(),
            &store,
            &mut http,
            &mut LineEncoder,
        )
        .expect("stats start after release");
        assert_eq!(http.started[1].sink, Sink::Statistics);
    }

    #[test]
    fn one_transfer_carries_every_queued_record() {
        let gate = SingleFlightGate::new();
        let mut comm = AsyncComm::<8>::new(&gate, 7);
        let store = store_with(2);
        let mut http = ScriptedHttp::new();

        start_primary(&mut comm, &store, &mut http).expect("start");

        let body = &http.started[0].body;
        assert!(body.starts_with("adv nonce=7 ts=1000\n"));
        assert_eq!(body.lines().count(), 3);
        assert_eq!(comm.nonce(), 8);
        assert_eq!(store.borrow().queued(QueueId::Sink1), 0);
        assert_eq!(store.borrow().queued(QueueId::Bus), 2);
    }

    #[test]
    fn allocation_failure_releases_gate() {
        let gate = SingleFlightGate::new();
        let mut comm = AsyncComm::<8>::new(&gate, 0);
        let store = store_with(1);
        let mut http = ScriptedHttp::new();
        http.out_of_memory = true;

        assert_eq!(start_primary(&mut comm, &store, &mut http), Err(StartError::NoMemory));
        assert!(!gate.is_locked());
        assert_eq!(comm.in_progress(), None);
        assert_eq!(comm.nonce(), 0);
    }

    #[test]
    fn full_store_fits_one_request_at_the_encoder_bound() {
        const FULL: usize = DEFAULT_CAPACITY;
        let gate = SingleFlightGate::new();
        let mut comm = AsyncComm::<FULL>::new(&gate, 0);
        let store = RefCell::new(AdvTable::<FULL>::new());
        for index in 0..FULL {
            let [hi, lo] = u16::try_from(index).expect("small").to_be_bytes();
            let mac = MacAddress::new([0xC0, 0, 0, 0, hi, lo]);
            let payload = [u8::try_from(index).expect("small"); MAX_PAYLOAD_LEN];
            store.put(AdvRecord::new(mac, u64::MAX - 1, i8::MIN, &payload).expect("valid"));
        }
        assert_eq!(store.borrow().queued(QueueId::Sink1), FULL);
        let mut http = ScriptedHttp::with_buffer(LineEncoder::max_body_len(FULL));

        comm.start_advertisements(Sink::Primary, u64::MAX, true, &store, &mut http, &mut LineEncoder)
            .expect("full store fits");

        assert_eq!(http.started.len(), 1);
        assert_eq!(http.started[0].body.lines().count(), FULL + 1);
        assert_eq!(comm.in_progress(), Some(Sink::Primary));
    }

    #[test]
    fn overflowing_body_releases_gate() {
        let gate = SingleFlightGate::new();
        let mut comm = AsyncComm::<8>::new(&gate, 0);
        let store = store_with(4);
        let mut http = ScriptedHttp::with_buffer(48);

        assert_eq!(
            start_primary(&mut comm, &store, &mut http),
            Err(StartError::Encode(EncodeError::BufferFull))
        );
        assert!(!gate.is_locked());
        assert_eq!(comm.in_progress(), None);
        assert_eq!(comm.nonce(), 0);
        assert!(http.started.is_empty());
    }

    #[test]
    fn start_error_releases_gate() {
        let gate = SingleFlightGate::new();
        let mut comm = AsyncComm::<8>::new(&gate, 0);
        let store = store_with(1);
        let mut http = ScriptedHttp::new();
        http.start_error = Some(NetError::Dns);

        assert_eq!(
            start_primary(&mut comm, &store, &mut http),
            Err(StartError::Net(NetError::Dns))
        );
        assert!(!gate.is_locked());
    }

    #[test]
    fn statistics_do_not_advance_nonce() {
        let gate = SingleFlightGate::new();
        let mut comm = AsyncComm::<8>::new(&gate, 3);
        let store = store_with(1);
        let mut http = ScriptedHttp::new();

        comm.start_statistics(
            Duration::from_secs(60),
            MetricsSnapshot::default(),
            &store,
            &mut http,
            &mut LineEncoder,
        )
        .expect("start");
        assert!(http.started[0].body.starts_with("stats nonce=3 uptime=60"));
        assert_eq!(comm.nonce(), 3);
    }

    #[test]
    fn key_signs_body_and_rotates_on_response() {
        let gate = SingleFlightGate::new();
        let mut comm = AsyncComm::<8>::new(&gate, 0);
        let store = store_with(1);
        let mut http = ScriptedHttp::new();
        assert!(comm.set_key(Sink::Primary, b"secret"));

        start_primary(&mut comm, &store, &mut http).expect("start");
        assert_eq!(http.started[0].signature.as_ref().map(StdString::len), Some(64));

        let mut rotated = HmacKey::new();
        rotated.extend_from_slice(b"fresh").expect("fits");
        http.polls.push_back(HttpPoll::Done(Ok(HttpResponse {
            status: 200,
            rate_override: None,
            rotated_key: Some(rotated),
        })));
        assert!(matches!(comm.poll(&mut http), CommPoll::Finished { .. }));
        assert_eq!(comm.key(Sink::Primary), b"fresh");
        assert!(comm.key(Sink::Custom).is_empty());

        comm.start_advertisements(Sink::Custom, 0, true, &store, &mut http, &mut LineEncoder)
            .expect("start");
        assert_eq!(http.started[1].signature, None);
    }

    #[test]
    fn abort_releases_gate() {
        let gate = SingleFlightGate::new();
        let mut comm = AsyncComm::<8>::new(&gate, 0);
        let store = store_with(1);
        let mut http = ScriptedHttp::new();

        start_primary(&mut comm, &store, &mut http).expect("start");
        comm.abort(&mut http);
        assert_eq!(http.aborted, 1);
        assert!(!gate.is_locked());
        assert_eq!(comm.poll(&mut http), CommPoll::Idle);

        comm.abort(&mut http);
        assert_eq!(http.aborted, 1);
    }

    #[test]
    fn bus_batch_announces_online_then_publishes_each_record() {
        let gate = SingleFlightGate::new();
        let mut comm = AsyncComm::<8>::new(&gate, 0);
        let store = store_with(2);
        let mut bus = RecordingBus {
            connected: true,
            ..RecordingBus::default()
        };

        comm.start_bus(&store, &bus).expect("start");
        assert!(gate.is_locked());
        assert_eq!(store.borrow().queued(QueueId::Bus), 0);

        assert_eq!(comm.step_bus(&mut bus, &mut LineEncoder, "ruuvi/"), BusStep::Continue);
        assert_eq!(comm.step_bus(&mut bus, &mut LineEncoder, "ruuvi/"), BusStep::Finished);
        assert!(!gate.is_locked());

        assert_eq!(bus.published.len(), 3);
        assert_eq!(bus.published[0], ("ruuvi/gw_status".to_string(), "online".to_string(), true));
        assert_eq!(bus.published[1].0, "ruuvi/AA:00:00:00:00:00");
        assert!(!bus.published[1].2);

        comm.announce_offline(&mut bus, "ruuvi/");
        assert_eq!(bus.published[3], ("ruuvi/gw_status".to_string(), "offline".to_string(), true));
        assert!(!comm.bus_announced());
    }

    #[test]
    fn bus_publish_error_ends_batch() {
        let gate = SingleFlightGate::new();
        let mut comm = AsyncComm::<8>::new(&gate, 0);
        let store = store_with(3);
        let mut bus = RecordingBus {
            connected: true,
            fail_after: Some(2),
            ..RecordingBus::default()
        };

        comm.start_bus(&store, &bus).expect("start");
        assert_eq!(comm.step_bus(&mut bus, &mut LineEncoder, "gw/"), BusStep::Continue);
        assert_eq!(
            comm.step_bus(&mut bus, &mut LineEncoder, "gw/"),
            BusStep::Failed(NetError::Timeout)
        );
        assert!(!gate.is_locked());
        assert_eq!(comm.in_progress(), None);
    }

    #[test]
    fn disconnected_bus_does_not_take_gate() {
        let gate = SingleFlightGate::new();
        let mut comm = AsyncComm::<8>::new(&gate, 0);
        let store = store_with(1);
        let bus = RecordingBus::default();

        assert_eq!(comm.start_bus(&store, &bus), Err(StartError::BusDisconnected));
        assert!(!gate.is_locked());
        assert_eq!(store.borrow().queued(QueueId::Bus), 1);
    }
}
