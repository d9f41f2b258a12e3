//! Fixed-capacity advertisement store.
//!
//! Records live in a flat slot array. Every link between slots (hash chains,
//! the recency list and the per-sink retransmission queues) is an index into
//! that array, so eviction is pure index rewiring and nothing is ever
//! allocated after construction.

use core::cell::RefCell;
use core::fmt;
use core::str::FromStr;

use heapless::{Deque, Vec};

/// Number of hash buckets used by the MAC index.
pub const HASH_BUCKETS: usize = 101;

/// Default number of slots in the store.
pub const DEFAULT_CAPACITY: usize = 100;

/// Maximum raw payload length carried by a record.
pub const MAX_PAYLOAD_LEN: usize = 32;

/// Number of independent retransmission queues.
pub const QUEUE_COUNT: usize = 3;

/// Six-byte device address used as the store key.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    #[must_use]
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Error returned when a MAC address string is malformed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacParseError;

impl fmt::Display for MacParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected six colon-separated hex octets")
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in &mut bytes {
            let part = parts.next().ok_or(MacParseError)?;
            if part.len() != 2 {
                return Err(MacParseError);
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| MacParseError)?;
        }
        if parts.next().is_some() {
            return Err(MacParseError);
        }
        Ok(Self(bytes))
    }
}

/// Errors raised when building an [`AdvRecord`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecordError {
    /// A record must carry at least one payload byte; zero length marks a free slot.
    EmptyPayload,
    /// Payload exceeds [`MAX_PAYLOAD_LEN`].
    PayloadTooLong { len: usize },
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::EmptyPayload => f.write_str("empty advertisement payload"),
            RecordError::PayloadTooLong { len } => {
                write!(f, "payload of {len} bytes exceeds {MAX_PAYLOAD_LEN}")
            }
        }
    }
}

/// One beacon observation.
///
/// `timestamp` holds unix seconds when the gateway relays with timestamps and
/// a monotonically increasing sequence number otherwise.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvRecord {
    pub mac: MacAddress,
    pub timestamp: u64,
    pub rssi: i8,
    pub samples_counter: u16,
    data_len: u8,
    payload: [u8; MAX_PAYLOAD_LEN],
}

impl AdvRecord {
    const FREE: Self = Self {
        mac: MacAddress([0; 6]),
        timestamp: 0,
        rssi: 0,
        samples_counter: 0,
        data_len: 0,
        payload: [0; MAX_PAYLOAD_LEN],
    };

    /// Builds a record, validating the payload length.
    pub fn new(
        mac: MacAddress,
        timestamp: u64,
        rssi: i8,
        payload: &[u8],
    ) -> Result<Self, RecordError> {
        if payload.is_empty() {
            return Err(RecordError::EmptyPayload);
        }
        let data_len = u8::try_from(payload.len())
            .ok()
            .filter(|len| usize::from(*len) <= MAX_PAYLOAD_LEN)
            .ok_or(RecordError::PayloadTooLong { len: payload.len() })?;

        let mut record = Self {
            mac,
            timestamp,
            rssi,
            samples_counter: 0,
            data_len,
            payload: [0; MAX_PAYLOAD_LEN],
        };
        record.payload[..payload.len()].copy_from_slice(payload);
        Ok(record)
    }

    /// Raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload[..usize::from(self.data_len)]
    }

    #[must_use]
    pub const fn data_len(&self) -> usize {
        self.data_len as usize
    }

    /// `true` when the record is logically absent.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.data_len == 0
    }

    fn release(&mut self) {
        self.timestamp = 0;
        self.samples_counter = 0;
        self.data_len = 0;
        self.payload = [0; MAX_PAYLOAD_LEN];
    }
}

/// Retransmission queue owned by one sink.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QueueId {
    /// Primary cloud endpoint.
    Sink1,
    /// User-configured custom endpoint.
    Sink2,
    /// Message-bus endpoint.
    Bus,
}

impl QueueId {
    pub const ALL: [QueueId; QUEUE_COUNT] = [QueueId::Sink1, QueueId::Sink2, QueueId::Bus];

    const fn index(self) -> usize {
        match self {
            QueueId::Sink1 => 0,
            QueueId::Sink2 => 1,
            QueueId::Bus => 2,
        }
    }
}

/// Window applied by [`AdvTable::read_history`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HistoryFilter {
    /// Every live record.
    All,
    /// Records whose timestamp is at most this many seconds before `now`.
    MaxAge(u64),
    /// Records whose timestamp is strictly greater than this sequence value.
    SinceSequence(u64),
}

impl HistoryFilter {
    fn accepts(self, now: u64, record: &AdvRecord) -> bool {
        match self {
            HistoryFilter::All => true,
            HistoryFilter::MaxAge(age) => now.saturating_sub(record.timestamp) <= age,
            HistoryFilter::SinceSequence(sequence) => record.timestamp > sequence,
        }
    }
}

/// Result of [`AdvTable::put`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PutOutcome {
    /// The MAC was already indexed; the slot was refreshed in place.
    Merged { samples: u16 },
    /// A tail slot was recycled. `evicted` names the live record that was dropped.
    Inserted { evicted: Option<MacAddress> },
    /// The store has no slots.
    Dropped,
}

/// Snapshot of records copied out of the store.
pub type AdvBatch<const N: usize> = Vec<AdvRecord, N>;

#[derive(Copy, Clone)]
struct Slot {
    record: AdvRecord,
    chained: bool,
    hash_next: Option<usize>,
    newer: Option<usize>,
    older: Option<usize>,
    queued: [bool; QUEUE_COUNT],
}

impl Slot {
    const EMPTY: Self = Self {
        record: AdvRecord::FREE,
        chained: false,
        hash_next: None,
        newer: None,
        older: None,
        queued: [false; QUEUE_COUNT],
    };
}

/// Bucket index for a MAC: XOR the two halves byte-wise, pack the results
/// little-endian and reduce modulo [`HASH_BUCKETS`].
#[must_use]
pub fn bucket_of(mac: &MacAddress) -> usize {
    let bytes = mac.as_bytes();
    let (low, high) = bytes.split_at(bytes.len() / 2);
    let hash = low
        .iter()
        .zip(high)
        .enumerate()
        .fold(0u32, |hash, (position, (a, b))| {
            hash | (u32::from(a ^ b) << (8 * position))
        });
    // u32 -> usize is lossless on every supported target.
    hash as usize % HASH_BUCKETS
}

/// Bounded cache of the most recently seen beacons.
pub struct AdvTable<const N: usize = DEFAULT_CAPACITY> {
    slots: [Slot; N],
    buckets: [Option<usize>; HASH_BUCKETS],
    head: Option<usize>,
    tail: Option<usize>,
    queues: [Deque<usize, N>; QUEUE_COUNT],
    live: usize,
    puts: u32,
}

impl<const N: usize> AdvTable<N> {
    /// Creates a store with every slot free and linked into the recency list.
    #[must_use]
    pub const fn new() -> Self {
        let mut slots = [Slot::EMPTY; N];
        let mut index = 0;
        while index < N {
            if index > 0 {
                slots[index].newer = Some(index - 1);
            }
            if index + 1 < N {
                slots[index].older = Some(index + 1);
            }
            index += 1;
        }

        Self {
            slots,
            buckets: [None; HASH_BUCKETS],
            head: if N > 0 { Some(0) } else { None },
            tail: if N > 0 { Some(N - 1) } else { None },
            queues: [const { Deque::new() }; QUEUE_COUNT],
            live: 0,
            puts: 0,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of live (non-free) records.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Inserts or refreshes the record for `record.mac`.
    pub fn put(&mut self, record: AdvRecord) -> PutOutcome {
        self.puts = self.puts.wrapping_add(1);
        let bucket = bucket_of(&record.mac);

        let (index, outcome) = if let Some(index) = self.find(bucket, &record.mac) {
            let slot = &mut self.slots[index];
            if slot.record.is_free() {
                self.live += 1;
            }
            let samples = slot.record.samples_counter.saturating_add(1);
            slot.record = record;
            slot.record.samples_counter = samples;
            (index, PutOutcome::Merged { samples })
        } else {
            let Some(index) = self.tail else {
                return PutOutcome::Dropped;
            };
            let evicted = self.unchain(index);
            if evicted.is_none() {
                self.live += 1;
            }
            let slot = &mut self.slots[index];
            slot.record = record;
            slot.record.samples_counter = 1;
            slot.chained = true;
            slot.hash_next = self.buckets[bucket];
            self.buckets[bucket] = Some(index);
            (index, PutOutcome::Inserted { evicted })
        };

        self.promote(index);
        for queue in QueueId::ALL {
            let flag = &mut self.slots[index].queued[queue.index()];
            if !*flag && self.queues[queue.index()].push_back(index).is_ok() {
                *flag = true;
            }
        }

        outcome
    }

    /// Pops every record currently queued for `queue`.
    pub fn drain(&mut self, queue: QueueId) -> AdvBatch<N> {
        let mut batch = AdvBatch::new();
        while let Some(index) = self.queues[queue.index()].pop_front() {
            let slot = &mut self.slots[index];
            slot.queued[queue.index()] = false;
            // Capacity matches the slot count and each slot is queued at most once.
            let _ = batch.push(slot.record);
        }
        batch
    }

    /// Copies live records, newest first, that pass `filter`.
    #[must_use]
    pub fn read_history(&self, now: u64, filter: HistoryFilter) -> AdvBatch<N> {
        let mut batch = AdvBatch::new();
        for record in self.iter_recent() {
            if filter.accepts(now, record) {
                let _ = batch.push(*record);
            }
        }
        batch
    }

    /// Copies every live record and resets its merge counter.
    pub fn read_statistics(&mut self) -> AdvBatch<N> {
        let mut batch = AdvBatch::new();
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &mut self.slots[index];
            if slot.record.is_free() || batch.is_full() {
                break;
            }
            let _ = batch.push(slot.record);
            slot.record.samples_counter = 0;
            cursor = slot.older;
        }
        batch
    }

    /// Empties every queue and frees every slot.
    ///
    /// Hash chains and the recency order are left in place: a cleared MAC is
    /// still indexed, reads treat it as absent and the next `put` for it
    /// reuses the same slot.
    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
        for slot in &mut self.slots {
            slot.queued = [false; QUEUE_COUNT];
            slot.record.release();
        }
        self.live = 0;
    }

    /// Returns the live record for `mac`.
    #[must_use]
    pub fn get(&self, mac: &MacAddress) -> Option<&AdvRecord> {
        self.find(bucket_of(mac), mac)
            .map(|index| &self.slots[index].record)
            .filter(|record| !record.is_free())
    }

    /// `true` when `mac` is reachable through the hash index, live or not.
    #[must_use]
    pub fn is_indexed(&self, mac: &MacAddress) -> bool {
        self.find(bucket_of(mac), mac).is_some()
    }

    /// Number of records queued for `queue`.
    #[must_use]
    pub fn queued(&self, queue: QueueId) -> usize {
        self.queues[queue.index()].len()
    }

    /// Live records from most to least recently updated.
    pub fn iter_recent(&self) -> impl Iterator<Item = &AdvRecord> + '_ {
        core::iter::successors(self.head, move |&index| self.slots[index].older)
            .take(N)
            .map(move |index| &self.slots[index].record)
            .take_while(|record| !record.is_free())
    }

    /// Returns the number of `put` calls since the previous call and resets it.
    pub fn take_put_count(&mut self) -> u32 {
        core::mem::take(&mut self.puts)
    }

    fn find(&self, bucket: usize, mac: &MacAddress) -> Option<usize> {
        let mut cursor = self.buckets[bucket];
        while let Some(index) = cursor {
            let slot = &self.slots[index];
            if slot.record.mac == *mac {
                return Some(index);
            }
            cursor = slot.hash_next;
        }
        None
    }

    /// Removes `index` from its hash chain, returning the MAC it held if live.
    fn unchain(&mut self, index: usize) -> Option<MacAddress> {
        let slot = self.slots[index];
        if !slot.chained {
            return None;
        }

        let bucket = bucket_of(&slot.record.mac);
        let mut previous: Option<usize> = None;
        let mut cursor = self.buckets[bucket];
        while let Some(current) = cursor {
            if current == index {
                match previous {
                    Some(prev) => self.slots[prev].hash_next = slot.hash_next,
                    None => self.buckets[bucket] = slot.hash_next,
                }
                break;
            }
            previous = Some(current);
            cursor = self.slots[current].hash_next;
        }

        let slot = &mut self.slots[index];
        slot.chained = false;
        slot.hash_next = None;
        (!slot.record.is_free()).then_some(slot.record.mac)
    }

    /// Moves `index` to the head of the recency list.
    fn promote(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }

        let Slot { newer, older, .. } = self.slots[index];
        if let Some(newer) = newer {
            self.slots[newer].older = older;
        }
        match older {
            Some(older) => self.slots[older].newer = newer,
            None => self.tail = newer,
        }

        self.slots[index].newer = None;
        self.slots[index].older = self.head;
        if let Some(head) = self.head {
            self.slots[head].newer = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }
}

impl<const N: usize> Default for AdvTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Store access shared between the ingestion path and the orchestrator.
///
/// Each call is one short critical section; implementations never block on I/O.
pub trait AdvStore<const N: usize> {
    fn put(&self, record: AdvRecord) -> PutOutcome;

    fn drain(&self, queue: QueueId) -> AdvBatch<N>;

    fn read_history(&self, now: u64, filter: HistoryFilter) -> AdvBatch<N>;

    fn read_statistics(&self) -> AdvBatch<N>;

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of puts since the previous call and resets it.
    fn take_put_count(&self) -> u32;
}

impl<const N: usize> AdvStore<N> for RefCell<AdvTable<N>> {
    fn put(&self, record: AdvRecord) -> PutOutcome {
        self.borrow_mut().put(record)
    }

    fn drain(&self, queue: QueueId) -> AdvBatch<N> {
        self.borrow_mut().drain(queue)
    }

    fn read_history(&self, now: u64, filter: HistoryFilter) -> AdvBatch<N> {
        self.borrow().read_history(now, filter)
    }

    fn read_statistics(&self) -> AdvBatch<N> {
        self.borrow_mut().read_statistics()
    }

    fn clear(&self) {
        self.borrow_mut().clear();
    }

    fn len(&self) -> usize {
        self.borrow().len()
    }

    fn take_put_count(&self) -> u32 {
        self.borrow_mut().take_put_count()
    }
}
