//! Serial receive path: bytes from the coprocessor into the store, the link and the bus.

use core::marker::PhantomData;

use crate::adv_table::{AdvStore, DEFAULT_CAPACITY, MacAddress, PutOutcome};
use crate::config::ScanFilterCache;
use crate::log::{debug, warn};
use crate::signals::{Signal, SignalSink};
use crate::telemetry::{Counter, Metrics};

use super::protocol::{FrameDecoder, FrameError, Inbound};
use super::{AckDisposition, CoprocessorLink};

/// Shared state the receive path writes to.
pub struct RxContext<'a, S: ?Sized, G: ?Sized> {
    pub store: &'a S,
    pub link: &'a CoprocessorLink,
    pub signals: &'a G,
    pub metrics: &'a Metrics,
    pub scan_filter: &'a ScanFilterCache,
}

/// What one completed frame turned into.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxEvent {
    Stored(MacAddress, PutOutcome),
    /// Dropped by the scan filter.
    Filtered(MacAddress),
    /// The report could not become a record.
    Invalid(MacAddress),
    Rebooted,
    Ack(AckDisposition),
    Rejected(FrameError),
}

/// Incremental decoder plus dispatch for the coprocessor byte stream.
#[derive(Debug, Default)]
pub struct ReceivePath<const N: usize = DEFAULT_CAPACITY> {
    decoder: FrameDecoder,
    _store: PhantomData<[(); N]>,
}

impl<const N: usize> ReceivePath<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            _store: PhantomData,
        }
    }

    /// Feeds one byte. `timestamp` stamps any advertisement completed by it.
    pub fn push<S, G>(&mut self, byte: u8, timestamp: u64, ctx: &RxContext<'_, S, G>) -> Option<RxEvent>
    where
        S: AdvStore<N> + ?Sized,
        G: SignalSink + ?Sized,
    {
        let event = match self.decoder.push(byte)? {
            Ok(Inbound::AdvReport(report)) => {
                let mac = report.mac;
                if !ctx.scan_filter.accepts(&mac) {
                    return Some(RxEvent::Filtered(mac));
                }
                match report.into_record(timestamp) {
                    Ok(record) => {
                        ctx.metrics.increment(Counter::AdvReceived);
                        RxEvent::Stored(mac, ctx.store.put(record))
                    }
                    Err(err) => {
                        warn!("rx: report from {} dropped: {}", mac, err);
                        RxEvent::Invalid(mac)
                    }
                }
            }
            Ok(Inbound::Ack(ack)) => RxEvent::Ack(ctx.link.on_ack(ack, ctx.signals)),
            Ok(Inbound::Rebooted) => {
                ctx.signals.post(Signal::CoprocessorRebooted);
                RxEvent::Rebooted
            }
            Err(err) => {
                debug!("rx: frame rejected: {}", err);
                RxEvent::Rejected(err)
            }
        };
        Some(event)
    }

    /// Feeds a chunk, handing every resulting event to `on_event`.
    pub fn extend<S, G>(
        &mut self,
        bytes: &[u8],
        timestamp: u64,
        ctx: &RxContext<'_, S, G>,
        mut on_event: impl FnMut(RxEvent),
    ) where
        S: AdvStore<N> + ?Sized,
        G: SignalSink + ?Sized,
    {
        for &byte in bytes {
            if let Some(event) = self.push(byte, timestamp, ctx) {
                on_event(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::cell::RefCell;
    use std::vec::Vec as StdVec;

    use super::*;
    use crate::adv_table::AdvTable;
    use crate::config::{FilterConfig, ScanConfig};
    use crate::coprocessor::protocol::{CommandId, encode_frame, opcode};
    use crate::signals::SignalBus;

    struct Rx {
        store: RefCell<AdvTable<4>>,
        link: CoprocessorLink,
        signals: SignalBus,
        metrics: Metrics,
        scan_filter: ScanFilterCache,
    }

    impl Rx {
        fn new() -> Self {
            Self {
                store: RefCell::new(AdvTable::new()),
                link: CoprocessorLink::new(),
                signals: SignalBus::new(),
                metrics: Metrics::new(),
                scan_filter: ScanFilterCache::new(),
            }
        }

        fn feed(&self, path: &mut ReceivePath<4>, bytes: &[u8]) -> StdVec<RxEvent> {
            let ctx = RxContext {
                store: &self.store,
                link: &self.link,
                signals: &self.signals,
                metrics: &self.metrics,
                scan_filter: &self.scan_filter,
            };
            let mut events = StdVec::new();
            path.extend(bytes, 1_700_000_000, &ctx, |event| events.push(event));
            events
        }
    }

    fn report(last: u8) -> heapless::Vec<u8, 48> {
        encode_frame(opcode::ADV_REPORT, &[0xC0, 0, 0, 0, 0, last, 0xC4, 0x99, 0x04])
    }

    #[test]
    fn reports_reach_the_store_and_count() {
        let rx = Rx::new();
        let mut path = ReceivePath::new();
        let mut stream = StdVec::from([0xFF_u8, 0x00]);
        stream.extend_from_slice(&report(1));
        stream.extend_from_slice(&report(1));

        let events = rx.feed(&mut path, &stream);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], RxEvent::Stored(_, PutOutcome::Merged { samples: 2 })));
        assert_eq!(rx.store.borrow().len(), 1);
        assert_eq!(rx.metrics.get(Counter::AdvReceived), 2);
        let record = rx.store.borrow().iter_recent().next().copied().expect("stored");
        assert_eq!(record.timestamp, 1_700_000_000);
        assert_eq!(record.rssi, -60);
    }

    #[test]
    fn scan_filter_drops_denied_devices() {
        let rx = Rx::new();
        let denied = MacAddress::new([0xC0, 0, 0, 0, 0, 2]);
        rx.scan_filter.replace(false, &[denied]).expect("fits");
        let mut path = ReceivePath::new();

        let events = rx.feed(&mut path, &report(2));
        assert_eq!(events, [RxEvent::Filtered(denied)]);
        assert!(rx.store.borrow().is_empty());
    }

    #[test]
    fn reboot_notice_posts_signal() {
        let rx = Rx::new();
        let mut path = ReceivePath::new();
        let events = rx.feed(&mut path, &encode_frame(opcode::REBOOTED, &[]));
        assert_eq!(events, [RxEvent::Rebooted]);
        assert!(rx.signals.snapshot().contains(Signal::CoprocessorRebooted));
    }

    #[test]
    fn ack_without_outstanding_command_is_unexpected() {
        let rx = Rx::new();
        rx.link.cache_config(ScanConfig::DEFAULT, FilterConfig::DEFAULT);
        let mut path = ReceivePath::new();
        let ack = encode_frame(opcode::ACK, &[CommandId::SetAll.opcode(), 0]);
        let events = rx.feed(&mut path, &ack);
        assert_eq!(events, [RxEvent::Ack(AckDisposition::Unexpected)]);
        assert!(rx.signals.snapshot().is_empty());
    }

    #[test]
    fn corrupted_frame_is_rejected_and_stream_recovers() {
        let rx = Rx::new();
        let mut path = ReceivePath::new();
        let mut broken = report(3);
        let crc_at = broken.len() - 3;
        broken[crc_at] ^= 0xFF;
        let mut stream = StdVec::from(broken.as_slice());
        stream.extend_from_slice(&report(3));

        let events = rx.feed(&mut path, &stream);
        assert!(matches!(events[0], RxEvent::Rejected(FrameError::Checksum { .. })));
        assert!(matches!(events.last(), Some(RxEvent::Stored(..))));
    }
}
