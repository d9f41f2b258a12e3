//! State shared between firmware tasks.
//!
//! The advertisement store is written by the coprocessor receive task and
//! drained by the orchestrator; the settings are read by the orchestrator and
//! edited from the console. Both sit behind Embassy blocking mutexes so every
//! access is a short, non-async critical section.

use core::cell::RefCell;
use core::time::Duration;

use embassy_sync::blocking_mutex::Mutex;
#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use gateway_core::adv_table::{
    AdvBatch, AdvRecord, AdvStore, AdvTable, DEFAULT_CAPACITY, HistoryFilter, MacAddress,
    PutOutcome, QueueId,
};
use gateway_core::config::{FilterConfig, GatewayConfig, GatewaySettings, ScanConfig, TopicPrefix};

#[cfg(target_os = "none")]
pub type GatewayMutex = CriticalSectionRawMutex;
#[cfg(not(target_os = "none"))]
pub type GatewayMutex = NoopRawMutex;

/// Advertisement store guarded for access from several tasks.
pub struct SharedStore<const N: usize = DEFAULT_CAPACITY> {
    table: Mutex<GatewayMutex, RefCell<AdvTable<N>>>,
}

impl<const N: usize> SharedStore<N> {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(RefCell::new(AdvTable::new())),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut AdvTable<N>) -> R) -> R {
        self.table.lock(|table| f(&mut table.borrow_mut()))
    }

    /// Lends every record accepted by `filter` to `visit` without copying the batch out.
    pub fn visit_history(&self, now: u64, filter: HistoryFilter, visit: &mut dyn FnMut(&AdvRecord)) {
        self.table.lock(|table| {
            for record in &table.borrow().read_history(now, filter) {
                visit(record);
            }
        });
    }
}

impl<const N: usize> AdvStore<N> for SharedStore<N> {
    fn put(&self, record: AdvRecord) -> PutOutcome {
        self.with(|table| table.put(record))
    }

    fn drain(&self, queue: QueueId) -> AdvBatch<N> {
        self.with(|table| table.drain(queue))
    }

    fn read_history(&self, now: u64, filter: HistoryFilter) -> AdvBatch<N> {
        self.with(|table| table.read_history(now, filter))
    }

    fn read_statistics(&self) -> AdvBatch<N> {
        self.with(AdvTable::read_statistics)
    }

    fn clear(&self) {
        self.with(AdvTable::clear);
    }

    fn len(&self) -> usize {
        self.table.lock(|table| table.borrow().len())
    }

    fn take_put_count(&self) -> u32 {
        self.with(AdvTable::take_put_count)
    }
}

/// Gateway settings readable by the orchestrator and editable from the console.
pub struct SharedSettings {
    settings: Mutex<GatewayMutex, RefCell<GatewaySettings>>,
}

impl SharedSettings {
    pub const fn new(settings: GatewaySettings) -> Self {
        Self {
            settings: Mutex::new(RefCell::new(settings)),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&GatewaySettings) -> R) -> R {
        self.settings.lock(|settings| f(&settings.borrow()))
    }

    /// Applies `f` to the settings. The caller posts the signal describing the change.
    pub fn update<R>(&self, f: impl FnOnce(&mut GatewaySettings) -> R) -> R {
        self.settings.lock(|settings| f(&mut settings.borrow_mut()))
    }

    pub fn set_relaying(&self, enabled: bool) {
        self.update(|settings| settings.relaying_enabled = enabled);
    }
}

impl GatewayConfig for SharedSettings {
    fn use_timestamps(&self) -> bool {
        self.read(|settings| settings.use_timestamps)
    }

    fn scan(&self) -> ScanConfig {
        self.read(|settings| settings.scan)
    }

    fn filter(&self) -> FilterConfig {
        self.read(|settings| settings.filter)
    }

    fn scan_filter_allow_listed(&self) -> bool {
        self.read(|settings| settings.scan_filter_allow_listed)
    }

    fn visit_scan_filter(&self, visit: &mut dyn FnMut(&[MacAddress])) {
        self.read(|settings| visit(&settings.scan_filter));
    }

    fn relaying_enabled(&self) -> bool {
        self.read(|settings| settings.relaying_enabled)
    }

    fn primary_enabled(&self) -> bool {
        self.read(|settings| settings.primary_enabled)
    }

    fn custom_enabled(&self) -> bool {
        self.read(|settings| settings.custom_enabled)
    }

    fn custom_period(&self) -> Duration {
        self.read(|settings| settings.custom_period)
    }

    fn statistics_enabled(&self) -> bool {
        self.read(|settings| settings.statistics_enabled)
    }

    fn bus_enabled(&self) -> bool {
        self.read(|settings| settings.bus_enabled)
    }

    fn bus_interval(&self) -> Duration {
        self.read(|settings| settings.bus_interval)
    }

    fn bus_topic_prefix(&self) -> TopicPrefix {
        self.read(|settings| settings.bus_topic_prefix.clone())
    }

    fn network_watchdog_timeout(&self) -> Duration {
        self.read(|settings| settings.network_watchdog_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(last: u8, timestamp: u64) -> AdvRecord {
        let mac = MacAddress::new([0xC0, 0, 0, 0, 0, last]);
        AdvRecord::new(mac, timestamp, -60, &[0x99, 0x04, last]).expect("valid record")
    }

    #[test]
    fn store_queues_each_put_for_every_sink() {
        let store: SharedStore<8> = SharedStore::new();
        store.put(record(1, 10));
        store.put(record(2, 11));
        assert_eq!(store.len(), 2);
        assert_eq!(store.take_put_count(), 2);
        assert_eq!(store.take_put_count(), 0);

        assert_eq!(store.drain(QueueId::Sink1).len(), 2);
        assert!(store.drain(QueueId::Sink1).is_empty());
        assert_eq!(store.drain(QueueId::Bus).len(), 2);
    }

    #[test]
    fn visit_history_applies_filter() {
        let store: SharedStore<8> = SharedStore::new();
        store.put(record(1, 100));
        store.put(record(2, 200));

        let mut seen = Vec::new();
        store.visit_history(250, HistoryFilter::MaxAge(60), &mut |record| seen.push(record.mac));
        assert_eq!(seen, [MacAddress::new([0xC0, 0, 0, 0, 0, 2])]);
    }

    #[test]
    fn cleared_store_reports_empty() {
        let store: SharedStore<8> = SharedStore::new();
        store.put(record(1, 10));
        store.clear();
        assert!(store.is_empty());
        assert!(store.drain(QueueId::Sink2).is_empty());
    }

    #[test]
    fn settings_edits_are_visible_through_config_accessors() {
        let settings = SharedSettings::new(GatewaySettings::default());
        assert!(settings.relaying_enabled());
        settings.set_relaying(false);
        assert!(!settings.relaying_enabled());

        settings.update(|settings| settings.set_topic_prefix("site/"));
        assert_eq!(settings.bus_topic_prefix(), "site/");
    }

    #[test]
    fn scan_filter_is_lent_without_copy() {
        let settings = SharedSettings::new(GatewaySettings::default());
        let mac = MacAddress::new([1, 2, 3, 4, 5, 6]);
        settings.update(|settings| settings.scan_filter.push(mac).expect("room"));

        let mut lent = Vec::new();
        settings.visit_scan_filter(&mut |macs| lent.extend_from_slice(macs));
        assert_eq!(lent, [mac]);
    }
}
