//! Gateway configuration accessors.
//!
//! The orchestrator only reads configuration through [`GatewayConfig`]; the
//! persisted store behind it lives outside this crate. [`GatewaySettings`] is
//! the plain value type the firmware and the emulator keep in memory. Every
//! accessor returns an owned value or lends through a callback, so an
//! implementation may sit behind a lock.

use core::cell::RefCell;
use core::fmt;
use core::time::Duration;

use critical_section::Mutex;
use heapless::{String, Vec};

use crate::adv_table::MacAddress;

/// Largest scan-filter list a settings value can hold.
pub const MAX_SETTINGS_SCAN_FILTER: usize = 64;

/// Longest message-bus topic prefix.
pub const MAX_TOPIC_PREFIX_LEN: usize = 64;

/// Default message-bus topic prefix.
pub const DEFAULT_TOPIC_PREFIX: &str = "ruuvi/";

/// Default custom-sink period.
pub const DEFAULT_CUSTOM_PERIOD: Duration = Duration::from_secs(10);

/// Default time without a successful transfer before the gateway restarts.
pub const DEFAULT_NETWORK_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(3600);

/// Radio scan parameters forwarded to the coprocessor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanConfig {
    pub coded_phy: bool,
    pub phy_1mbit: bool,
    pub phy_2mbit: bool,
    pub channel_37: bool,
    pub channel_38: bool,
    pub channel_39: bool,
}

impl ScanConfig {
    pub const DEFAULT: Self = Self {
        coded_phy: false,
        phy_1mbit: true,
        phy_2mbit: false,
        channel_37: true,
        channel_38: true,
        channel_39: true,
    };
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Manufacturer filter applied by the coprocessor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FilterConfig {
    pub company_id: u16,
    pub use_filtering: bool,
}

impl FilterConfig {
    /// Ruuvi Innovations manufacturer id.
    pub const RUUVI_COMPANY_ID: u16 = 0x0499;

    pub const DEFAULT: Self = Self {
        company_id: Self::RUUVI_COMPANY_ID,
        use_filtering: true,
    };
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Message-bus topic prefix.
pub type TopicPrefix = String<MAX_TOPIC_PREFIX_LEN>;

/// Read-only configuration accessors consumed by the orchestrator.
pub trait GatewayConfig {
    /// Relay with wall-clock timestamps (requires time sync) instead of sequence counters.
    fn use_timestamps(&self) -> bool;

    fn scan(&self) -> ScanConfig;

    fn filter(&self) -> FilterConfig;

    /// `true` when the scan filter is an allow list, `false` for a deny list.
    fn scan_filter_allow_listed(&self) -> bool;

    /// Lends the scan-filter MAC list to `visit`.
    fn visit_scan_filter(&self, visit: &mut dyn FnMut(&[MacAddress]));

    /// Relaying switch toggled at runtime.
    fn relaying_enabled(&self) -> bool;

    fn primary_enabled(&self) -> bool;

    fn custom_enabled(&self) -> bool;

    fn custom_period(&self) -> Duration;

    fn statistics_enabled(&self) -> bool;

    fn bus_enabled(&self) -> bool;

    /// Periodic message-bus relaying interval; zero disables the periodic timer.
    fn bus_interval(&self) -> Duration;

    fn bus_topic_prefix(&self) -> TopicPrefix;

    fn network_watchdog_timeout(&self) -> Duration;
}

/// In-memory gateway configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GatewaySettings {
    pub use_timestamps: bool,
    pub scan: ScanConfig,
    pub filter: FilterConfig,
    pub scan_filter_allow_listed: bool,
    pub scan_filter: Vec<MacAddress, MAX_SETTINGS_SCAN_FILTER>,
    pub relaying_enabled: bool,
    pub primary_enabled: bool,
    pub custom_enabled: bool,
    pub custom_period: Duration,
    pub statistics_enabled: bool,
    pub bus_enabled: bool,
    pub bus_interval: Duration,
    pub bus_topic_prefix: TopicPrefix,
    pub network_watchdog_timeout: Duration,
}

impl GatewaySettings {
    /// Factory defaults: primary sink and statistics on, custom sink and message bus off.
    ///
    /// The topic prefix starts empty here because `heapless::String` cannot be
    /// filled in a const context; [`Default`] fills in [`DEFAULT_TOPIC_PREFIX`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            use_timestamps: true,
            scan: ScanConfig::DEFAULT,
            filter: FilterConfig::DEFAULT,
            scan_filter_allow_listed: false,
            scan_filter: Vec::new(),
            relaying_enabled: true,
            primary_enabled: true,
            custom_enabled: false,
            custom_period: DEFAULT_CUSTOM_PERIOD,
            statistics_enabled: true,
            bus_enabled: false,
            bus_interval: Duration::ZERO,
            bus_topic_prefix: String::new(),
            network_watchdog_timeout: DEFAULT_NETWORK_WATCHDOG_TIMEOUT,
        }
    }

    /// Replaces the topic prefix, truncating on a character boundary if it is too long.
    pub fn set_topic_prefix(&mut self, prefix: &str) {
        self.bus_topic_prefix.clear();
        for ch in prefix.chars() {
            if self.bus_topic_prefix.push(ch).is_err() {
                break;
            }
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        let mut settings = Self::new();
        settings.set_topic_prefix(DEFAULT_TOPIC_PREFIX);
        settings
    }
}

impl GatewayConfig for GatewaySettings {
    fn use_timestamps(&self) -> bool {
        self.use_timestamps
    }

    fn scan(&self) -> ScanConfig {
        self.scan
    }

    fn filter(&self) -> FilterConfig {
        self.filter
    }

    fn scan_filter_allow_listed(&self) -> bool {
        self.scan_filter_allow_listed
    }

    fn visit_scan_filter(&self, visit: &mut dyn FnMut(&[MacAddress])) {
        visit(&self.scan_filter);
    }

    fn relaying_enabled(&self) -> bool {
        self.relaying_enabled
    }

    fn primary_enabled(&self) -> bool {
        self.primary_enabled
    }

    fn custom_enabled(&self) -> bool {
        self.custom_enabled
    }

    fn custom_period(&self) -> Duration {
        self.custom_period
    }

    fn statistics_enabled(&self) -> bool {
        self.statistics_enabled
    }

    fn bus_enabled(&self) -> bool {
        self.bus_enabled
    }

    fn bus_interval(&self) -> Duration {
        self.bus_interval
    }

    fn bus_topic_prefix(&self) -> TopicPrefix {
        self.bus_topic_prefix.clone()
    }

    fn network_watchdog_timeout(&self) -> Duration {
        self.network_watchdog_timeout
    }
}

/// Largest MAC list the receive-path filter can hold.
///
/// [`GatewaySettings`] is bounded by the same limit, so only other
/// [`GatewayConfig`] implementations (e.g. a persisted store with a longer
/// list) can overflow the cache.
pub const MAX_SCAN_FILTER: usize = MAX_SETTINGS_SCAN_FILTER;

/// The configured scan filter does not fit into [`ScanFilterCache`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanFilterOverflow {
    pub len: usize,
}

impl fmt::Display for ScanFilterOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan filter of {} entries exceeds {MAX_SCAN_FILTER}", self.len)
    }
}

#[derive(Debug)]
struct FilterList {
    allow_listed: bool,
    macs: Vec<MacAddress, MAX_SCAN_FILTER>,
}

/// Copy of the scan filter consulted by the receive path before records reach the store.
///
/// An empty cache accepts every device.
pub struct ScanFilterCache {
    inner: Mutex<RefCell<FilterList>>,
}

impl ScanFilterCache {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(FilterList {
                allow_listed: false,
                macs: Vec::new(),
            })),
        }
    }

    /// Replaces the cached list. On overflow the cache is left empty.
    pub fn replace(&self, allow_listed: bool, macs: &[MacAddress]) -> Result<(), ScanFilterOverflow> {
        critical_section::with(|cs| {
            let mut list = self.inner.borrow_ref_mut(cs);
            list.macs.clear();
            list.allow_listed = allow_listed;
            if list.macs.extend_from_slice(macs).is_err() {
                list.macs.clear();
                return Err(ScanFilterOverflow { len: macs.len() });
            }
            Ok(())
        })
    }

    pub fn clear(&self) {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).macs.clear());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).macs.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether advertisements from `mac` should be stored.
    #[must_use]
    pub fn accepts(&self, mac: &MacAddress) -> bool {
        critical_section::with(|cs| {
            let list = self.inner.borrow_ref(cs);
            if list.macs.is_empty() {
                return true;
            }
            list.macs.contains(mac) == list.allow_listed
        })
    }
}

impl Default for ScanFilterCache {
    fn default() -> Self {
        Self::new()
    }
}
