//! Signal-driven gateway orchestrator.
//!
//! One [`Orchestrator`] is the single consumer of the [`SignalBus`]. It owns
//! every timer, the relaying flags and the transfer executor, and forwards
//! coprocessor signals to the link supervisor. Producers on other contexts
//! only post signals, put records into the store, or feed ACKs to the shared
//! [`CoprocessorLink`].

mod relay;

use core::fmt;
use core::time::Duration;

use crate::adv_table::{AdvStore, DEFAULT_CAPACITY};
use crate::comm::{
    AsyncComm, HttpClient, MessageBusClient, PayloadEncoder, SingleFlightGate, Sink,
};
use crate::config::{GatewayConfig, ScanFilterCache};
use crate::coprocessor::{
    CoprocessorLink, CoprocessorTransport, LED_ON_INTERVAL_MS, LinkIo, LinkSupervisor,
};
use crate::log::{debug, error, info, warn};
use crate::signals::{Signal, SignalBus};
use crate::status::{SinkStatus, StatusSnapshot};
use crate::telemetry::{Counter, Metrics};
use crate::time::Instant;
use crate::timers::{
    DEFAULT_RETRANSMIT_PERIOD, STATISTICS_INITIAL_DELAY, STATISTICS_PERIOD, TimerId,
    TimerService,
};

/// Consecutive request-buffer allocation failures that force a restart.
pub const LOW_MEMORY_RESTART_THRESHOLD: u8 = 3;

/// Flags mutated only on the orchestrator's context.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OrchestratorState {
    pub time_synced: bool,
    pub network_connected: bool,
    pub relaying_enabled: bool,
    pub use_timestamps: bool,
    pub stop: bool,
    need_send: [bool; 4],
}

impl OrchestratorState {
    #[must_use]
    pub const fn need_send(&self, sink: Sink) -> bool {
        self.need_send[sink.index()]
    }

    pub fn set_need_send(&mut self, sink: Sink, need: bool) {
        self.need_send[sink.index()] = need;
    }

    /// Highest-priority sink with pending data.
    #[must_use]
    pub fn next_pending(&self) -> Option<Sink> {
        Sink::PRIORITY.into_iter().find(|&sink| self.need_send(sink))
    }

    /// Transfers may start: the network is up and, when records carry
    /// wall-clock timestamps, the clock is synchronized.
    #[must_use]
    pub const fn can_send(&self) -> bool {
        self.network_connected && (self.time_synced || !self.use_timestamps)
    }
}

/// Why the orchestrator asked for a device restart.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RestartReason {
    /// The scan filter could not be copied while applying configuration.
    /// Reachable only through a [`GatewayConfig`] whose list exceeds
    /// [`MAX_SCAN_FILTER`](crate::config::MAX_SCAN_FILTER).
    LowMemoryOnConfigChange,
    /// Repeated request-buffer allocation failures.
    LowMemory,
    /// No successful transfer within the watchdog window.
    NetworkWatchdog,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::LowMemoryOnConfigChange => f.write_str("low memory on config change"),
            RestartReason::LowMemory => f.write_str("low memory"),
            RestartReason::NetworkWatchdog => f.write_str("network watchdog"),
        }
    }
}

/// Device-level controls.
pub trait SystemControl {
    /// Restarts the device. Host implementations record the request and return.
    fn restart(&mut self, reason: RestartReason);

    fn feed_watchdog(&mut self);

    /// Confirms the running firmware image so a pending rollback is cancelled.
    fn mark_image_valid(&mut self);

    /// Wall-clock seconds once time is synchronized.
    fn wall_clock(&self) -> Option<u64>;
}

/// User-visible indicators (LEDs, status pages).
pub trait Indicators {
    fn transfer_result(&mut self, _sink: Sink, _ok: bool) {}

    fn coprocessor_configured(&mut self) {}

    /// No advertisement reached the store during the last receive window.
    fn no_advertisements(&mut self) {}
}

/// Indicator sink that ignores every notification.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopIndicators;

impl Indicators for NoopIndicators {}

/// Collaborator types supplied by the firmware, the emulator or a test.
pub trait Platform {
    type Http: HttpClient;
    type Bus: MessageBusClient;
    type Encoder: PayloadEncoder;
    type Transport: CoprocessorTransport;
    type Indicators: Indicators;
    type System: SystemControl;
}

/// Exclusively owned collaborators.
pub struct Parts<P: Platform> {
    pub http: P::Http,
    pub bus: P::Bus,
    pub encoder: P::Encoder,
    pub transport: P::Transport,
    pub indicators: P::Indicators,
    pub system: P::System,
}

/// State shared with producers on other execution contexts.
pub struct Shared<'a, C: ?Sized, S: ?Sized> {
    pub config: &'a C,
    pub store: &'a S,
    pub signals: &'a SignalBus,
    pub metrics: &'a Metrics,
    pub link: &'a CoprocessorLink,
    pub gate: &'a SingleFlightGate,
    pub scan_filter: &'a ScanFilterCache,
}

/// The single consumer of the signal bus.
pub struct Orchestrator<'a, P, C, S, const N: usize = DEFAULT_CAPACITY>
where
    P: Platform,
    C: GatewayConfig + ?Sized,
    S: AdvStore<N> + ?Sized,
{
    state: OrchestratorState,
    timers: TimerService,
    comm: AsyncComm<'a, N>,
    link: LinkSupervisor,
    shared: Shared<'a, C, S>,
    parts: Parts<P>,
    default_periods: [Duration; 2],
    sink_status: [SinkStatus; 4],
    green_led: bool,
    low_memory_failures: u8,
    image_valid: bool,
    booted_at: Instant,
    last_success: Instant,
}

impl<'a, P, C, S, const N: usize> Orchestrator<'a, P, C, S, N>
where
    P: Platform,
    C: GatewayConfig + ?Sized,
    S: AdvStore<N> + ?Sized,
{
    pub fn new(shared: Shared<'a, C, S>, parts: Parts<P>, nonce_seed: u32, now: Instant) -> Self {
        Self {
            state: OrchestratorState::default(),
            timers: TimerService::new(),
            comm: AsyncComm::new(shared.gate, nonce_seed),
            link: LinkSupervisor::new(),
            shared,
            parts,
            default_periods: [DEFAULT_RETRANSMIT_PERIOD, DEFAULT_RETRANSMIT_PERIOD],
            sink_status: [SinkStatus::Idle; 4],
            green_led: false,
            low_memory_failures: 0,
            image_valid: false,
            booted_at: now,
            last_success: now,
        }
    }

    /// Arms the housekeeping timers and resets the coprocessor.
    ///
    /// Configuration arrives later through [`Signal::ConfigReady`].
    pub fn start(&mut self, now: Instant) {
        self.state.relaying_enabled = self.shared.config.relaying_enabled();
        self.state.use_timestamps = self.shared.config.use_timestamps();
        self.booted_at = now;
        self.last_success = now;
        for id in [
            TimerId::WatchdogFeed,
            TimerId::NetworkWatchdog,
            TimerId::RecvAdvTimeout,
        ] {
            self.arm(id, now);
        }
        info!("orchestrator: started");
        self.with_link(now, |link, shared, io| link.reset(shared, io));
    }

    #[must_use]
    pub const fn state(&self) -> &OrchestratorState {
        &self.state
    }

    #[must_use]
    pub const fn timers(&self) -> &TimerService {
        &self.timers
    }

    #[must_use]
    pub const fn link(&self) -> &LinkSupervisor {
        &self.link
    }

    #[must_use]
    pub const fn comm(&self) -> &AsyncComm<'a, N> {
        &self.comm
    }

    #[must_use]
    pub const fn parts(&self) -> &Parts<P> {
        &self.parts
    }

    pub fn parts_mut(&mut self) -> &mut Parts<P> {
        &mut self.parts
    }

    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.state.stop
    }

    /// Moment the orchestrator next needs to run without a posted signal.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fires due timers into the signal bus.
    pub fn poll_timers(&mut self, now: Instant) {
        self.timers.poll(now, self.shared.signals);
    }

    /// Handles every pending signal, lowest number first. Returns the number handled.
    pub fn dispatch_pending(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        while !self.state.stop {
            let Some(signal) = self.shared.signals.take_next() else {
                break;
            };
            self.handle(signal, now);
            handled += 1;
        }
        handled
    }

    /// One loop iteration: fire due timers, then drain the bus.
    pub fn run_once(&mut self, now: Instant) -> usize {
        self.poll_timers(now);
        self.dispatch_pending(now)
    }

    #[must_use]
    pub fn status(&self, now: Instant) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state,
            sinks: self.sink_status,
            in_progress: self.comm.in_progress(),
            link: self.link.phase(self.shared.link),
            store_len: self.shared.store.len(),
            store_capacity: N,
            metrics: self.shared.metrics.snapshot(),
            uptime: now.saturating_duration_since(self.booted_at),
            since_last_success: now.saturating_duration_since(self.last_success),
            nonce: self.comm.nonce(),
        }
    }

    pub fn handle(&mut self, signal: Signal, now: Instant) {
        debug!("orchestrator: {}", signal);
        match signal {
            Signal::Stop => self.on_stop(),
            Signal::NetworkDisconnected => {
                self.state.network_connected = false;
                self.shared.metrics.increment(Counter::NetworkDisconnects);
            }
            Signal::NetworkConnected => {
                self.state.network_connected = true;
                self.resume_pending(now);
            }
            Signal::TimeSynchronized => self.on_time_synchronized(now),
            Signal::Retransmit => self.request_send(Sink::Primary),
            Signal::Retransmit2 => self.request_send(Sink::Custom),
            Signal::RetransmitMqtt => self.request_send(Sink::MessageBus),
            Signal::SendStatistics => self.request_send(Sink::Statistics),
            Signal::DoAsyncComm => self.do_async_comm(now),
            Signal::RelayingModeChanged => self.on_relaying_mode_changed(),
            Signal::NetworkWatchdog => self.on_network_watchdog(now),
            Signal::TaskWatchdogFeed => {
                self.parts.system.feed_watchdog();
                let received = self.shared.metrics.take(Counter::AdvReceived);
                debug!("orchestrator: {} advertisement(s) received", received);
            }
            Signal::ConfigReady => {
                self.request_coprocessor_config();
                self.postpone_statistics(now);
                self.apply_config(now);
            }
            Signal::ConfigChanged => {
                self.request_coprocessor_config();
                self.apply_config(now);
            }
            Signal::BleScanChanged => self.shared.store.clear(),
            Signal::CfgModeActivated => {
                self.timers.stop(TimerId::NetworkWatchdog);
                self.shared.scan_filter.clear();
                self.shared.store.clear();
            }
            Signal::CfgModeDeactivated => {
                self.last_success = now;
                self.arm(TimerId::NetworkWatchdog, now);
                self.request_coprocessor_config();
                self.apply_config(now);
            }
            Signal::GreenLedTurnOn => self.update_green_led(Some(true), now),
            Signal::GreenLedTurnOff => self.update_green_led(Some(false), now),
            Signal::GreenLedUpdate => self.update_green_led(None, now),
            Signal::RecvAdvTimeout => {
                if self.shared.store.take_put_count() == 0 {
                    warn!("orchestrator: no advertisements received");
                    self.parts.indicators.no_advertisements();
                }
                self.arm(TimerId::RecvAdvTimeout, now);
            }
            Signal::CoprocessorRebooted => {
                self.with_link(now, |link, shared, io| link.on_rebooted(shared, io));
            }
            Signal::CoprocessorConfigured => self.parts.indicators.coprocessor_configured(),
            Signal::CoprocessorCfgUpdate => {
                self.with_link(now, |link, shared, io| link.on_cfg_update(shared, io));
            }
            Signal::CoprocessorHwResetOff => {
                self.with_link(now, |link, shared, io| link.on_hw_reset_off(shared, io));
            }
            Signal::CoprocessorCfgReqTimeout => {
                self.with_link(now, |link, shared, io| link.on_cfg_req_timeout(shared, io));
            }
            Signal::CoprocessorAckTimeout => {
                self.with_link(now, |link, shared, io| link.on_ack_timeout(shared, io));
            }
            Signal::CoprocessorAckLedCtrl => {
                self.with_link(now, |link, shared, io| link.on_ack_led_ctrl(shared, io));
            }
            Signal::CoprocessorAckCfg => {
                // The advertisement format may have changed with the new configuration.
                self.shared.store.clear();
                self.with_link(now, |link, shared, io| link.on_ack_cfg(shared, io));
            }
        }
    }

    fn on_stop(&mut self) {
        info!("orchestrator: stopping");
        self.state.stop = true;
        let prefix = self.shared.config.bus_topic_prefix();
        self.comm.announce_offline(&mut self.parts.bus, &prefix);
        self.comm.abort(&mut self.parts.http);
        self.timers.stop_all();
    }

    fn on_time_synchronized(&mut self, now: Instant) {
        if !self.state.time_synced {
            info!("orchestrator: time synchronized");
            self.state.time_synced = true;
            // Records stamped before the sync carry a different time base.
            self.shared.store.clear();
            if self.shared.config.statistics_enabled() {
                self.postpone_statistics(now);
            }
        }
        self.resume_pending(now);
    }

    /// Restarts the timers of sinks with pending data and kicks the executor.
    fn resume_pending(&mut self, now: Instant) {
        let mut any = false;
        for sink in Sink::PRIORITY {
            if self.state.need_send(sink) {
                any = true;
                if let Err(err) = self.timers.relaunch(sink.timer(), now, true) {
                    debug!("orchestrator: {} timer not restarted: {}", sink, err);
                }
            }
        }
        if any {
            self.shared.signals.post(Signal::DoAsyncComm);
        }
    }

    fn sink_enabled(&self, sink: Sink) -> bool {
        let config = self.shared.config;
        match sink {
            Sink::Primary => config.primary_enabled(),
            Sink::Custom => config.custom_enabled(),
            Sink::Statistics => config.statistics_enabled(),
            Sink::MessageBus => config.bus_enabled(),
        }
    }

    fn request_send(&mut self, sink: Sink) {
        if !self.state.relaying_enabled || !self.sink_enabled(sink) {
            debug!("orchestrator: {} not relaying", sink);
            return;
        }
        self.state.set_need_send(sink, true);
        if self.comm.in_progress().is_none() {
            self.shared.signals.post(Signal::DoAsyncComm);
        }
    }

    fn on_relaying_mode_changed(&mut self) {
        self.state.relaying_enabled = self.shared.config.relaying_enabled();
        info!("orchestrator: relaying {}", self.state.relaying_enabled);
        if self.state.relaying_enabled {
            return;
        }
        if self.comm.in_progress().is_some() {
            self.timers.stop(TimerId::DoAsyncComm);
            self.comm.abort(&mut self.parts.http);
        }
        for sink in [Sink::Primary, Sink::Custom] {
            if self.sink_enabled(sink) {
                self.parts.indicators.transfer_result(sink, false);
            }
        }
    }

    fn on_network_watchdog(&mut self, now: Instant) {
        let timeout = self.shared.config.network_watchdog_timeout();
        if timeout.is_zero() || !self.state.relaying_enabled {
            return;
        }
        let idle = now.saturating_duration_since(self.last_success);
        if idle > timeout {
            error!("orchestrator: no successful transfer for {} s", idle.as_secs());
            self.parts.system.restart(RestartReason::NetworkWatchdog);
        }
    }

    fn request_coprocessor_config(&mut self) {
        let config = self.shared.config;
        self.shared.link.cache_config(config.scan(), config.filter());
        self.shared.signals.post(Signal::CoprocessorCfgUpdate);
    }

    /// Delays the next statistics report to [`STATISTICS_INITIAL_DELAY`] from now.
    fn postpone_statistics(&mut self, now: Instant) {
        self.timers.postpone(
            TimerId::SendStatistics,
            now,
            STATISTICS_PERIOD.saturating_sub(STATISTICS_INITIAL_DELAY),
        );
    }

    fn apply_config(&mut self, now: Instant) {
        let config = self.shared.config;
        self.state.use_timestamps = config.use_timestamps();

        let allow_listed = config.scan_filter_allow_listed();
        let mut copied = Ok(());
        config.visit_scan_filter(&mut |macs| {
            copied = self.shared.scan_filter.replace(allow_listed, macs);
        });
        if let Err(err) = copied {
            error!("orchestrator: {}", err);
            self.parts.system.restart(RestartReason::LowMemoryOnConfigChange);
            return;
        }

        self.default_periods[Sink::Custom.index()] = config.custom_period();
        for sink in [Sink::Primary, Sink::Custom] {
            if self.sink_enabled(sink) {
                self.relaunch_with_period(sink, now, self.default_period(sink));
                self.state.set_need_send(sink, true);
            } else {
                self.timers.stop(sink.timer());
                self.state.set_need_send(sink, false);
            }
        }

        let interval = config.bus_interval();
        if config.bus_enabled() && !interval.is_zero() {
            self.timers.set_period(TimerId::RetransmitMqtt, interval);
            self.arm(TimerId::RetransmitMqtt, now);
        } else {
            self.timers.stop(TimerId::RetransmitMqtt);
        }

        if config.statistics_enabled() {
            if !self.timers.is_active(TimerId::SendStatistics) {
                // Keeps any phase set by postpone_statistics.
                self.timers.set_period(TimerId::SendStatistics, STATISTICS_PERIOD);
                if let Err(err) = self.timers.relaunch(TimerId::SendStatistics, now, false) {
                    error!("orchestrator: {}", err);
                }
            }
            self.state.set_need_send(Sink::Statistics, true);
        } else {
            self.timers.stop(TimerId::SendStatistics);
            self.state.set_need_send(Sink::Statistics, false);
        }

        self.shared.store.clear();
        self.arm(TimerId::DoAsyncComm, now);
    }

    fn update_green_led(&mut self, on: Option<bool>, now: Instant) {
        if let Some(on) = on {
            self.green_led = on;
        }
        if !self.timers.is_active(TimerId::GreenLedUpdate) {
            self.arm(TimerId::GreenLedUpdate, now);
        }
        let interval = if self.green_led { LED_ON_INTERVAL_MS } else { 0 };
        self.with_link(now, |link, shared, io| link.send_led_ctrl(interval, shared, io));
    }

    fn default_period(&self, sink: Sink) -> Duration {
        match sink {
            Sink::Primary | Sink::Custom => self.default_periods[sink.index()],
            Sink::Statistics => STATISTICS_PERIOD,
            Sink::MessageBus => self.timers.period(TimerId::RetransmitMqtt),
        }
    }

    fn relaunch_with_period(&mut self, sink: Sink, now: Instant, period: Duration) {
        if let Err(err) = self.timers.relaunch_if_period_changed(sink.timer(), now, period) {
            error!("orchestrator: {}", err);
        }
    }

    fn arm(&mut self, id: TimerId, now: Instant) {
        if let Err(err) = self.timers.start(id, now) {
            error!("orchestrator: {}", err);
        }
    }

    fn with_link<R>(
        &mut self,
        now: Instant,
        f: impl FnOnce(
            &mut LinkSupervisor,
            &CoprocessorLink,
            &mut LinkIo<'_, P::Transport, SignalBus>,
        ) -> R,
    ) -> R {
        let mut io = LinkIo {
            transport: &mut self.parts.transport,
            timers: &mut self.timers,
            signals: self.shared.signals,
            metrics: self.shared.metrics,
            now,
        };
        f(&mut self.link, self.shared.link, &mut io)
    }
}
