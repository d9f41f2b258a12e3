//! Radio coprocessor link.
//!
//! The link is split across two execution contexts. [`CoprocessorLink`] is
//! shared: the serial receive path calls [`CoprocessorLink::on_ack`] and only
//! reads or swaps the last issued command, while the cached configuration sits
//! behind one critical-section lock. [`LinkSupervisor`] is owned by the
//! orchestrator and drives the request, ACK, timeout and hardware reset state
//! machine from signals.

pub mod protocol;
mod receive;

use core::cell::RefCell;
use core::fmt;

use critical_section::Mutex;
use portable_atomic::{AtomicU8, Ordering};

use crate::config::{FilterConfig, ScanConfig};
use crate::log::{debug, error, info, warn};
use crate::signals::{Signal, SignalSink};
use crate::telemetry::{Counter, Metrics};
use crate::time::Instant;
use crate::timers::{TimerId, TimerService};

use self::protocol::{Ack, CommandId, Request, SetAllParams};
pub use self::receive::{ReceivePath, RxContext, RxEvent};

/// Consecutive ACK timeouts tolerated before the coprocessor is hardware-reset.
pub const ACK_RETRY_CEILING: u8 = 10;

/// LED blink interval requested while the green LED is on.
pub const LED_ON_INTERVAL_MS: u16 = 1500;

const NO_COMMAND: u8 = 0;

/// Failure reported by a [`CoprocessorTransport`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The transmit path could not take the frame right now.
    Busy,
    Io,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Busy => f.write_str("transmitter busy"),
            TransportError::Io => f.write_str("serial write failed"),
        }
    }
}

/// Serial transmit path and reset line of the coprocessor.
pub trait CoprocessorTransport {
    /// Queues one encoded frame for transmission.
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Drives the reset line; `true` holds the coprocessor in reset.
    fn set_reset(&mut self, asserted: bool);
}

/// Transport that drops every frame.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopTransport;

impl CoprocessorTransport for NoopTransport {
    fn write_frame(&mut self, _: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_reset(&mut self, _: bool) {}
}

/// What the receive path did with an ACK.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AckDisposition {
    /// Matched the outstanding command; the matching signal was posted.
    Accepted(CommandId),
    /// Matched, but the coprocessor reported a failure. Recovery is left to the ACK timeout.
    Rejected(CommandId),
    /// No command with that opcode was outstanding.
    Unexpected,
}

#[derive(Copy, Clone, Debug)]
struct SharedState {
    scan: ScanConfig,
    filter: FilterConfig,
    cfg_ready: bool,
    configured: bool,
    in_hw_reset: bool,
}

/// State shared between the orchestrator and the serial receive path.
pub struct CoprocessorLink {
    last_cmd: AtomicU8,
    shared: Mutex<RefCell<SharedState>>,
}

impl CoprocessorLink {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last_cmd: AtomicU8::new(NO_COMMAND),
            shared: Mutex::new(RefCell::new(SharedState {
                scan: ScanConfig::DEFAULT,
                filter: FilterConfig::DEFAULT,
                cfg_ready: false,
                configured: false,
                in_hw_reset: false,
            })),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> R {
        critical_section::with(|cs| f(&mut self.shared.borrow_ref_mut(cs)))
    }

    /// Stores the configuration to push on the next `SET_ALL`.
    ///
    /// The coprocessor counts as unconfigured until that command is acknowledged.
    pub fn cache_config(&self, scan: ScanConfig, filter: FilterConfig) {
        self.with_state(|state| {
            state.scan = scan;
            state.filter = filter;
            state.configured = false;
            state.in_hw_reset = false;
            state.cfg_ready = true;
        });
    }

    /// `SET_ALL` request built from the cached configuration, once one exists.
    #[must_use]
    pub fn cached_request(&self) -> Option<Request> {
        self.with_state(|state| {
            state
                .cfg_ready
                .then(|| Request::SetAll(SetAllParams::from_config(&state.scan, &state.filter)))
        })
    }

    #[must_use]
    pub fn is_cfg_ready(&self) -> bool {
        self.with_state(|state| state.cfg_ready)
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.with_state(|state| state.configured)
    }

    #[must_use]
    pub fn in_hw_reset(&self) -> bool {
        self.with_state(|state| state.in_hw_reset)
    }

    /// Command currently awaiting its ACK.
    #[must_use]
    pub fn last_command(&self) -> Option<CommandId> {
        CommandId::from_opcode(self.last_cmd.load(Ordering::Acquire))
    }

    fn set_configured(&self, configured: bool) {
        self.with_state(|state| state.configured = configured);
    }

    fn set_in_hw_reset(&self, in_reset: bool) {
        self.with_state(|state| state.in_hw_reset = in_reset);
    }

    fn expect_ack(&self, command: CommandId) {
        self.last_cmd.store(command.opcode(), Ordering::Release);
    }

    fn forget_command(&self) {
        self.last_cmd.store(NO_COMMAND, Ordering::Release);
    }

    /// Receive-path handler for an ACK frame.
    ///
    /// The outstanding command is consumed whether or not the opcode matches,
    /// so a late duplicate can never be matched twice.
    pub fn on_ack<S: SignalSink + ?Sized>(&self, ack: Ack, signals: &S) -> AckDisposition {
        let expected = self.last_cmd.swap(NO_COMMAND, Ordering::AcqRel);
        let Some(command) = CommandId::from_opcode(ack.opcode).filter(|_| expected == ack.opcode)
        else {
            warn!(
                "coprocessor: unexpected ack for opcode {}, awaiting {}",
                ack.opcode, expected
            );
            return AckDisposition::Unexpected;
        };

        if !ack.ok {
            error!("coprocessor: command {:?} failed", command);
            return AckDisposition::Rejected(command);
        }

        signals.post(match command {
            CommandId::SetAll => Signal::CoprocessorAckCfg,
            CommandId::LedCtrl => Signal::CoprocessorAckLedCtrl,
        });
        AckDisposition::Accepted(command)
    }
}

impl Default for CoprocessorLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Coarse link phase surfaced in status reports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkPhase {
    Resetting,
    Unconfigured,
    AwaitingAck(CommandId),
    Configured,
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkPhase::Resetting => f.write_str("resetting"),
            LinkPhase::Unconfigured => f.write_str("unconfigured"),
            LinkPhase::AwaitingAck(CommandId::SetAll) => f.write_str("awaiting-ack set-all"),
            LinkPhase::AwaitingAck(CommandId::LedCtrl) => f.write_str("awaiting-ack led-ctrl"),
            LinkPhase::Configured => f.write_str("configured"),
        }
    }
}

/// Collaborators the supervisor touches while handling one signal.
pub struct LinkIo<'a, T: ?Sized, S: ?Sized> {
    pub transport: &'a mut T,
    pub timers: &'a mut TimerService,
    pub signals: &'a S,
    pub metrics: &'a Metrics,
    pub now: Instant,
}

/// Orchestrator-side state machine of the coprocessor link.
#[derive(Clone, Debug, Default)]
pub struct LinkSupervisor {
    waiting_ack: bool,
    cfg_required: bool,
    ack_timeouts: u8,
    led_interval: Option<u16>,
}

impl LinkSupervisor {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiting_ack: false,
            cfg_required: false,
            ack_timeouts: 0,
            led_interval: None,
        }
    }

    #[must_use]
    pub const fn is_waiting_ack(&self) -> bool {
        self.waiting_ack
    }

    #[must_use]
    pub const fn cfg_required(&self) -> bool {
        self.cfg_required
    }

    /// Consecutive ACK timeouts since the last acknowledged command.
    #[must_use]
    pub const fn ack_timeouts(&self) -> u8 {
        self.ack_timeouts
    }

    /// LED interval waiting to be sent or acknowledged.
    #[must_use]
    pub const fn pending_led(&self) -> Option<u16> {
        self.led_interval
    }

    #[must_use]
    pub fn phase(&self, link: &CoprocessorLink) -> LinkPhase {
        if link.in_hw_reset() {
            LinkPhase::Resetting
        } else if let Some(command) = link.last_command().filter(|_| self.waiting_ack) {
            LinkPhase::AwaitingAck(command)
        } else if link.is_configured() {
            LinkPhase::Configured
        } else {
            LinkPhase::Unconfigured
        }
    }

    /// Holds the coprocessor in reset and arms the release timer.
    pub fn reset<T, S>(&mut self, link: &CoprocessorLink, io: &mut LinkIo<'_, T, S>)
    where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        info!("coprocessor: hardware reset");
        io.transport.set_reset(true);
        link.set_in_hw_reset(true);
        link.forget_command();
        self.led_interval = None;
        self.cfg_required = false;
        self.waiting_ack = false;
        io.timers.stop(TimerId::CoprocessorAckTimeout);
        arm(io, TimerId::CoprocessorHwResetOff);
    }

    /// Releases the reset line and opens the window in which the coprocessor must ask for configuration.
    pub fn on_hw_reset_off<T, S>(&mut self, link: &CoprocessorLink, io: &mut LinkIo<'_, T, S>)
    where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        io.transport.set_reset(false);
        link.set_in_hw_reset(false);
        arm(io, TimerId::CoprocessorCfgReqTimeout);
    }

    /// The coprocessor never announced itself after a reset: reset it again.
    pub fn on_cfg_req_timeout<T, S>(&mut self, link: &CoprocessorLink, io: &mut LinkIo<'_, T, S>)
    where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        warn!("coprocessor: no reboot notice after reset");
        io.metrics.increment(Counter::CoprocessorExtHwResets);
        self.reset(link, io);
    }

    /// Reboot notice from the coprocessor.
    ///
    /// A notice inside the post-reset window is the expected outcome of our own
    /// reset; anything else counts as a self reboot.
    pub fn on_rebooted<T, S>(&mut self, link: &CoprocessorLink, io: &mut LinkIo<'_, T, S>)
    where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        self.led_interval = None;
        self.cfg_required = false;
        self.waiting_ack = false;
        link.forget_command();
        io.timers.stop(TimerId::CoprocessorAckTimeout);

        if link.is_cfg_ready() {
            if io.timers.is_active(TimerId::CoprocessorCfgReqTimeout) {
                info!("coprocessor: rebooted after hardware reset");
            } else {
                warn!("coprocessor: rebooted unexpectedly");
                io.metrics.increment(Counter::CoprocessorSelfReboots);
            }
            io.signals.post(Signal::CoprocessorCfgUpdate);
        }
        io.timers.stop(TimerId::CoprocessorCfgReqTimeout);
    }

    /// Requests a `SET_ALL`, deferring it while another command awaits its ACK.
    pub fn on_cfg_update<T, S>(&mut self, link: &CoprocessorLink, io: &mut LinkIo<'_, T, S>)
    where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        link.set_configured(false);
        self.cfg_required = true;
        if self.waiting_ack {
            debug!("coprocessor: cfg deferred until pending ack resolves");
        } else {
            self.send_cfg(link, io);
        }
    }

    /// Requests an LED blink interval (0 turns the LED off).
    pub fn send_led_ctrl<T, S>(
        &mut self,
        interval_ms: u16,
        link: &CoprocessorLink,
        io: &mut LinkIo<'_, T, S>,
    ) where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        self.led_interval = Some(interval_ms);
        if !self.waiting_ack {
            self.send_led(interval_ms, link, io);
        }
    }

    pub fn on_ack_led_ctrl<T, S>(&mut self, link: &CoprocessorLink, io: &mut LinkIo<'_, T, S>)
    where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        self.led_interval = None;
        self.acknowledged(io);
        if self.cfg_required {
            self.send_cfg(link, io);
        }
    }

    /// `SET_ALL` acknowledged. The caller clears the advertisement store.
    pub fn on_ack_cfg<T, S>(&mut self, link: &CoprocessorLink, io: &mut LinkIo<'_, T, S>)
    where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        self.acknowledged(io);
        self.cfg_required = false;
        link.set_configured(true);
        info!("coprocessor: configured");
        io.signals.post(Signal::CoprocessorConfigured);
        if let Some(interval_ms) = self.led_interval {
            self.send_led(interval_ms, link, io);
        }
    }

    /// No ACK within the timeout: resend, or reset once the retry ceiling is reached.
    pub fn on_ack_timeout<T, S>(&mut self, link: &CoprocessorLink, io: &mut LinkIo<'_, T, S>)
    where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        if !self.waiting_ack {
            return;
        }
        self.waiting_ack = false;
        link.forget_command();
        io.metrics.increment(Counter::LostAcks);
        self.ack_timeouts = self.ack_timeouts.saturating_add(1);
        warn!("coprocessor: ack timeout #{}", self.ack_timeouts);

        if self.ack_timeouts >= ACK_RETRY_CEILING {
            self.ack_timeouts = 0;
            io.metrics.increment(Counter::CoprocessorExtHwResets);
            self.reset(link, io);
        } else if self.cfg_required {
            self.send_cfg(link, io);
        } else if let Some(interval_ms) = self.led_interval {
            self.send_led(interval_ms, link, io);
        }
    }

    fn acknowledged<T, S>(&mut self, io: &mut LinkIo<'_, T, S>)
    where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        self.ack_timeouts = 0;
        self.waiting_ack = false;
        io.timers.stop(TimerId::CoprocessorAckTimeout);
    }

    fn send_cfg<T, S>(&mut self, link: &CoprocessorLink, io: &mut LinkIo<'_, T, S>)
    where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        match link.cached_request() {
            Some(request) => self.send(&request, link, io),
            None => debug!("coprocessor: no cached configuration yet"),
        }
    }

    fn send_led<T, S>(&mut self, interval_ms: u16, link: &CoprocessorLink, io: &mut LinkIo<'_, T, S>)
    where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        self.send(&Request::LedCtrl { interval_ms }, link, io);
    }

    fn send<T, S>(&mut self, request: &Request, link: &CoprocessorLink, io: &mut LinkIo<'_, T, S>)
    where
        T: CoprocessorTransport + ?Sized,
        S: SignalSink + ?Sized,
    {
        let command = request.command();
        link.expect_ack(command);
        self.waiting_ack = true;
        if let Err(err) = io.timers.relaunch(TimerId::CoprocessorAckTimeout, io.now, true) {
            error!("coprocessor: cannot arm ack timeout: {:?}", err);
        }
        // A lost frame is recovered by the ACK timeout.
        if let Err(err) = io.transport.write_frame(&request.encode()) {
            error!("coprocessor: write {:?} failed: {:?}", command, err);
        }
    }
}

fn arm<T: ?Sized, S: ?Sized>(io: &mut LinkIo<'_, T, S>, id: TimerId) {
    if let Err(err) = io.timers.start(id, io.now) {
        error!("coprocessor: cannot arm {:?}: {:?}", id, err);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::protocol::{Request, decode_request};
    use super::*;
    use crate::signals::SignalBus;

    #[derive(Default)]
    struct RecordingTransport {
        frames: Vec<Request>,
        reset_edges: Vec<bool>,
    }

    impl CoprocessorTransport for RecordingTransport {
        fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            self.frames.push(decode_request(frame).expect("valid request frame"));
            Ok(())
        }

        fn set_reset(&mut self, asserted: bool) {
            self.reset_edges.push(asserted);
        }
    }

    struct Fixture {
        link: CoprocessorLink,
        supervisor: LinkSupervisor,
        transport: RecordingTransport,
        timers: TimerService,
        signals: SignalBus,
        metrics: Metrics,
        now: Instant,
    }

    impl Fixture {
        fn new() -> Self {
            let link = CoprocessorLink::new();
            link.cache_config(ScanConfig::DEFAULT, FilterConfig::DEFAULT);
            Self {
                link,
                supervisor: LinkSupervisor::new(),
                transport: RecordingTransport::default(),
                timers: TimerService::new(),
                signals: SignalBus::new(),
                metrics: Metrics::new(),
                now: Instant::from_secs(10),
            }
        }

        fn run(
            &mut self,
            f: impl FnOnce(
                &mut LinkSupervisor,
                &CoprocessorLink,
                &mut LinkIo<'_, RecordingTransport, SignalBus>,
            ),
        ) {
            let mut io = LinkIo {
                transport: &mut self.transport,
                timers: &mut self.timers,
                signals: &self.signals,
                metrics: &self.metrics,
                now: self.now,
            };
            f(&mut self.supervisor, &self.link, &mut io);
        }

        fn ack(&self, command: CommandId) -> AckDisposition {
            self.link.on_ack(
                Ack {
                    opcode: command.opcode(),
                    ok: true,
                },
                &self.signals,
            )
        }

        fn time_out(&mut self) {
            self.run(|sup, link, io| sup.on_ack_timeout(link, io));
        }
    }

    #[test]
    fn cfg_update_sends_set_all_and_waits_for_ack() {
        let mut fx = Fixture::new();
        fx.run(|sup, link, io| sup.on_cfg_update(link, io));

        assert!(matches!(fx.transport.frames.as_slice(), [Request::SetAll(_)]));
        assert!(fx.supervisor.is_waiting_ack());
        assert!(fx.timers.is_active(TimerId::CoprocessorAckTimeout));
        assert_eq!(
            fx.supervisor.phase(&fx.link),
            LinkPhase::AwaitingAck(CommandId::SetAll)
        );

        assert_eq!(fx.ack(CommandId::SetAll), AckDisposition::Accepted(CommandId::SetAll));
        assert_eq!(fx.signals.take_next(), Some(Signal::CoprocessorAckCfg));

        fx.run(|sup, link, io| sup.on_ack_cfg(link, io));
        assert!(fx.link.is_configured());
        assert!(!fx.supervisor.cfg_required());
        assert!(!fx.timers.is_active(TimerId::CoprocessorAckTimeout));
        assert_eq!(fx.signals.take_next(), Some(Signal::CoprocessorConfigured));
        assert_eq!(fx.supervisor.phase(&fx.link), LinkPhase::Configured);
    }

    #[test]
    fn cfg_request_waits_for_outstanding_led_ack() {
        let mut fx = Fixture::new();
        fx.run(|sup, link, io| sup.send_led_ctrl(LED_ON_INTERVAL_MS, link, io));
        fx.run(|sup, link, io| sup.on_cfg_update(link, io));

        assert_eq!(fx.transport.frames.len(), 1);
        assert!(fx.supervisor.cfg_required());

        fx.ack(CommandId::LedCtrl);
        assert_eq!(fx.signals.take_next(), Some(Signal::CoprocessorAckLedCtrl));
        fx.run(|sup, link, io| sup.on_ack_led_ctrl(link, io));

        assert_eq!(fx.transport.frames.len(), 2);
        assert!(matches!(fx.transport.frames[1], Request::SetAll(_)));
        assert_eq!(fx.supervisor.pending_led(), None);
    }

    #[test]
    fn mismatched_ack_is_dropped() {
        let mut fx = Fixture::new();
        fx.run(|sup, link, io| sup.on_cfg_update(link, io));

        assert_eq!(fx.ack(CommandId::LedCtrl), AckDisposition::Unexpected);
        assert!(!fx.signals.is_pending());
        assert!(fx.supervisor.is_waiting_ack());
        // The stale command was consumed, so the matching ACK no longer matches either.
        assert_eq!(fx.ack(CommandId::SetAll), AckDisposition::Unexpected);
    }

    #[test]
    fn rejected_ack_leaves_recovery_to_timeout() {
        let mut fx = Fixture::new();
        fx.run(|sup, link, io| sup.on_cfg_update(link, io));

        let disposition = fx.link.on_ack(
            Ack {
                opcode: CommandId::SetAll.opcode(),
                ok: false,
            },
            &fx.signals,
        );
        assert_eq!(disposition, AckDisposition::Rejected(CommandId::SetAll));
        assert!(!fx.signals.is_pending());

        fx.time_out();
        assert_eq!(fx.transport.frames.len(), 2);
        assert_eq!(fx.metrics.get(Counter::LostAcks), 1);
    }

    #[test]
    fn retry_ceiling_triggers_exactly_one_hardware_reset() {
        let mut fx = Fixture::new();
        fx.run(|sup, link, io| sup.on_cfg_update(link, io));

        for _ in 0..ACK_RETRY_CEILING {
            fx.time_out();
        }

        assert_eq!(fx.transport.reset_edges, [true]);
        assert_eq!(fx.metrics.get(Counter::CoprocessorExtHwResets), 1);
        assert_eq!(fx.metrics.get(Counter::LostAcks), u32::from(ACK_RETRY_CEILING));
        assert_eq!(fx.supervisor.ack_timeouts(), 0);
        assert_eq!(fx.supervisor.phase(&fx.link), LinkPhase::Resetting);
        assert!(fx.timers.is_active(TimerId::CoprocessorHwResetOff));
        // Initial SET_ALL plus one resend per timeout below the ceiling.
        assert_eq!(fx.transport.frames.len(), usize::from(ACK_RETRY_CEILING));

        // A stray timeout after the reset changes nothing.
        fx.time_out();
        assert_eq!(fx.transport.reset_edges, [true]);
    }

    #[test]
    fn successful_ack_resets_timeout_counter() {
        let mut fx = Fixture::new();
        fx.run(|sup, link, io| sup.on_cfg_update(link, io));
        for _ in 0..ACK_RETRY_CEILING - 1 {
            fx.time_out();
        }
        assert_eq!(fx.supervisor.ack_timeouts(), ACK_RETRY_CEILING - 1);

        fx.ack(CommandId::SetAll);
        fx.run(|sup, link, io| sup.on_ack_cfg(link, io));
        assert_eq!(fx.supervisor.ack_timeouts(), 0);

        fx.run(|sup, link, io| sup.send_led_ctrl(0, link, io));
        for _ in 0..ACK_RETRY_CEILING - 1 {
            fx.time_out();
        }
        assert!(fx.transport.reset_edges.is_empty());
    }

    #[test]
    fn reset_sequence_releases_line_and_counts_expected_reboot() {
        let mut fx = Fixture::new();
        fx.run(|sup, link, io| sup.reset(link, io));
        fx.now = Instant::from_millis(10_100);
        fx.run(|sup, link, io| sup.on_hw_reset_off(link, io));

        assert_eq!(fx.transport.reset_edges, [true, false]);
        assert!(!fx.link.in_hw_reset());
        assert!(fx.timers.is_active(TimerId::CoprocessorCfgReqTimeout));

        fx.run(|sup, link, io| sup.on_rebooted(link, io));
        assert_eq!(fx.metrics.get(Counter::CoprocessorSelfReboots), 0);
        assert!(!fx.timers.is_active(TimerId::CoprocessorCfgReqTimeout));
        assert_eq!(fx.signals.take_next(), Some(Signal::CoprocessorCfgUpdate));

        fx.run(|sup, link, io| sup.on_rebooted(link, io));
        assert_eq!(fx.metrics.get(Counter::CoprocessorSelfReboots), 1);
    }

    #[test]
    fn missing_reboot_notice_resets_again() {
        let mut fx = Fixture::new();
        fx.run(|sup, link, io| sup.reset(link, io));
        fx.run(|sup, link, io| sup.on_hw_reset_off(link, io));
        fx.run(|sup, link, io| sup.on_cfg_req_timeout(link, io));

        assert_eq!(fx.transport.reset_edges, [true, false, true]);
        assert_eq!(fx.metrics.get(Counter::CoprocessorExtHwResets), 1);
    }

    #[test]
    fn reboot_before_config_is_cached_requests_nothing() {
        let mut fx = Fixture::new();
        fx.link = CoprocessorLink::new();
        fx.run(|sup, link, io| sup.on_rebooted(link, io));
        assert!(!fx.signals.is_pending());
        assert_eq!(fx.metrics.get(Counter::CoprocessorSelfReboots), 0);
    }
}
