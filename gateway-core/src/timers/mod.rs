//! Timer service.
//!
//! Each timer is permanently bound to one [`Signal`]. The service keeps only
//! deadlines; whoever owns it calls [`TimerService::poll`] with the current
//! instant and sleeps until [`TimerService::next_deadline`] in between.

use core::fmt;
use core::time::Duration;

use crate::log::debug;
use crate::signals::{Signal, SignalSet, SignalSink};
use crate::time::Instant;

/// Default retransmission period for the HTTP sinks.
pub const DEFAULT_RETRANSMIT_PERIOD: Duration = Duration::from_secs(10);
/// Period used after a failed transfer.
pub const BACKOFF_PERIOD: Duration = Duration::from_secs(67);
/// Statistics report period.
pub const STATISTICS_PERIOD: Duration = Duration::from_secs(3600);
/// Delay of the first statistics report after it is postponed.
pub const STATISTICS_INITIAL_DELAY: Duration = Duration::from_secs(60);
pub const NETWORK_WATCHDOG_TICK: Duration = Duration::from_secs(1);
pub const WATCHDOG_FEED_PERIOD: Duration = Duration::from_secs(1);
pub const GREEN_LED_UPDATE_PERIOD: Duration = Duration::from_secs(1);
pub const DO_ASYNC_COMM_DELAY: Duration = Duration::from_millis(100);
pub const RECV_ADV_TIMEOUT: Duration = Duration::from_secs(10);
pub const COPROCESSOR_ACK_TIMEOUT: Duration = Duration::from_millis(100);
pub const COPROCESSOR_RESET_PULSE: Duration = Duration::from_millis(100);
pub const COPROCESSOR_CFG_REQ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerKind {
    Periodic,
    OneShot,
}

/// Every timer owned by the orchestrator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerId {
    Retransmit,
    Retransmit2,
    RetransmitMqtt,
    SendStatistics,
    NetworkWatchdog,
    WatchdogFeed,
    GreenLedUpdate,
    DoAsyncComm,
    RecvAdvTimeout,
    CoprocessorAckTimeout,
    CoprocessorHwResetOff,
    CoprocessorCfgReqTimeout,
}

impl TimerId {
    pub const COUNT: usize = 12;

    pub const ALL: [TimerId; Self::COUNT] = [
        TimerId::Retransmit,
        TimerId::Retransmit2,
        TimerId::RetransmitMqtt,
        TimerId::SendStatistics,
        TimerId::NetworkWatchdog,
        TimerId::WatchdogFeed,
        TimerId::GreenLedUpdate,
        TimerId::DoAsyncComm,
        TimerId::RecvAdvTimeout,
        TimerId::CoprocessorAckTimeout,
        TimerId::CoprocessorHwResetOff,
        TimerId::CoprocessorCfgReqTimeout,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn kind(self) -> TimerKind {
        match self {
            TimerId::Retransmit
            | TimerId::Retransmit2
            | TimerId::RetransmitMqtt
            | TimerId::SendStatistics
            | TimerId::NetworkWatchdog
            | TimerId::WatchdogFeed
            | TimerId::GreenLedUpdate => TimerKind::Periodic,
            TimerId::DoAsyncComm
            | TimerId::RecvAdvTimeout
            | TimerId::CoprocessorAckTimeout
            | TimerId::CoprocessorHwResetOff
            | TimerId::CoprocessorCfgReqTimeout => TimerKind::OneShot,
        }
    }

    /// Signal raised when the timer fires.
    #[must_use]
    pub const fn signal(self) -> Signal {
        match self {
            TimerId::Retransmit => Signal::Retransmit,
            TimerId::Retransmit2 => Signal::Retransmit2,
            TimerId::RetransmitMqtt => Signal::RetransmitMqtt,
            TimerId::SendStatistics => Signal::SendStatistics,
            TimerId::NetworkWatchdog => Signal::NetworkWatchdog,
            TimerId::WatchdogFeed => Signal::TaskWatchdogFeed,
            TimerId::GreenLedUpdate => Signal::GreenLedUpdate,
            TimerId::DoAsyncComm => Signal::DoAsyncComm,
            TimerId::RecvAdvTimeout => Signal::RecvAdvTimeout,
            TimerId::CoprocessorAckTimeout => Signal::CoprocessorAckTimeout,
            TimerId::CoprocessorHwResetOff => Signal::CoprocessorHwResetOff,
            TimerId::CoprocessorCfgReqTimeout => Signal::CoprocessorCfgReqTimeout,
        }
    }

    /// Period the timer is created with. The message-bus timer has none until configured.
    #[must_use]
    pub const fn initial_period(self) -> Duration {
        match self {
            TimerId::Retransmit | TimerId::Retransmit2 => DEFAULT_RETRANSMIT_PERIOD,
            TimerId::RetransmitMqtt => Duration::ZERO,
            TimerId::SendStatistics => STATISTICS_PERIOD,
            TimerId::NetworkWatchdog => NETWORK_WATCHDOG_TICK,
            TimerId::WatchdogFeed => WATCHDOG_FEED_PERIOD,
            TimerId::GreenLedUpdate => GREEN_LED_UPDATE_PERIOD,
            TimerId::DoAsyncComm => DO_ASYNC_COMM_DELAY,
            TimerId::RecvAdvTimeout => RECV_ADV_TIMEOUT,
            TimerId::CoprocessorAckTimeout => COPROCESSOR_ACK_TIMEOUT,
            TimerId::CoprocessorHwResetOff => COPROCESSOR_RESET_PULSE,
            TimerId::CoprocessorCfgReqTimeout => COPROCESSOR_CFG_REQ_TIMEOUT,
        }
    }
}

/// Errors returned by timer operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerError {
    /// Periodic timers need a non-zero period to run.
    ZeroPeriod(TimerId),
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::ZeroPeriod(id) => write!(f, "timer {id:?} has a zero period"),
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct TimerSlot {
    period: Duration,
    active: bool,
    last_fired: Instant,
    deadline: Instant,
}

/// Deadline table for every [`TimerId`].
#[derive(Clone, Debug)]
pub struct TimerService {
    slots: [TimerSlot; TimerId::COUNT],
}

impl TimerService {
    #[must_use]
    pub const fn new() -> Self {
        let mut slots = [TimerSlot {
            period: Duration::ZERO,
            active: false,
            last_fired: Instant::ZERO,
            deadline: Instant::ZERO,
        }; TimerId::COUNT];
        let mut index = 0;
        while index < TimerId::COUNT {
            slots[index].period = TimerId::ALL[index].initial_period();
            index += 1;
        }
        Self { slots }
    }

    /// Arms `id` so it fires one period from `now`.
    pub fn start(&mut self, id: TimerId, now: Instant) -> Result<(), TimerError> {
        self.relaunch(id, now, true)
    }

    pub fn stop(&mut self, id: TimerId) {
        self.slots[id.index()].active = false;
    }

    pub fn stop_all(&mut self) {
        for slot in &mut self.slots {
            slot.active = false;
        }
    }

    /// Re-arms `id`.
    ///
    /// With `from_now` the phase restarts at `now`; otherwise the next fire is
    /// one period after the timer last fired, or immediately if that moment
    /// has already passed.
    pub fn relaunch(&mut self, id: TimerId, now: Instant, from_now: bool) -> Result<(), TimerError> {
        let slot = &mut self.slots[id.index()];
        if id.kind() == TimerKind::Periodic && slot.period.is_zero() {
            return Err(TimerError::ZeroPeriod(id));
        }
        if from_now {
            slot.last_fired = now;
        }
        let due = slot.last_fired + slot.period;
        slot.deadline = if due < now { now } else { due };
        slot.active = true;
        Ok(())
    }

    /// Changes the period used from the next arm onwards.
    pub fn set_period(&mut self, id: TimerId, period: Duration) {
        self.slots[id.index()].period = period;
    }

    /// Sets `period` and relaunches preserving phase, unless the timer
    /// already runs with exactly that period. Returns `true` when relaunched.
    pub fn relaunch_if_period_changed(
        &mut self,
        id: TimerId,
        now: Instant,
        period: Duration,
    ) -> Result<bool, TimerError> {
        let slot = &self.slots[id.index()];
        if slot.active && slot.period == period {
            debug!("timer {:?} already running with this period", id);
            return Ok(false);
        }
        self.set_period(id, period);
        self.relaunch(id, now, false)?;
        Ok(true)
    }

    /// Pretends the timer last fired `elapsed` ago without re-arming it.
    ///
    /// An active timer moves its next fire accordingly; an inactive one keeps
    /// the timestamp for the next phase-preserving relaunch.
    pub fn postpone(&mut self, id: TimerId, now: Instant, elapsed: Duration) {
        let slot = &mut self.slots[id.index()];
        slot.last_fired = now.checked_sub(elapsed).unwrap_or(Instant::ZERO);
        if slot.active {
            let due = slot.last_fired + slot.period;
            slot.deadline = if due < now { now } else { due };
        }
    }

    /// Fires every timer whose deadline is at or before `now`.
    pub fn poll<S: SignalSink + ?Sized>(&mut self, now: Instant, sink: &S) -> SignalSet {
        let mut fired = SignalSet::EMPTY;
        for id in TimerId::ALL {
            let slot = &mut self.slots[id.index()];
            if !slot.active || slot.deadline > now {
                continue;
            }
            slot.last_fired = now;
            match id.kind() {
                TimerKind::Periodic => slot.deadline = now + slot.period,
                TimerKind::OneShot => slot.active = false,
            }
            sink.post(id.signal());
            fired = fired.with(id.signal());
        }
        fired
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter(|slot| slot.active)
            .map(|slot| slot.deadline)
            .min()
    }

    #[must_use]
    pub fn is_active(&self, id: TimerId) -> bool {
        self.slots[id.index()].active
    }

    #[must_use]
    pub fn period(&self, id: TimerId) -> Duration {
        self.slots[id.index()].period
    }

    /// Next fire of `id`, if armed.
    #[must_use]
    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        let slot = &self.slots[id.index()];
        slot.active.then_some(slot.deadline)
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalBus;

    fn secs(value: u64) -> Instant {
        Instant::from_secs(value)
    }

    #[test]
    fn table_is_indexed_by_id() {
        for (index, id) in TimerId::ALL.iter().enumerate() {
            assert_eq!(id.index(), index);
        }
    }

    #[test]
    fn periodic_timer_fires_and_rearms() {
        let mut timers = TimerService::new();
        let bus = SignalBus::new();
        timers.start(TimerId::Retransmit, secs(0)).expect("start");

        assert!(timers.poll(secs(9), &bus).is_empty());
        let fired = timers.poll(secs(10), &bus);
        assert!(fired.contains(Signal::Retransmit));
        assert_eq!(bus.take_next(), Some(Signal::Retransmit));
        assert_eq!(timers.deadline(TimerId::Retransmit), Some(secs(20)));
    }

    #[test]
    fn one_shot_disarms_after_firing() {
        let mut timers = TimerService::new();
        let bus = SignalBus::new();
        timers.start(TimerId::DoAsyncComm, secs(1)).expect("start");

        let fired = timers.poll(Instant::from_millis(1_100), &bus);
        assert!(fired.contains(Signal::DoAsyncComm));
        assert!(!timers.is_active(TimerId::DoAsyncComm));
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn zero_period_timer_cannot_start() {
        let mut timers = TimerService::new();
        assert_eq!(
            timers.start(TimerId::RetransmitMqtt, secs(0)),
            Err(TimerError::ZeroPeriod(TimerId::RetransmitMqtt))
        );
        assert!(!timers.is_active(TimerId::RetransmitMqtt));
    }

    #[test]
    fn relaunch_preserving_phase_keeps_last_fire() {
        let mut timers = TimerService::new();
        let bus = SignalBus::new();
        timers.start(TimerId::Retransmit, secs(0)).expect("start");
        timers.poll(secs(10), &bus);

        timers
            .relaunch(TimerId::Retransmit, secs(13), false)
            .expect("relaunch");
        assert_eq!(timers.deadline(TimerId::Retransmit), Some(secs(20)));

        timers
            .relaunch(TimerId::Retransmit, secs(13), true)
            .expect("relaunch");
        assert_eq!(timers.deadline(TimerId::Retransmit), Some(secs(23)));
    }

    #[test]
    fn relaunch_if_period_changed_skips_running_timer() {
        let mut timers = TimerService::new();
        timers.start(TimerId::Retransmit, secs(0)).expect("start");

        let restarted = timers
            .relaunch_if_period_changed(TimerId::Retransmit, secs(5), DEFAULT_RETRANSMIT_PERIOD)
            .expect("relaunch");
        assert!(!restarted);

        let restarted = timers
            .relaunch_if_period_changed(TimerId::Retransmit, secs(5), BACKOFF_PERIOD)
            .expect("relaunch");
        assert!(restarted);
        assert_eq!(timers.period(TimerId::Retransmit), BACKOFF_PERIOD);
        assert_eq!(timers.deadline(TimerId::Retransmit), Some(secs(67)));
    }

    #[test]
    fn postpone_moves_next_fire_without_changing_period() {
        let mut timers = TimerService::new();
        timers.start(TimerId::SendStatistics, secs(0)).expect("start");

        timers.postpone(
            TimerId::SendStatistics,
            secs(4_000),
            STATISTICS_PERIOD - STATISTICS_INITIAL_DELAY,
        );
        assert_eq!(timers.period(TimerId::SendStatistics), STATISTICS_PERIOD);
        assert_eq!(timers.deadline(TimerId::SendStatistics), Some(secs(4_060)));
    }

    #[test]
    fn postponed_inactive_timer_keeps_phase_for_relaunch() {
        let mut timers = TimerService::new();
        timers.postpone(
            TimerId::SendStatistics,
            secs(5_000),
            STATISTICS_PERIOD - STATISTICS_INITIAL_DELAY,
        );
        assert!(!timers.is_active(TimerId::SendStatistics));

        timers
            .relaunch(TimerId::SendStatistics, secs(5_010), false)
            .expect("relaunch");
        assert_eq!(timers.deadline(TimerId::SendStatistics), Some(secs(5_060)));
    }

    #[test]
    fn next_deadline_is_the_earliest_active_timer() {
        let mut timers = TimerService::new();
        timers.start(TimerId::Retransmit, secs(0)).expect("start");
        timers.start(TimerId::WatchdogFeed, secs(0)).expect("start");
        assert_eq!(timers.next_deadline(), Some(secs(1)));

        timers.stop_all();
        assert_eq!(timers.next_deadline(), None);
    }
}
