//! `DO_ASYNC_COMM`: advance the in-flight transfer, then start the next one.

use crate::adv_table::AdvStore;
use crate::comm::{BusStep, CommPoll, HttpResponse, NetError, Sink, StartError};
use crate::config::GatewayConfig;
use crate::log::{debug, error, info, warn};
use crate::status::SinkStatus;
use crate::telemetry::Counter;
use crate::time::Instant;
use crate::timers::{BACKOFF_PERIOD, TimerId};

use super::{LOW_MEMORY_RESTART_THRESHOLD, Orchestrator, Platform, RestartReason};

impl<P, C, S, const N: usize> Orchestrator<'_, P, C, S, N>
where
    P: Platform,
    C: GatewayConfig + ?Sized,
    S: AdvStore<N> + ?Sized,
{
    pub(super) fn do_async_comm(&mut self, now: Instant) {
        if self.advance_in_flight(now) {
            self.arm(TimerId::DoAsyncComm, now);
            return;
        }
        if !self.state.relaying_enabled {
            debug!("orchestrator: relaying off, no transfer started");
            return;
        }
        if !self.state.can_send() {
            debug!("orchestrator: transfers deferred until network and time are ready");
            return;
        }
        self.start_next(now);
        if self.comm.in_progress().is_some() || self.state.next_pending().is_some() {
            self.arm(TimerId::DoAsyncComm, now);
        }
    }

    /// Returns `true` while a transfer still holds the gate.
    fn advance_in_flight(&mut self, now: Instant) -> bool {
        match self.comm.in_progress() {
            None => false,
            Some(Sink::MessageBus) => {
                let prefix = self.shared.config.bus_topic_prefix();
                let parts = &mut self.parts;
                match self.comm.step_bus(&mut parts.bus, &mut parts.encoder, &prefix) {
                    BusStep::Continue => true,
                    BusStep::Finished => {
                        self.transfer_succeeded(Sink::MessageBus, None, now);
                        false
                    }
                    BusStep::Failed(err) => {
                        self.transfer_failed(Sink::MessageBus, SinkStatus::Failed(err), now);
                        false
                    }
                }
            }
            Some(_) => match self.comm.poll(&mut self.parts.http) {
                CommPoll::Idle => false,
                CommPoll::Pending(_) => true,
                CommPoll::Finished { sink, result } => {
                    match result {
                        Ok(response) => self.transfer_succeeded(sink, Some(&response), now),
                        Err(err) => self.transfer_failed(sink, SinkStatus::Failed(err), now),
                    }
                    false
                }
            },
        }
    }

    /// Starts the highest-priority sink with pending data.
    fn start_next(&mut self, now: Instant) {
        while let Some(sink) = self.state.next_pending() {
            if !self.sink_ready(sink) {
                debug!("orchestrator: dropping pending {}", sink);
                self.state.set_need_send(sink, false);
                continue;
            }
            match self.start_transfer(sink, now) {
                Ok(()) => {
                    debug!("orchestrator: {} started", sink);
                    self.state.set_need_send(sink, false);
                    self.low_memory_failures = 0;
                }
                Err(StartError::Busy) => {
                    debug!("orchestrator: gate held, {} stays pending", sink);
                }
                Err(err) => {
                    warn!("orchestrator: {} not started: {}", sink, err);
                    self.state.set_need_send(sink, false);
                    if err == StartError::NoMemory {
                        self.low_memory(now);
                    }
                    self.transfer_failed(sink, SinkStatus::NotStarted(err), now);
                }
            }
            return;
        }
    }

    fn sink_ready(&self, sink: Sink) -> bool {
        match sink {
            Sink::Primary | Sink::Custom => true,
            Sink::Statistics => self.shared.config.statistics_enabled(),
            Sink::MessageBus => {
                self.shared.config.bus_enabled() && self.parts.bus.is_connected()
            }
        }
    }

    fn start_transfer(&mut self, sink: Sink, now: Instant) -> Result<(), StartError> {
        let store = self.shared.store;
        let parts = &mut self.parts;
        match sink {
            Sink::Primary | Sink::Custom => {
                let use_timestamps = self.state.use_timestamps;
                let timestamp = if use_timestamps {
                    parts.system.wall_clock().unwrap_or(0)
                } else {
                    now.saturating_duration_since(self.booted_at).as_secs()
                };
                self.comm.start_advertisements(
                    sink,
                    timestamp,
                    use_timestamps,
                    store,
                    &mut parts.http,
                    &mut parts.encoder,
                )
            }
            Sink::Statistics => self.comm.start_statistics(
                now.saturating_duration_since(self.booted_at),
                self.shared.metrics.snapshot(),
                store,
                &mut parts.http,
                &mut parts.encoder,
            ),
            Sink::MessageBus => self.comm.start_bus(store, &parts.bus),
        }
    }

    fn low_memory(&mut self, now: Instant) {
        self.shared.metrics.increment(Counter::LowMemoryEvents);
        self.low_memory_failures = self.low_memory_failures.saturating_add(1);
        if self.low_memory_failures >= LOW_MEMORY_RESTART_THRESHOLD {
            error!(
                "orchestrator: {} consecutive buffer failures at {} ms",
                self.low_memory_failures,
                now.as_millis()
            );
            self.parts.system.restart(RestartReason::LowMemory);
        }
    }

    fn transfer_succeeded(&mut self, sink: Sink, response: Option<&HttpResponse>, now: Instant) {
        self.last_success = now;
        self.sink_status[sink.index()] = SinkStatus::Delivered;
        self.parts.indicators.transfer_result(sink, true);
        if !self.image_valid {
            info!("orchestrator: first successful transfer, image confirmed");
            self.parts.system.mark_image_valid();
            self.image_valid = true;
        }

        if matches!(sink, Sink::Primary | Sink::Custom) {
            let rate = response
                .and_then(|response| response.rate_override)
                .filter(|period| !period.is_zero());
            if let Some(period) = rate {
                info!("orchestrator: {} period set to {} s by server", sink, period.as_secs());
                self.default_periods[sink.index()] = period;
            }
            self.relaunch_with_period(sink, now, self.default_period(sink));
        }
    }

    fn transfer_failed(&mut self, sink: Sink, status: SinkStatus, now: Instant) {
        self.sink_status[sink.index()] = status;
        self.parts.indicators.transfer_result(sink, false);
        if let SinkStatus::Failed(NetError::Auth) = status {
            warn!("orchestrator: {} rejected our credentials", sink);
        }
        if matches!(sink, Sink::Primary | Sink::Custom) {
            self.relaunch_with_period(sink, now, BACKOFF_PERIOD);
        }
    }
}
