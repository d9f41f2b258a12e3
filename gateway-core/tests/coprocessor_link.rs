mod common;

use core::time::Duration;

use common::{Gateway, ack, rebooted, settle};
use gateway_core::config::GatewaySettings;
use gateway_core::coprocessor::protocol::{CommandId, Request, opcode};
use gateway_core::coprocessor::{ACK_RETRY_CEILING, AckDisposition, LinkPhase, ReceivePath, RxEvent};
use gateway_core::signals::Signal;
use gateway_core::telemetry::Counter;
use gateway_core::time::Instant;
use gateway_core::timers::TimerId;

#[test]
fn retry_ceiling_triggers_exactly_one_hardware_reset() {
    let gateway = Gateway::new(GatewaySettings::default());
    let now = Instant::from_secs(1);
    let mut orch = gateway.orchestrator(now);

    orch.handle(Signal::ConfigReady, now);
    orch.handle(Signal::CoprocessorCfgUpdate, now);
    gateway.signals.take_all();
    assert_eq!(orch.parts().transport.set_all_count(), 1);

    for attempt in 1..ACK_RETRY_CEILING {
        orch.handle(Signal::CoprocessorAckTimeout, now);
        assert_eq!(orch.link().ack_timeouts(), attempt);
        assert!(orch.parts().transport.resets.is_empty());
    }
    assert_eq!(
        orch.parts().transport.set_all_count(),
        usize::from(ACK_RETRY_CEILING)
    );

    orch.handle(Signal::CoprocessorAckTimeout, now);
    assert_eq!(orch.parts().transport.resets, [true]);
    assert_eq!(orch.link().ack_timeouts(), 0);
    assert_eq!(orch.link().phase(&gateway.link), LinkPhase::Resetting);
    assert!(orch.timers().is_active(TimerId::CoprocessorHwResetOff));
    assert_eq!(gateway.metrics.get(Counter::LostAcks), u32::from(ACK_RETRY_CEILING));
    assert_eq!(gateway.metrics.get(Counter::CoprocessorExtHwResets), 1);

    // Nothing is outstanding any more, so a late timeout changes nothing.
    orch.handle(Signal::CoprocessorAckTimeout, now);
    assert_eq!(orch.parts().transport.resets, [true]);
}

#[test]
fn acknowledged_command_resets_the_timeout_counter() {
    let gateway = Gateway::new(GatewaySettings::default());
    let mut rx = ReceivePath::new();
    let now = Instant::from_secs(1);
    let mut orch = gateway.orchestrator(now);

    orch.handle(Signal::ConfigReady, now);
    orch.handle(Signal::CoprocessorCfgUpdate, now);
    gateway.signals.take_all();
    for _ in 0..3 {
        orch.handle(Signal::CoprocessorAckTimeout, now);
    }
    assert_eq!(orch.link().ack_timeouts(), 3);

    let events = gateway.receive(&mut rx, &ack(opcode::SET_ALL));
    assert_eq!(
        events,
        [RxEvent::Ack(AckDisposition::Accepted(CommandId::SetAll))]
    );
    settle(&mut orch, now);

    assert_eq!(orch.link().ack_timeouts(), 0);
    assert_eq!(orch.link().phase(&gateway.link), LinkPhase::Configured);
    assert_eq!(orch.parts().indicators.configured, 1);
    assert!(!orch.timers().is_active(TimerId::CoprocessorAckTimeout));
}

#[test]
fn mismatched_ack_is_dropped_without_effect() {
    let gateway = Gateway::new(GatewaySettings::default());
    let mut rx = ReceivePath::new();
    let now = Instant::from_secs(1);
    let mut orch = gateway.orchestrator(now);

    orch.handle(Signal::ConfigReady, now);
    orch.handle(Signal::CoprocessorCfgUpdate, now);
    gateway.signals.take_all();

    let events = gateway.receive(&mut rx, &ack(opcode::LED_CTRL));
    assert_eq!(events, [RxEvent::Ack(AckDisposition::Unexpected)]);
    assert!(gateway.signals.snapshot().is_empty());
    assert!(!gateway.link.is_configured());
    assert_eq!(orch.parts().transport.set_all_count(), 1);
}

#[test]
fn reboot_inside_reset_window_is_expected() {
    let gateway = Gateway::new(GatewaySettings::default());
    let mut rx = ReceivePath::new();
    let t0 = Instant::from_secs(1);
    let mut orch = gateway.orchestrator(t0);

    orch.start(t0);
    orch.handle(Signal::ConfigReady, t0);
    settle(&mut orch, t0);
    gateway.receive(&mut rx, &ack(opcode::SET_ALL));
    settle(&mut orch, t0);
    assert!(gateway.link.is_configured());

    // Unannounced reboot: counted, and configuration is pushed again.
    gateway.receive(&mut rx, &rebooted());
    settle(&mut orch, t0);
    assert_eq!(gateway.metrics.get(Counter::CoprocessorSelfReboots), 1);
    assert_eq!(orch.parts().transport.set_all_count(), 2);
    gateway.receive(&mut rx, &ack(opcode::SET_ALL));
    settle(&mut orch, t0);

    // Reset pulse ends, the coprocessor reports in within the window.
    let released = t0 + Duration::from_millis(100);
    settle(&mut orch, released);
    assert_eq!(orch.parts().transport.resets, [true, false]);
    assert!(orch.timers().is_active(TimerId::CoprocessorCfgReqTimeout));

    gateway.receive(&mut rx, &rebooted());
    settle(&mut orch, released);
    assert_eq!(gateway.metrics.get(Counter::CoprocessorSelfReboots), 1);
    assert!(!orch.timers().is_active(TimerId::CoprocessorCfgReqTimeout));
    assert_eq!(orch.parts().transport.set_all_count(), 3);
}

#[test]
fn green_led_request_waits_for_pending_configuration_ack() {
    let gateway = Gateway::new(GatewaySettings::default());
    let mut rx = ReceivePath::new();
    let now = Instant::from_secs(1);
    let mut orch = gateway.orchestrator(now);

    orch.handle(Signal::ConfigReady, now);
    orch.handle(Signal::CoprocessorCfgUpdate, now);
    gateway.signals.take_all();
    orch.handle(Signal::GreenLedTurnOn, now);
    assert_eq!(orch.parts().transport.requests.len(), 1);
    assert_eq!(orch.link().pending_led(), Some(1500));

    gateway.receive(&mut rx, &ack(opcode::SET_ALL));
    settle(&mut orch, now);

    assert_eq!(
        orch.parts().transport.requests.last(),
        Some(&Request::LedCtrl { interval_ms: 1500 })
    );
    gateway.receive(&mut rx, &ack(opcode::LED_CTRL));
    settle(&mut orch, now);
    assert_eq!(orch.link().pending_led(), None);
}
