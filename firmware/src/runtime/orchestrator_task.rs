use embassy_futures::select::select;
use embassy_stm32 as hal;
use embassy_stm32::gpio::Output;
use embassy_stm32::wdg::IndependentWatchdog;
use embassy_time::Timer;
use gateway_core::comm::LineEncoder;
use gateway_core::orchestrator::{Orchestrator, Parts, Platform, Shared};

use super::system::FirmwareSystem;
use super::{
    FRAMES, GATE, INDICATORS, LINK, METRICS, SCAN_FILTER, SETTINGS, SIGNALS, STATUS, STORE,
    UPLINK, now,
};
use crate::log::info;
use crate::shared::{SharedSettings, SharedStore};
use crate::status::StatusIndicators;
use crate::transport::UartTransport;
use crate::uplink::{UplinkBus, UplinkHttp};

struct FirmwarePlatform;

impl Platform for FirmwarePlatform {
    type Http = UplinkHttp<'static>;
    type Bus = UplinkBus<'static>;
    type Encoder = LineEncoder;
    type Transport = UartTransport<'static, Output<'static>>;
    type Indicators = StatusIndicators<'static>;
    type System = FirmwareSystem;
}

type GatewayOrchestrator = Orchestrator<'static, FirmwarePlatform, SharedSettings, SharedStore>;

#[embassy_executor::task]
pub async fn run(
    reset_line: Output<'static>,
    watchdog: IndependentWatchdog<'static, hal::peripherals::IWDG>,
    nonce_seed: u32,
) -> ! {
    let shared = Shared {
        config: &SETTINGS,
        store: &STORE,
        signals: SIGNALS.bus(),
        metrics: &METRICS,
        link: &LINK,
        gate: &GATE,
        scan_filter: &SCAN_FILTER,
    };
    let parts = Parts::<FirmwarePlatform> {
        http: UplinkHttp::new(&UPLINK),
        bus: UplinkBus::new(&UPLINK),
        encoder: LineEncoder,
        transport: UartTransport::new(&FRAMES, reset_line),
        indicators: StatusIndicators::new(&INDICATORS),
        system: FirmwareSystem::new(watchdog),
    };

    let mut orchestrator: GatewayOrchestrator = Orchestrator::new(shared, parts, nonce_seed, now());
    orchestrator.start(now());

    loop {
        let at = now();
        orchestrator.run_once(at);
        STATUS.publish(orchestrator.status(at));

        if orchestrator.is_stopped() {
            info!("orchestrator: stopped");
            break;
        }
        if SIGNALS.bus().is_pending() {
            continue;
        }

        match orchestrator.next_deadline() {
            Some(deadline) => {
                let deadline = embassy_time::Instant::from_millis(deadline.as_millis());
                select(SIGNALS.wait(), Timer::at(deadline)).await;
            }
            None => SIGNALS.wait().await,
        }
    }

    loop {
        core::future::pending::<()>().await;
    }
}
