use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::gpio::{Level, Output, Speed};
use embassy_stm32::wdg::IndependentWatchdog;
use embassy_sync::channel::Channel;
use embassy_sync::pipe::Pipe;
use gateway_core::comm::SingleFlightGate;
use gateway_core::config::{GatewaySettings, ScanFilterCache};
use gateway_core::coprocessor::CoprocessorLink;
use gateway_core::signals::{Signal, SignalSink};
use gateway_core::telemetry::Metrics;
use gateway_core::time::Instant;
use heapless::Vec;
use static_cell::StaticCell;

use crate::clock::WallClock;
use crate::shared::{GatewayMutex, SharedSettings, SharedStore};
use crate::signal::AsyncSignalBus;
use crate::status::{IndicatorState, StatusBoard};
use crate::transport::FrameQueue;
use crate::uplink::Uplink;
use crate::usb;

mod console_task;
mod coproc_task;
mod led_task;
mod orchestrator_task;
mod system;
mod usb_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

/// Bytes carried by one USB packet.
pub(super) const USB_FRAME_LEN: usize = usb::MAX_PACKET_SIZE as usize;
pub(super) type UsbFrame = Vec<u8, USB_FRAME_LEN>;

const CONSOLE_RX_DEPTH: usize = 4;
const CONSOLE_OUT_CAPACITY: usize = 8192;

/// Hardware watchdog period; the orchestrator feeds it every second.
const WATCHDOG_TIMEOUT_US: u32 = 8_000_000;

pub(super) static SIGNALS: AsyncSignalBus = AsyncSignalBus::new();
pub(super) static STORE: SharedStore = SharedStore::new();
pub(super) static SETTINGS: SharedSettings = SharedSettings::new(GatewaySettings::new());
pub(super) static METRICS: Metrics = Metrics::new();
pub(super) static LINK: CoprocessorLink = CoprocessorLink::new();
pub(super) static GATE: SingleFlightGate = SingleFlightGate::new();
pub(super) static SCAN_FILTER: ScanFilterCache = ScanFilterCache::new();
pub(super) static CLOCK: WallClock = WallClock::new();
pub(super) static STATUS: StatusBoard = StatusBoard::new();
pub(super) static INDICATORS: IndicatorState = IndicatorState::new();
pub(super) static UPLINK: Uplink = Uplink::new();
pub(super) static FRAMES: FrameQueue = Channel::new();
/// Raw bytes from the console port; an empty frame marks a disconnect.
pub(super) static CONSOLE_RX: Channel<GatewayMutex, UsbFrame, CONSOLE_RX_DEPTH> = Channel::new();
pub(super) static CONSOLE_OUT: Pipe<GatewayMutex, CONSOLE_OUT_CAPACITY> = Pipe::new();
pub(super) static USB_STORAGE: StaticCell<usb::UsbDeviceStorage> = StaticCell::new();

/// Monotonic time in the orchestrator's time base.
pub(super) fn now() -> Instant {
    Instant::from_millis(embassy_time::Instant::now().as_millis())
}

pub(super) fn uptime_secs() -> u64 {
    embassy_time::Instant::now().as_secs()
}

/// Nonce seed derived from the device unique ID so restarts of different
/// units do not share transfer nonces.
fn nonce_seed() -> u32 {
    hal::uid::uid()
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .fold(0, |seed, word| seed ^ word)
}

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let config = hal::Config::default();
    let hal::Peripherals {
        PA3,
        PA4,
        PA5,
        PB0,
        PB1,
        USB,
        PA11,
        PA12,
        USART5,
        IWDG,
        ..
    } = hal::init(config);

    SETTINGS.update(|settings| *settings = GatewaySettings::default());

    let reset_line = Output::new(PA4, Level::High, Speed::Low);
    let mut watchdog = IndependentWatchdog::new(IWDG, WATCHDOG_TIMEOUT_US);
    watchdog.unleash();

    spawner
        .spawn(orchestrator_task::run(reset_line, watchdog, nonce_seed()))
        .expect("failed to spawn orchestrator task");

    spawner
        .spawn(coproc_task::run(USART5, PB0, PB1))
        .expect("failed to spawn coprocessor task");

    spawner
        .spawn(usb_task::run(USB, PA12, PA11))
        .expect("failed to spawn USB task");

    spawner
        .spawn(console_task::run())
        .expect("failed to spawn console task");

    spawner
        .spawn(led_task::run(
            Output::new(PA5, Level::Low, Speed::Low),
            Output::new(PA3, Level::Low, Speed::Low),
        ))
        .expect("failed to spawn LED task");

    SIGNALS.post(Signal::ConfigReady);

    core::future::pending::<()>().await;
}
