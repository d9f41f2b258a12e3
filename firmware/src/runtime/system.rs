use embassy_stm32 as hal;
use embassy_stm32::wdg::IndependentWatchdog;
use gateway_core::orchestrator::{RestartReason, SystemControl};
use portable_atomic::{AtomicBool, Ordering};

use super::{CLOCK, uptime_secs};
use crate::log::{error, info};

static IMAGE_CONFIRMED: AtomicBool = AtomicBool::new(false);

/// Reset control, hardware watchdog and wall clock of the board.
pub struct FirmwareSystem {
    watchdog: IndependentWatchdog<'static, hal::peripherals::IWDG>,
}

impl FirmwareSystem {
    pub fn new(watchdog: IndependentWatchdog<'static, hal::peripherals::IWDG>) -> Self {
        Self { watchdog }
    }
}

impl SystemControl for FirmwareSystem {
    fn restart(&mut self, reason: RestartReason) {
        error!("system: restarting, {}", reason);
        cortex_m::peripheral::SCB::sys_reset();
    }

    fn feed_watchdog(&mut self) {
        self.watchdog.pet();
    }

    fn mark_image_valid(&mut self) {
        if !IMAGE_CONFIRMED.swap(true, Ordering::Relaxed) {
            info!("system: running image confirmed");
        }
    }

    fn wall_clock(&self) -> Option<u64> {
        CLOCK.now(uptime_secs())
    }
}
