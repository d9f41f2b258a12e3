use core::panic::PanicInfo;

use cortex_m::peripheral::SCB;

/// Logs the panic, then reboots the board.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    defmt::error!("panic: {}", defmt::Display2Format(info));
    cortex_m::asm::delay(1_000_000);
    SCB::sys_reset()
}
