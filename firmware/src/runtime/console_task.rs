use super::{CLOCK, CONSOLE_OUT, CONSOLE_RX, METRICS, SETTINGS, SIGNALS, STATUS, STORE, uptime_secs};
use crate::console::{ConsoleSession, FirmwareBackend};
use crate::log::warn;

#[embassy_executor::task]
pub async fn run() -> ! {
    let mut session = ConsoleSession::new(FirmwareBackend::with_clock(
        &STATUS,
        &STORE,
        &SETTINGS,
        &METRICS,
        &SIGNALS,
        &CLOCK,
        uptime_secs,
    ));
    let receiver = CONSOLE_RX.receiver();
    let mut emit = |line: &str| {
        for part in [line.as_bytes(), b"\r\n"] {
            if CONSOLE_OUT.try_write(part).ok() != Some(part.len()) {
                warn!("console: output dropped");
                return;
            }
        }
    };

    loop {
        let frame = receiver.receive().await;
        if frame.is_empty() {
            session.reset();
            continue;
        }
        for &byte in &frame {
            session.ingest(byte, &mut emit);
        }
    }
}
