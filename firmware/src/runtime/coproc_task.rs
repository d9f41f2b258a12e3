use embassy_futures::join::join;
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_stm32::usart::{BufferedUart, Config as UartConfig, DataBits, Parity, StopBits};
use embassy_time::{Duration, Timer};
use embedded_io_async::{Read, Write};
use gateway_core::config::GatewayConfig;
use gateway_core::coprocessor::protocol::MAX_FRAME_LEN;
use gateway_core::coprocessor::{ReceivePath, RxContext, RxEvent};

use super::{
    CLOCK, FRAMES, INDICATORS, LINK, METRICS, SCAN_FILTER, SETTINGS, SIGNALS, STORE, uptime_secs,
};
use crate::log::{debug, warn};
use crate::transport::FRAME_QUEUE_DEPTH;

const COPROC_UART_BUFFER_SIZE: usize = MAX_FRAME_LEN * FRAME_QUEUE_DEPTH;
const COPROC_UART_BAUD: u32 = 115_200;

static mut UART_TX_BUFFER: [u8; COPROC_UART_BUFFER_SIZE] = [0; COPROC_UART_BUFFER_SIZE];
static mut UART_RX_BUFFER: [u8; COPROC_UART_BUFFER_SIZE] = [0; COPROC_UART_BUFFER_SIZE];

embassy_stm32::bind_interrupts!(struct UartIrqs {
    USART3_4_5_6_LPUART1 => embassy_stm32::usart::BufferedInterruptHandler<hal::peripherals::USART5>;
});

#[embassy_executor::task]
pub async fn run(
    usart: Peri<'static, hal::peripherals::USART5>,
    tx_pin: Peri<'static, hal::peripherals::PB0>,
    rx_pin: Peri<'static, hal::peripherals::PB1>,
) -> ! {
    let mut config = UartConfig::default();
    config.baudrate = COPROC_UART_BAUD;
    config.data_bits = DataBits::DataBits8;
    config.stop_bits = StopBits::STOP1;
    config.parity = Parity::ParityNone;

    let uart = unsafe {
        BufferedUart::new(
            usart,
            rx_pin,
            tx_pin,
            &mut UART_TX_BUFFER,
            &mut UART_RX_BUFFER,
            UartIrqs,
            config,
        )
        .expect("failed to initialize coprocessor UART")
    };

    let (mut uart_tx, mut uart_rx) = uart.split();
    let frames = FRAMES.receiver();

    let transmit = async move {
        loop {
            let frame = frames.receive().await;
            if uart_tx.write_all(&frame).await.is_err() || uart_tx.flush().await.is_err() {
                warn!("coproc: UART write error");
                Timer::after(Duration::from_millis(5)).await;
            }
        }
    };

    let receive = async move {
        let ctx = RxContext {
            store: &STORE,
            link: &LINK,
            signals: &SIGNALS,
            metrics: &METRICS,
            scan_filter: &SCAN_FILTER,
        };
        let mut path: ReceivePath = ReceivePath::new();
        let mut ingress = [0u8; MAX_FRAME_LEN];
        loop {
            match uart_rx.read(&mut ingress).await {
                Ok(count) => {
                    for &byte in &ingress[..count] {
                        let stamp = CLOCK.stamp(SETTINGS.use_timestamps(), uptime_secs());
                        match path.push(byte, stamp, &ctx) {
                            Some(RxEvent::Stored(_, _)) => {
                                CLOCK.advance_sequence();
                                INDICATORS.record_advertisement();
                            }
                            Some(RxEvent::Rebooted) => INDICATORS.record_unconfigured(),
                            Some(event) => debug!("coproc: {}", event),
                            None => {}
                        }
                    }
                }
                Err(_) => {
                    warn!("coproc: UART read error");
                    Timer::after(Duration::from_millis(5)).await;
                }
            }
        }
    };

    join(transmit, receive).await;
    loop {
        core::future::pending::<()>().await;
    }
}
