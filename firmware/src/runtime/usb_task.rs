use embassy_futures::join::{join, join3};
use embassy_futures::select::{Either3, select3};
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_usb::class::cdc_acm::{ControlChanged, Receiver, Sender};
use embassy_usb::driver::{Driver, EndpointError};

use super::{CLOCK, CONSOLE_OUT, CONSOLE_RX, SIGNALS, UPLINK, USB_FRAME_LEN, USB_STORAGE, UsbFrame, uptime_secs};
use crate::line::{LineBuffer, LineError};
use crate::log::{info, warn};
use crate::uplink::MAX_HOST_LINE;
use crate::usb::{self, UsbDeviceStrings, UsbPortKind};

embassy_stm32::bind_interrupts!(struct UsbIrqs {
    USB_UCPD1_2 => embassy_stm32::usb::InterruptHandler<hal::peripherals::USB>;
});

#[embassy_executor::task]
pub async fn run(
    usb: Peri<'static, hal::peripherals::USB>,
    dp: Peri<'static, hal::peripherals::PA12>,
    dm: Peri<'static, hal::peripherals::PA11>,
) -> ! {
    let storage = USB_STORAGE.init(usb::UsbDeviceStorage::new());
    let driver = embassy_stm32::usb::Driver::new(usb, UsbIrqs, dp, dm);

    let mut composite = usb::UsbComposite::new(driver, storage, UsbDeviceStrings::default());

    let usb::CdcAcmHandle {
        sender: console_sender,
        receiver: console_receiver,
        control: console_control,
    } = composite
        .take_port(UsbPortKind::Console)
        .expect("console CDC interface unavailable");

    let usb::CdcAcmHandle {
        sender: uplink_sender,
        receiver: uplink_receiver,
        control: uplink_control,
    } = composite
        .take_port(UsbPortKind::Uplink)
        .expect("uplink CDC interface unavailable");

    let mut device = composite.device;

    let console_future = run_console_interface(console_sender, console_receiver, console_control);
    let uplink_future = run_uplink_interface(uplink_sender, uplink_receiver, uplink_control);

    join3(device.run(), console_future, uplink_future).await;
    loop {
        core::future::pending::<()>().await;
    }
}

async fn run_console_interface<D>(
    mut sender: Sender<'static, D>,
    mut receiver: Receiver<'static, D>,
    control: ControlChanged<'static>,
) -> !
where
    D: Driver<'static>,
{
    let console_rx = CONSOLE_RX.sender();
    let mut ingress = [0u8; USB_FRAME_LEN];
    let mut tx_packet = [0u8; USB_FRAME_LEN];

    loop {
        join(receiver.wait_connection(), sender.wait_connection()).await;
        wait_for_dtr(&control, &mut sender).await;
        CONSOLE_OUT.clear();
        let mut pending_len = 0usize;

        info!("usb: console interface connected");

        loop {
            match select3(
                receiver.read_packet(&mut ingress),
                async {
                    if pending_len == 0 {
                        pending_len = CONSOLE_OUT.read(&mut tx_packet).await;
                    }
                    sender.write_packet(&tx_packet[..pending_len]).await?;
                    pending_len = 0;
                    Ok::<(), EndpointError>(())
                },
                control.control_changed(),
            )
            .await
            {
                Either3::First(Ok(count)) => {
                    if count == 0 {
                        continue;
                    }

                    let mut frame = UsbFrame::new();
                    if frame.extend_from_slice(&ingress[..count]).is_err() {
                        warn!("usb: dropping console frame len={} (overflow)", count);
                        continue;
                    }

                    console_rx.send(frame).await;
                }
                Either3::First(Err(EndpointError::Disabled)) => {
                    warn!("usb: console interface disabled");
                    break;
                }
                Either3::First(Err(_)) => {
                    warn!("usb: console read error");
                }
                Either3::Second(Ok(())) => {}
                Either3::Second(Err(EndpointError::Disabled)) => {
                    warn!("usb: console write disabled");
                    break;
                }
                Either3::Second(Err(_)) => {
                    warn!("usb: console write error");
                }
                Either3::Third(()) => {
                    if !sender.dtr() {
                        warn!("usb: console host dropped DTR");
                        break;
                    }
                }
            }
        }

        console_rx.send(UsbFrame::new()).await;
    }
}

async fn run_uplink_interface<D>(
    mut sender: Sender<'static, D>,
    mut receiver: Receiver<'static, D>,
    control: ControlChanged<'static>,
) -> !
where
    D: Driver<'static>,
{
    let mut ingress = [0u8; USB_FRAME_LEN];
    let mut tx_packet = [0u8; USB_FRAME_LEN];
    let mut line: LineBuffer<MAX_HOST_LINE> = LineBuffer::new();

    loop {
        join(receiver.wait_connection(), sender.wait_connection()).await;
        wait_for_dtr(&control, &mut sender).await;
        line.reset();
        let mut pending_len = 0usize;

        info!("usb: uplink interface connected");

        loop {
            match select3(
                receiver.read_packet(&mut ingress),
                async {
                    if pending_len == 0 {
                        pending_len = UPLINK.read_outbound(&mut tx_packet).await;
                    }
                    sender.write_packet(&tx_packet[..pending_len]).await?;
                    pending_len = 0;
                    Ok::<(), EndpointError>(())
                },
                control.control_changed(),
            )
            .await
            {
                Either3::First(Ok(count)) => {
                    for &byte in &ingress[..count] {
                        match line.ingest(byte) {
                            None => {}
                            Some(Ok(text)) => {
                                if let Err(err) =
                                    UPLINK.handle_line(text, &SIGNALS, &CLOCK, uptime_secs())
                                {
                                    warn!("usb: uplink line ignored: {}", err);
                                }
                            }
                            Some(Err(LineError::Overflow)) => warn!("usb: uplink line too long"),
                            Some(Err(LineError::InvalidUtf8)) => warn!("usb: uplink line not UTF-8"),
                        }
                    }
                }
                Either3::First(Err(EndpointError::Disabled)) => {
                    warn!("usb: uplink interface disabled");
                    break;
                }
                Either3::First(Err(_)) => {
                    warn!("usb: uplink read error");
                }
                Either3::Second(Ok(())) => {}
                Either3::Second(Err(EndpointError::Disabled)) => {
                    warn!("usb: uplink write disabled");
                    break;
                }
                Either3::Second(Err(_)) => {
                    warn!("usb: uplink write error");
                }
                Either3::Third(()) => {
                    if !sender.dtr() {
                        warn!("usb: uplink host dropped DTR");
                        break;
                    }
                }
            }
        }

        UPLINK.detach_host(&SIGNALS);
    }
}

async fn wait_for_dtr<D>(control: &ControlChanged<'static>, sender: &mut Sender<'static, D>)
where
    D: Driver<'static>,
{
    while !sender.dtr() {
        control.control_changed().await;
    }
}
