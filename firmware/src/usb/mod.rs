//! Dual-CDC USB composite device.
//!
//! CDC0 carries the diagnostics console, CDC1 the line protocol to the
//! uplink host that performs network transfers for the gateway.

/// Logical identifier for each USB CDC interface.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UsbPortKind {
    Console,
    Uplink,
}

pub const MAX_PACKET_SIZE: u16 = 64;

const CONTROL_BUFFER_LEN: usize = 64;
const CONFIG_DESCRIPTOR_LEN: usize = 256;
const BOS_DESCRIPTOR_LEN: usize = 256;
const MSOS_DESCRIPTOR_LEN: usize = 256;

/// User-visible strings advertised in the USB descriptors.
#[derive(Clone, Copy, Debug)]
pub struct UsbDeviceStrings {
    pub manufacturer: &'static str,
    pub product: &'static str,
    pub serial_number: Option<&'static str>,
}

impl Default for UsbDeviceStrings {
    fn default() -> Self {
        Self {
            manufacturer: "Gateway",
            product: "BLE Advertisement Gateway",
            serial_number: None,
        }
    }
}

/// Backing storage for the Embassy USB builder and CDC ACM classes.
pub struct UsbDeviceStorage {
    control_buf: [u8; CONTROL_BUFFER_LEN],
    config_descriptor: [u8; CONFIG_DESCRIPTOR_LEN],
    bos_descriptor: [u8; BOS_DESCRIPTOR_LEN],
    msos_descriptor: [u8; MSOS_DESCRIPTOR_LEN],
    console_state: embassy_usb::class::cdc_acm::State<'static>,
    uplink_state: embassy_usb::class::cdc_acm::State<'static>,
}

impl UsbDeviceStorage {
    pub fn new() -> Self {
        Self {
            control_buf: [0; CONTROL_BUFFER_LEN],
            config_descriptor: [0; CONFIG_DESCRIPTOR_LEN],
            bos_descriptor: [0; BOS_DESCRIPTOR_LEN],
            msos_descriptor: [0; MSOS_DESCRIPTOR_LEN],
            console_state: embassy_usb::class::cdc_acm::State::new(),
            uplink_state: embassy_usb::class::cdc_acm::State::new(),
        }
    }
}

/// Split handles for a CDC ACM interface.
pub struct CdcAcmHandle<D: embassy_usb::driver::Driver<'static>> {
    pub sender: embassy_usb::class::cdc_acm::Sender<'static, D>,
    pub receiver: embassy_usb::class::cdc_acm::Receiver<'static, D>,
    pub control: embassy_usb::class::cdc_acm::ControlChanged<'static>,
}

/// Owns both CDC ACM interfaces and the resulting USB device.
pub struct UsbComposite<D>
where
    D: embassy_usb::driver::Driver<'static>,
{
    pub device: embassy_usb::UsbDevice<'static, D>,
    console: Option<CdcAcmHandle<D>>,
    uplink: Option<CdcAcmHandle<D>>,
}

impl<D> UsbComposite<D>
where
    D: embassy_usb::driver::Driver<'static>,
{
    pub fn new(
        driver: D,
        storage: &'static mut UsbDeviceStorage,
        strings: UsbDeviceStrings,
    ) -> Self {
        let mut config = embassy_usb::Config::new(0x1209, 0x0001);
        config.manufacturer = Some(strings.manufacturer);
        config.product = Some(strings.product);
        config.serial_number = strings.serial_number;
        config.max_packet_size_0 = 64;
        config.max_power = 250;
        config.device_class = 0xEF;
        config.device_sub_class = 0x02;
        config.device_protocol = 0x01;
        config.composite_with_iads = true;

        let mut builder = embassy_usb::Builder::new(
            driver,
            config,
            &mut storage.config_descriptor,
            &mut storage.bos_descriptor,
            &mut storage.msos_descriptor,
            &mut storage.control_buf,
        );

        let console = embassy_usb::class::cdc_acm::CdcAcmClass::new(
            &mut builder,
            &mut storage.console_state,
            MAX_PACKET_SIZE,
        );
        let uplink = embassy_usb::class::cdc_acm::CdcAcmClass::new(
            &mut builder,
            &mut storage.uplink_state,
            MAX_PACKET_SIZE,
        );

        let (console_tx, console_rx, console_ctrl) = console.split_with_control();
        let (uplink_tx, uplink_rx, uplink_ctrl) = uplink.split_with_control();

        Self {
            device: builder.build(),
            console: Some(CdcAcmHandle {
                sender: console_tx,
                receiver: console_rx,
                control: console_ctrl,
            }),
            uplink: Some(CdcAcmHandle {
                sender: uplink_tx,
                receiver: uplink_rx,
                control: uplink_ctrl,
            }),
        }
    }

    /// Takes ownership of the requested CDC interface handles.
    pub fn take_port(&mut self, kind: UsbPortKind) -> Option<CdcAcmHandle<D>> {
        match kind {
            UsbPortKind::Console => self.console.take(),
            UsbPortKind::Uplink => self.uplink.take(),
        }
    }
}
