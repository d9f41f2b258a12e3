//! Coprocessor transmit path.
//!
//! The orchestrator hands finished frames to a bounded channel drained by the
//! UART task; the reset line is driven synchronously.

use embassy_sync::channel::{Channel, Receiver, TrySendError};
use gateway_core::coprocessor::protocol::Frame;
use gateway_core::coprocessor::{CoprocessorTransport, TransportError};

use crate::log::warn;
use crate::shared::GatewayMutex;

/// Frames waiting for the UART. SET_ALL and LED_CTRL are never outstanding
/// together more than a few at a time.
pub const FRAME_QUEUE_DEPTH: usize = 4;

pub type FrameQueue = Channel<GatewayMutex, Frame, FRAME_QUEUE_DEPTH>;

pub type FrameReceiver<'a> = Receiver<'a, GatewayMutex, Frame, FRAME_QUEUE_DEPTH>;

/// Active-low reset input of the coprocessor.
pub trait ResetLine {
    fn set_asserted(&mut self, asserted: bool);
}

/// [`CoprocessorTransport`] over the UART frame queue.
pub struct UartTransport<'a, R> {
    queue: &'a FrameQueue,
    reset: R,
}

impl<'a, R: ResetLine> UartTransport<'a, R> {
    pub const fn new(queue: &'a FrameQueue, reset: R) -> Self {
        Self { queue, reset }
    }
}

impl<R: ResetLine> CoprocessorTransport for UartTransport<'_, R> {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let frame = Frame::from_slice(frame).map_err(|_| TransportError::Io)?;
        match self.queue.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("transport: frame queue full");
                Err(TransportError::Busy)
            }
        }
    }

    fn set_reset(&mut self, asserted: bool) {
        self.reset.set_asserted(asserted);
    }
}

#[cfg(target_os = "none")]
impl ResetLine for embassy_stm32::gpio::Output<'static> {
    fn set_asserted(&mut self, asserted: bool) {
        if asserted {
            self.set_low();
        } else {
            self.set_high();
        }
    }
}

#[cfg(test)]
mod tests {
    use gateway_core::coprocessor::protocol::{encode_frame, opcode};

    use super::*;

    #[derive(Default)]
    struct RecordingReset {
        levels: Vec<bool>,
    }

    impl ResetLine for &mut RecordingReset {
        fn set_asserted(&mut self, asserted: bool) {
            self.levels.push(asserted);
        }
    }

    #[test]
    fn frames_queue_in_order_until_full() {
        let queue = FrameQueue::new();
        let mut reset = RecordingReset::default();
        let mut transport = UartTransport::new(&queue, &mut reset);

        let led = encode_frame(opcode::LED_CTRL, &1500_u16.to_le_bytes());
        for _ in 0..FRAME_QUEUE_DEPTH {
            assert_eq!(transport.write_frame(&led), Ok(()));
        }
        assert_eq!(transport.write_frame(&led), Err(TransportError::Busy));

        let receiver = queue.receiver();
        assert_eq!(receiver.try_receive().expect("queued").as_slice(), led.as_slice());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let queue = FrameQueue::new();
        let mut reset = RecordingReset::default();
        let mut transport = UartTransport::new(&queue, &mut reset);
        let bytes = [0_u8; gateway_core::coprocessor::protocol::MAX_FRAME_LEN + 1];
        assert_eq!(transport.write_frame(&bytes), Err(TransportError::Io));
        assert!(queue.is_empty());
    }

    #[test]
    fn reset_pulse_reaches_the_line() {
        let queue = FrameQueue::new();
        let mut reset = RecordingReset::default();
        {
            let mut transport = UartTransport::new(&queue, &mut reset);
            transport.set_reset(true);
            transport.set_reset(false);
        }
        assert_eq!(reset.levels, [true, false]);
    }
}
