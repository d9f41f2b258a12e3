use embassy_stm32::gpio::Output;
use embassy_time::{Duration, Ticker};

use super::INDICATORS;
use crate::status::LedPattern;

const BLINK_HALF_PERIOD: Duration = Duration::from_millis(250);

fn drive(led: &mut Output<'static>, pattern: LedPattern, phase: bool) {
    let lit = match pattern {
        LedPattern::Off => false,
        LedPattern::On => true,
        LedPattern::Blink => phase,
    };
    if lit {
        led.set_high();
    } else {
        led.set_low();
    }
}

#[embassy_executor::task]
pub async fn run(mut uplink_led: Output<'static>, mut radio_led: Output<'static>) -> ! {
    let mut ticker = Ticker::every(BLINK_HALF_PERIOD);
    let mut phase = false;
    loop {
        phase = !phase;
        drive(&mut uplink_led, INDICATORS.uplink_led(), phase);
        drive(&mut radio_led, INDICATORS.radio_led(), phase);
        ticker.next().await;
    }
}
