use crate::driver::DccDriver;
use crate::timer::DCC_TICK_NS;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

/// Runs a bounded number of generator ticks paced by a blocking delay.
///
/// This is a simple timing loop for environments where a hardware timer
/// interrupt is unavailable or undesired. The caller wraps it in its own
/// `loop` to run forever, or calls it in slices to interleave the
/// cooperative work (`manage`, `poll_adc`, `periodic`) between bursts of
/// waveform generation.
///
/// Be aware that the tick call itself takes time on top of the delay, so
/// the blocking arrangement runs slightly slow; it is fine for bench
/// testing decoders but the ISR arrangement is the one that meets the
/// period budget.
///
/// # Arguments
/// - `driver`: A mutable reference to the `DccDriver` instance.
/// - `delay`: A delay provider implementing `DelayNs`, typically from the
///   HAL.
/// - `ticks`: How many 14.5 µs ticks to run before returning.
///
/// # Example
/// ```rust
/// # use embedded_hal_mock::eh1::delay::NoopDelay as Delay;
/// # use embedded_hal_mock::eh1::digital::{Mock as Pin, State as PinState, Transaction as PinTransaction};
/// use dccgen::config::Constants;
/// use dccgen::driver::DccDriver;
/// use dccgen::monitor::District;
/// use dccgen::timer::run_dcc_tick_slice;
///
/// # let enable = Pin::new(&[]);
/// # let direction = Pin::new(&[
/// #     PinTransaction::set(PinState::Low),
/// #     PinTransaction::set(PinState::Low),
/// #     PinTransaction::set(PinState::Low),
/// # ]);
/// let districts = [District::new(enable, direction, false)];
/// let mut driver: DccDriver<Pin, Pin, 1> = DccDriver::new(districts, Constants::default());
/// let mut delay = Delay::new();
///
/// run_dcc_tick_slice(&mut driver, &mut delay, 3);
/// # driver.power.district_mut(0).enable.done();
/// # driver.power.district_mut(0).direction.done();
/// ```
pub fn run_dcc_tick_slice<Delay, EN, DIR, const D: usize>(
    driver: &mut DccDriver<EN, DIR, D>,
    delay: &mut Delay,
    ticks: u32,
) where
    Delay: DelayNs,
    EN: OutputPin,
    DIR: OutputPin,
{
    for _ in 0..ticks {
        driver.tick();
        delay.delay_ns(DCC_TICK_NS);
    }
}
