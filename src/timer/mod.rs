//! Timer and tick-loop utilities for the DCC driver.
//!
//! Logic for scheduling the 14.5 µs generator tick. This employs two
//! approaches: an interrupt service routine sharing the driver through
//! `critical_section` (`timer-isr` feature), or a blocking delay loop
//! (`delayus-loop` feature).
//!
//! Contains helpers for both arrangements, including:
//! - `compute_compare_value`: runtime compare-match calculator
//! - `const_compare_value`: compile-time compare-match calculator
//! - `run_dcc_tick_slice`: blocking tick driver for `DelayNs` (feature
//!   `delayus-loop`)
//! - `global_dcc_timer_tick`, `global_dcc_adc_feed` and the
//!   `tick_dcc_timer!()` / `feed_dcc_adc!()` wrappers (feature
//!   `timer-isr`)
//!
//! Supported presets (the tick-period error budget is ±1.5 %):
//!
//! | F_CPU  | PRESCALER | COMPARE | Tick period | Error  |
//! |--------|-----------|---------|-------------|--------|
//! | 16 MHz |         1 |     232 |    14.50 µs |  0.0 % |
//! | 20 MHz |         8 |      36 |    14.40 µs | −0.7 % |

use libm::round;

#[cfg(feature = "delayus-loop")]
mod delay;
#[cfg_attr(feature = "delayus-loop", allow(unused_imports))]
#[cfg(feature = "delayus-loop")]
pub use delay::*;

#[cfg(feature = "timer-isr")]
mod isr;
#[cfg_attr(feature = "timer-isr", allow(unused_imports))]
#[cfg(feature = "timer-isr")]
pub use isr::*;

#[cfg(feature = "timer-isr")]
mod macros;

/// The generator tick period in nanoseconds.
pub const DCC_TICK_NS: u32 = 14_500;

/// Nanoseconds per second, for the compare-value arithmetic.
const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// A validated timer configuration for one MCU clock arrangement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerPreset {
    /// CPU frequency in Hz.
    pub f_cpu: u32,
    /// Timer prescaler.
    pub prescaler: u32,
    /// Compare-match value producing (approximately) one tick per
    /// [`DCC_TICK_NS`].
    pub compare: u16,
}

/// 16 MHz clock, no prescaling: exact 14.5 µs ticks.
pub const PRESET_16MHZ: TimerPreset = TimerPreset {
    f_cpu: 16_000_000,
    prescaler: 1,
    compare: const_compare_value(16_000_000, 1, DCC_TICK_NS),
};

/// 20 MHz clock, prescale by 8: 14.4 µs ticks, −0.7 % period error.
pub const PRESET_20MHZ_DIV8: TimerPreset = TimerPreset {
    f_cpu: 20_000_000,
    prescaler: 8,
    compare: const_compare_value(20_000_000, 8, DCC_TICK_NS),
};

/// Computes the compare-match value for a CTC-style timer.
///
/// # Arguments
/// - `f_cpu`: CPU frequency in Hz
/// - `prescaler`: timer prescaler (e.g., 1, 8, 64)
/// - `tick_us`: desired tick interval in microseconds (e.g., 14.5)
///
/// # Returns
/// - Compare value (rounds to nearest integer)
pub fn compute_compare_value(f_cpu: u32, prescaler: u32, tick_us: f32) -> u16 {
    let ticks_per_second = f_cpu as f64 / prescaler as f64;
    let counts = ticks_per_second * (tick_us as f64 / 1_000_000.0);
    round(counts) as u16
}

/// Compile-time compare-match value calculator.
///
/// # Arguments
/// - `f_cpu`: CPU frequency in Hz
/// - `prescaler`: timer prescaler
/// - `tick_ns`: desired tick interval in nanoseconds (use
///   [`DCC_TICK_NS`])
///
/// # Returns
/// - Compare value (rounds to nearest integer)
pub const fn const_compare_value(f_cpu: u32, prescaler: u32, tick_ns: u32) -> u16 {
    let counts_per_second = (f_cpu / prescaler) as u64;
    ((counts_per_second * tick_ns as u64 + NANOS_PER_SECOND / 2) / NANOS_PER_SECOND) as u16
}

/// Actual tick-period error of a preset, in tenths of a percent.
///
/// Negative means the tick runs short. The DCC generator tolerates
/// ±1.5 % (±15 tenths).
pub const fn period_error_tenths(preset: &TimerPreset) -> i32 {
    let actual_ps =
        preset.compare as u64 * preset.prescaler as u64 * 1_000_000 / (preset.f_cpu as u64 / 1_000_000);
    let nominal_ps = DCC_TICK_NS as u64 * 1_000;
    ((actual_ps as i64 - nominal_ps as i64) * 1_000 / nominal_ps as i64) as i32
}
