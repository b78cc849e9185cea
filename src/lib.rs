//! # dccgen
//!
//! A portable, no_std Rust core for NMRA S-9.2 (DCC) command stations:
//! the real-time subsystem that turns decoder commands into an
//! electrically precise rail waveform while supervising per-district
//! current.
//!
//! This crate implements the signal side of a command station using:
//! - `embedded-hal` traits for the H-bridge enable and polarity pins
//! - a 14.5 µs timer-interrupt state machine emitting run-length-encoded
//!   DCC bit streams, with idle packets filling every gap
//! - a ring of transmission slots with a lock-free hand-off protocol
//!   between the interrupt and a cooperative packet manager
//! - cascaded current averaging per district, driving overload cut-off,
//!   cross-district short recovery by phase inversion, and service-mode
//!   acknowledgment detection
//! - interrupt-safe driver sharing with `critical-section`
//!
//! ## Crate features
//! | Feature                | Description |
//! |------------------------|-------------|
//! | `std`                  | Disables `#![no_std]` for host-side builds |
//! | `timer-isr` (default)  | Shares the driver with ISRs through `critical_section` |
//! | `delayus-loop`         | Paces the generator with `embedded_hal::delay::DelayNs` instead |
//! | `prog-track` (default) | Compiles in service-mode (programming track) support |
//! | `defmt`                | Routes internal logging through `defmt` |
//! | `log`                  | Routes internal logging through the `log` facade |
//!
//! ## Software Features
//!
//! - **128-step mobile, accessory, function and service-mode packets** in
//!   pure software (no UART, no DMA)
//! - Repeated commands to one decoder coalesce onto one transmission slot
//! - Per-district spike/overload protection with timed retry and a
//!   mutually exclusive phase-flip protocol
//! - LRU function-state cache so single-function changes can be sent as
//!   the block-grouped packets the protocol requires
//! - Checksummed tunable-constants blob for non-volatile storage
//! - Fully portable across AVR and ARM Cortex-M targets
//!
//! ## Usage
//!
//! ```rust
//! # use embedded_hal_mock::eh1::digital::{Mock as Pin, State as PinState, Transaction as PinTransaction};
//! use dccgen::config::Constants;
//! use dccgen::driver::{DccDriver, PowerMode};
//! use dccgen::monitor::District;
//!
//! # let enable = Pin::new(&[PinTransaction::set(PinState::High)]);
//! # let direction = Pin::new(&[]);
//! let districts = [District::new(enable, direction, false)];
//! let mut driver: DccDriver<Pin, Pin, 1> = DccDriver::new(districts, Constants::default());
//! driver.set_power(PowerMode::Main, 0).unwrap();
//! driver.submit_mobile(3, 10, 1, None).unwrap();
//! loop {
//!     driver.manage();    // cooperative main loop
//!     driver.poll_adc(0); // driver.tick() runs from the timer ISR
//!     # break;
//! }
//! # driver.power.district_mut(0).enable.done();
//! # driver.power.district_mut(0).direction.done();
//! ```
//!
//! With the `timer-isr` feature, the driver lives in a `critical_section`
//! singleton and the ISRs go through `tick_dcc_timer!()` and
//! `feed_dcc_adc!()`; see [`timer`].
//!
//! ## Integration Notes
//!
//! - Timing precision is critical; configure the timer from
//!   [`timer::PRESET_16MHZ`] or [`timer::PRESET_20MHZ_DIV8`] (or the
//!   calculators in [`timer`]) so the tick error stays within ±1.5 %.
//! - Only one driver instance should be active at a time in
//!   interrupt-driven mode.
//! - The host-command layer (serial parser, display, EEPROM I/O) is out
//!   of scope: it submits packets, drains replies/events/errors, and
//!   stores the [`config::Constants`] blob.
//!
//! --
//! Designed for `#![no_std]` use in resource-constrained embedded
//! environments.

#![deny(
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results
)]
#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub use critical_section;

pub use heapless;

pub mod config;
pub mod consts;
pub mod driver;
pub mod encoding;
pub mod errors;
pub mod funcs;
pub(crate) mod logging;
pub mod monitor;
pub mod packet;
pub mod pending;
pub mod slots;
pub mod timer;
