/// Declares a static global `DCC_DRIVER` instance protected by a
/// `critical_section` mutex.
///
/// This macro creates a `static` singleton suitable for use in
/// interrupt-based environments, where the main loop, the timer ISR and
/// the ADC ISR all need safe access to the shared driver state.
///
/// # Arguments
/// - `$en`: The concrete type of the district enable pins (must implement
///   `OutputPin`)
/// - `$dir`: The concrete type of the district direction pins (must
///   implement `OutputPin`)
/// - `$districts`: The number of districts
///
/// # Example
/// ```rust,ignore
/// init_dcc_driver!(MyEnablePin, MyDirectionPin, 2);
/// ```
#[macro_export]
macro_rules! init_dcc_driver {
    ( $en:ty, $dir:ty, $districts:expr ) => {
        pub static DCC_DRIVER: $crate::critical_section::Mutex<
            core::cell::RefCell<Option<$crate::driver::DccDriver<$en, $dir, { $districts }>>>,
        > = $crate::critical_section::Mutex::new(core::cell::RefCell::new(None));
    };
}

/// Installs a constructed driver into the global `DCC_DRIVER` singleton
/// created by `init_dcc_driver!`.
///
/// # Arguments
/// - `$driver`: A `DccDriver` expression to move into the singleton
///
/// # Example
/// ```rust,ignore
/// fn main() {
///     let driver = DccDriver::new(districts, constants);
///     setup_dcc_driver!(driver);
/// }
/// ```
///
/// # Notes
/// - Must be called before interrupts are enabled.
/// - Requires `init_dcc_driver!` to have been used earlier.
#[macro_export]
macro_rules! setup_dcc_driver {
    ( $driver:expr ) => {
        $crate::critical_section::with(|cs| {
            let _ = DCC_DRIVER.borrow(cs).replace(Some($driver));
        });
    };
}

/// Calls `tick()` on the global `DCC_DRIVER` if it has been initialized.
///
/// This macro is intended to be invoked from the timer compare-match ISR
/// to advance the waveform generator every 14.5 µs.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn TIMER2_COMPA() {
///     tick_dcc_timer!();
/// }
/// ```
///
/// # Notes
/// - Safe to call repeatedly — does nothing until the driver is set up.
#[macro_export]
macro_rules! tick_dcc_timer {
    () => {
        $crate::critical_section::with(|cs| {
            if let Some(driver) = DCC_DRIVER.borrow(cs).borrow_mut().as_mut() {
                driver.tick();
            }
        });
    };
}

/// Hands a finished ADC conversion to the global `DCC_DRIVER` and yields
/// the next channel to arm.
///
/// Evaluates to `Option<u8>`: `Some(channel)` to select on the mux, or
/// `None` while the driver is not yet installed.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn ADC() {
///     if let Some(next) = feed_dcc_adc!(read_adc_result()) {
///         select_adc_channel(next);
///     }
/// }
/// ```
#[macro_export]
macro_rules! feed_dcc_adc {
    ( $reading:expr ) => {
        $crate::critical_section::with(|cs| {
            DCC_DRIVER
                .borrow(cs)
                .borrow_mut()
                .as_mut()
                .map(|driver| driver.adc.irq($reading))
        })
    };
}
